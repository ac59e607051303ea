//! Interactive run — `conductor run`.
//!
//! Starts a run, shows progress on a spinner, asks for plan approval and
//! waits for the outcome. Ctrl-C cancels the run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast;

use conductor::config::Config;
use conductor::engine::driver::{DriverKind, build_driver};
use conductor::engine::models::{Credentials, RepoRef, RunStatus};
use conductor::engine::notify::{BroadcastSink, FanoutSink, NotificationSink, TracingSink};
use conductor::engine::orchestrator::Orchestrator;
use conductor::engine::store::{MemoryRunStore, RunStore};
use conductor::engine::workspace::GitWorkspaceManager;

use super::open_store;
use super::runs::styled_status;

pub struct RunArgs {
    pub repo: String,
    pub reference: String,
    pub task: String,
    pub channel: String,
    pub yes: bool,
    pub dry_run: bool,
}

fn placeholder_credentials() -> Credentials {
    Credentials {
        provider: "scripted".to_string(),
        model_id: "scripted".to_string(),
        api_key: "dry-run".to_string(),
        base_url: None,
    }
}

fn spinner() -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .expect("progress bar template is a valid static string"),
    );
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

/// Show the first line of each notice on the spinner.
fn follow_notices(mut rx: broadcast::Receiver<String>, bar: ProgressBar) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(json) => {
                    let Ok(notice) = serde_json::from_str::<serde_json::Value>(&json) else {
                        continue;
                    };
                    if let Some(text) = notice["data"]["text"].as_str() {
                        bar.set_message(text.lines().next().unwrap_or_default().to_string());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

pub async fn cmd_run(config: &Config, args: RunArgs) -> Result<()> {
    let driver_kind = if args.dry_run {
        DriverKind::Scripted
    } else {
        config.driver
    };
    let credentials = match driver_kind {
        DriverKind::Scripted => placeholder_credentials(),
        DriverKind::Cline => Credentials::from_env()
            .context("Agent credentials missing (set CLINE_PROVIDER, CLINE_API_KEY, CLINE_MODEL_ID)")?,
    };
    let store: Arc<dyn RunStore> = if args.dry_run {
        Arc::new(MemoryRunStore::new())
    } else {
        Arc::new(open_store(config)?)
    };

    let (notice_tx, _) = broadcast::channel(64);
    let broadcast_sink = BroadcastSink::new(notice_tx);
    let notices = broadcast_sink.subscribe();
    let sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(TracingSink), Arc::new(broadcast_sink)];

    let orchestrator = Orchestrator::new(
        build_driver(driver_kind, &config.toml.agent, config.agent_command.clone()),
        Arc::new(GitWorkspaceManager::new(config.toml.workspace_config())),
        store,
        Arc::new(FanoutSink::new(sinks)),
        config.toml.orchestrator_settings(),
    );
    println!(
        "{} {} @ {}",
        style("Run").bold(),
        style(&args.repo).cyan(),
        args.reference
    );
    println!("  {}", style(&args.task).dim());
    if args.dry_run {
        println!("  {} (scripted agent)", style("Dry run").yellow());
    }

    let bar = spinner();
    bar.set_message("Preparing workspace");
    follow_notices(notices, bar.clone());

    let run_id = match orchestrator
        .start_run(
            &args.channel,
            RepoRef::new(&args.repo, &args.reference),
            &args.task,
            &credentials,
        )
        .await
    {
        Ok(id) => id,
        Err(e) => {
            bar.finish_and_clear();
            return Err(e.into());
        }
    };

    let planned = tokio::select! {
        run = orchestrator.wait_for(run_id, |s| s == RunStatus::AwaitingApproval) => run?,
        _ = tokio::signal::ctrl_c() => {
            bar.set_message("Cancelling");
            orchestrator.cancel_run(run_id, "interrupted").await;
            orchestrator.wait_for(run_id, |s| s.is_terminal()).await?
        }
    };

    if planned.status == RunStatus::AwaitingApproval {
        let plan = planned.summary.as_deref().unwrap_or("(no plan text)").to_string();
        let approved = bar.suspend(|| -> Result<bool> {
            println!();
            println!("{}", style("Proposed plan").bold());
            println!("{}", plan);
            println!();
            if args.yes {
                println!("  {} (--yes flag)", style("Auto-approved").dim());
                return Ok(true);
            }
            Confirm::new()
                .with_prompt("Approve this plan?")
                .default(true)
                .interact()
                .context("Failed to read approval")
        })?;

        if approved {
            bar.set_message("Executing");
            if !orchestrator.approve_run(run_id).await {
                tracing::warn!(run_id = %run_id, "Approval was not accepted");
            }
        } else {
            orchestrator.cancel_run(run_id, "plan rejected").await;
        }
    }

    let finished = tokio::select! {
        run = orchestrator.wait_finished(run_id) => run?,
        _ = tokio::signal::ctrl_c() => {
            bar.set_message("Cancelling");
            orchestrator.cancel_run(run_id, "interrupted").await;
            orchestrator.wait_finished(run_id).await?
        }
    };
    bar.finish_and_clear();

    println!();
    println!("Run {} {}", run_id, styled_status(finished.status));
    if let Some(summary) = finished.summary.as_deref()
        && finished.status == RunStatus::Succeeded
    {
        println!();
        println!("{}", summary);
    }

    match finished.status {
        RunStatus::Failed => anyhow::bail!(
            "Run failed: {}",
            finished.error.as_deref().unwrap_or("unknown error")
        ),
        _ => Ok(()),
    }
}
