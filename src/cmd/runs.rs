//! Run history — `conductor runs`, `conductor show`, `conductor stats`.

use anyhow::{Context, Result};
use console::style;

use conductor::config::Config;
use conductor::engine::models::{Run, RunFilter, RunId, RunStatus};
use conductor::engine::store::RunStore;

use super::open_store;

pub fn styled_status(status: RunStatus) -> String {
    let text = status.as_str();
    match status {
        RunStatus::Succeeded => style(text).green().to_string(),
        RunStatus::Failed => style(text).red().to_string(),
        RunStatus::Cancelled => style(text).dim().to_string(),
        RunStatus::AwaitingApproval => style(text).yellow().to_string(),
        _ => style(text).cyan().to_string(),
    }
}

fn short_id(id: RunId) -> String {
    id.simple().to_string()[..8].to_string()
}

pub async fn cmd_runs(config: &Config, status: Option<RunStatus>, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    let filter = RunFilter {
        status,
        ..Default::default()
    };
    let runs = store.list_runs(&filter, limit).await?;

    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }

    println!(
        "{:<10} {:<18} {:<12} {:<20} {}",
        "ID", "STATUS", "CHANNEL", "REPO", "CREATED"
    );
    for run in runs {
        // pad before styling so ANSI codes don't break alignment
        let status = format!("{:<18}", run.status.as_str());
        println!(
            "{:<10} {} {:<12} {:<20} {}",
            short_id(run.id),
            status.replace(run.status.as_str(), &styled_status(run.status)),
            run.channel,
            run.repo.name(),
            run.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub fn print_run(run: &Run) {
    println!("Run {}", style(run.id).bold());
    println!("  status:    {}", styled_status(run.status));
    println!("  channel:   {}", run.channel);
    println!("  repo:      {} @ {}", run.repo.url, run.repo.reference);
    println!("  task:      {}", run.task);
    println!("  created:   {}", run.created_at.to_rfc3339());
    if let Some(started) = run.started_at {
        println!("  started:   {}", started.to_rfc3339());
    }
    if let Some(finished) = run.finished_at {
        println!("  finished:  {}", finished.to_rfc3339());
    }
    if let Some(instance) = &run.instance {
        println!("  instance:  {}", instance);
    }
    if let Some(path) = &run.workspace_path {
        println!("  workspace: {}", path.display());
    }
    if let Some(error) = &run.error {
        println!("  error:     {}", style(error).red());
    }
    if let Some(summary) = &run.summary {
        println!();
        println!("{}", summary);
    }
}

pub async fn cmd_show(config: &Config, id: &str) -> Result<()> {
    let run_id = RunId::parse_str(id).with_context(|| format!("Invalid run id '{}'", id))?;
    let store = open_store(config)?;
    match store.load_run(run_id).await? {
        Some(run) => {
            print_run(&run);
            Ok(())
        }
        None => anyhow::bail!("Run {} not found", run_id),
    }
}

pub async fn cmd_stats(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let stats = store.stats().await?;
    println!("total:     {}", stats.total);
    println!("active:    {}", stats.active);
    println!("succeeded: {}", style(stats.succeeded).green());
    println!("failed:    {}", style(stats.failed).red());
    println!("cancelled: {}", stats.cancelled);
    Ok(())
}
