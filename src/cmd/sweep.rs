//! Crash recovery — `conductor sweep`.

use std::sync::Arc;

use anyhow::Result;

use conductor::config::Config;
use conductor::engine::driver::build_driver;
use conductor::engine::notify::TracingSink;
use conductor::engine::orchestrator::Orchestrator;
use conductor::engine::workspace::GitWorkspaceManager;

use super::open_store;

pub async fn cmd_sweep(config: &Config) -> Result<()> {
    let workspace_config = config.toml.workspace_config();
    let base_dir = workspace_config.base_dir.clone();
    let orchestrator = Orchestrator::new(
        build_driver(config.driver, &config.toml.agent, config.agent_command.clone()),
        Arc::new(GitWorkspaceManager::new(workspace_config)),
        Arc::new(open_store(config)?),
        Arc::new(TracingSink),
        config.toml.orchestrator_settings(),
    );

    let report = orchestrator.recover().await?;
    println!(
        "Marked {} interrupted run(s) as failed; removed {} orphan workspace(s) under {}",
        report.interrupted,
        report.orphans_removed,
        base_dir.display()
    );
    Ok(())
}
