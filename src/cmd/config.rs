//! Configuration view and validation commands — `conductor config`.

use anyhow::Result;

use conductor::config::{Config, ConductorToml};

use super::super::ConfigCommands;

fn print_toml(toml: &ConductorToml) {
    println!("[agent]");
    println!("  driver = \"{}\"", toml.agent.driver);
    if let Some(command) = &toml.agent.command {
        println!("  command = \"{}\"", command);
    }
    println!("  read_timeout_secs = {}", toml.agent.read_timeout_secs);
    println!("  startup_line_limit = {}", toml.agent.startup_line_limit);
    println!("  command_timeout_secs = {}", toml.agent.command_timeout_secs);
    println!();

    println!("[workspace]");
    if let Some(base) = &toml.workspace.base_dir {
        println!("  base_dir = \"{}\"", base.display());
    }
    println!("  clone_depth = {}", toml.workspace.clone_depth);
    if let Some(name) = &toml.workspace.git_user_name {
        println!("  git_user_name = \"{}\"", name);
    }
    if let Some(email) = &toml.workspace.git_user_email {
        println!("  git_user_email = \"{}\"", email);
    }
    println!();

    println!("[orchestrator]");
    println!("  cancel_grace_secs = {}", toml.orchestrator.cancel_grace_secs);
    println!("  approval_message = \"{}\"", toml.orchestrator.approval_message);
    println!();

    println!("[notify]");
    println!("  log_event_budget = {}", toml.notify.log_event_budget);
    println!("  min_log_interval_ms = {}", toml.notify.min_log_interval_ms);
    println!();
}

pub fn cmd_config(config: &Config, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = &config.config_path;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Conductor Configuration");
            println!("=======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No conductor.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();
            print_toml(&config.toml);

            println!("Effective values (with env/CLI overrides):");
            println!("  driver = \"{}\"", config.driver);
            println!("  agent_command = \"{}\"", config.agent_command);
            println!("  workspace_base = \"{}\"", config.toml.workspace_base().display());
            println!("  db_path = \"{}\"", config.db_path.display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No conductor.toml found. Using defaults (valid).");
                return Ok(());
            }

            let warnings = config.toml.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("conductor.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            ConductorToml::default().save(config_path)?;

            println!("Created conductor.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [agent] driver, command, timeouts");
            println!("  - [workspace] base_dir, clone_depth, git identity");
            println!("  - [orchestrator] cancel_grace_secs, approval_message");
            println!();
        }
    }

    Ok(())
}
