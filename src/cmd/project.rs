//! Project initialization — `conductor init`.

use anyhow::Result;

use conductor::config::{Config, ConductorToml};

pub fn cmd_init(config: &Config) -> Result<()> {
    let existed = config.config_path.exists();
    config.ensure_directories()?;

    if existed {
        println!(
            "Conductor project already initialized at {}",
            config.conductor_dir.display()
        );
        return Ok(());
    }

    ConductorToml::default().save(&config.config_path)?;
    println!(
        "Initialized conductor project at {}",
        config.conductor_dir.display()
    );
    println!();
    println!("Created:");
    println!("  .conductor/");
    println!("  ├── conductor.toml  # Agent, workspace and notification settings");
    println!("  └── runs.db         # Run history (created on first run)");
    println!();
    println!("Next steps:");
    println!("  1. Set CLINE_PROVIDER, CLINE_API_KEY and CLINE_MODEL_ID (or put them in .env)");
    println!("  2. Run `conductor run --repo <url> --task \"...\"`");

    Ok(())
}
