//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                |
//! |-----------|---------------------------------|
//! | `project` | `Init`                          |
//! | `run`     | `Run`                           |
//! | `runs`    | `Runs`, `Show`, `Stats`         |
//! | `sweep`   | `Sweep`                         |
//! | `config`  | `Config`                        |

pub mod config;
pub mod project;
pub mod run;
pub mod runs;
pub mod sweep;

pub use config::cmd_config;
pub use project::cmd_init;
pub use run::{RunArgs, cmd_run};
pub use runs::{cmd_runs, cmd_show, cmd_stats};
pub use sweep::cmd_sweep;

use anyhow::Result;
use conductor::config::Config;
use conductor::engine::store::SqliteRunStore;

/// Open the project's run database, creating `.conductor/` if needed.
pub fn open_store(config: &Config) -> Result<SqliteRunStore> {
    config.ensure_directories()?;
    SqliteRunStore::open(&config.db_path)
}
