//! Configuration for the run orchestrator.
//!
//! Settings are read from `.conductor/conductor.toml` and layered:
//! file → environment → CLI flags. A missing file means defaults.
//!
//! ```toml
//! [agent]
//! driver = "cline"          # or "scripted" for dry runs
//! command = "cline"
//! read_timeout_secs = 30
//! startup_line_limit = 50
//! command_timeout_secs = 60
//!
//! [workspace]
//! base_dir = "/var/lib/conductor/workspaces"
//! clone_depth = 1
//! git_user_name = "Conductor Bot"
//! git_user_email = "bot@example.com"
//!
//! [orchestrator]
//! cancel_grace_secs = 10
//! approval_message = "Proceed with the plan"
//!
//! [notify]
//! log_event_budget = 20
//! min_log_interval_ms = 500
//!
//! [store]
//! db_path = ".conductor/runs.db"
//!
//! [logging]
//! format = "text"
//! dir = ".conductor/logs"
//! ```
//!
//! Environment overrides: `CLINE_CMD`, `CONDUCTOR_WORKSPACE_DIR`, `CONDUCTOR_DB`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::driver::DriverKind;
use crate::engine::notify::NotifySettings;
use crate::engine::orchestrator::OrchestratorSettings;
use crate::engine::workspace::WorkspaceConfig;

pub const CONDUCTOR_DIR: &str = ".conductor";
pub const CONFIG_FILE: &str = "conductor.toml";
/// Run lease files live here, under the workspace root.
pub const LEASE_DIR_NAME: &str = ".leases";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default)]
    pub driver: DriverKind,
    /// Agent CLI binary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_startup_line_limit")]
    pub startup_line_limit: usize,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_startup_line_limit() -> usize {
    50
}

fn default_command_timeout_secs() -> u64 {
    60
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            driver: DriverKind::default(),
            command: None,
            read_timeout_secs: default_read_timeout_secs(),
            startup_line_limit: default_startup_line_limit(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<PathBuf>,
    /// History depth for clones; 0 clones everything.
    #[serde(default = "default_clone_depth")]
    pub clone_depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_user_email: Option<String>,
}

fn default_clone_depth() -> u32 {
    1
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            base_dir: None,
            clone_depth: default_clone_depth(),
            git_user_name: None,
            git_user_email: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    #[serde(default = "default_approval_message")]
    pub approval_message: String,
}

fn default_cancel_grace_secs() -> u64 {
    10
}

fn default_approval_message() -> String {
    "Proceed with the plan".to_string()
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            cancel_grace_secs: default_cancel_grace_secs(),
            approval_message: default_approval_message(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySection {
    /// Log and step notifications allowed per run.
    #[serde(default = "default_log_event_budget")]
    pub log_event_budget: usize,
    #[serde(default = "default_min_log_interval_ms")]
    pub min_log_interval_ms: u64,
}

fn default_log_event_budget() -> usize {
    20
}

fn default_min_log_interval_ms() -> u64 {
    500
}

impl Default for NotifySection {
    fn default() -> Self {
        Self {
            log_event_budget: default_log_event_budget(),
            min_log_interval_ms: default_min_log_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for daily-rolling log files; unset logs to stderr only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

/// The complete conductor.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorToml {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub notify: NotifySection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl ConductorToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conductor.toml")
    }

    /// Load `<dir>/conductor.toml`, or defaults when it does not exist.
    pub fn load_or_default(conductor_dir: &Path) -> Result<Self> {
        let path = conductor_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize conductor.toml")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Agent binary, with fallback to `CLINE_CMD`.
    pub fn agent_command(&self) -> String {
        self.agent
            .command
            .clone()
            .or_else(|| std::env::var("CLINE_CMD").ok())
            .unwrap_or_else(|| "cline".to_string())
    }

    /// Workspace root: `CONDUCTOR_WORKSPACE_DIR`, then the file, then the
    /// per-user data directory.
    pub fn workspace_base(&self) -> PathBuf {
        if let Ok(dir) = std::env::var("CONDUCTOR_WORKSPACE_DIR")
            && !dir.trim().is_empty()
        {
            return PathBuf::from(dir);
        }
        if let Some(dir) = &self.workspace.base_dir {
            return dir.clone();
        }
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("conductor")
            .join("workspaces")
    }

    /// Run database: `CONDUCTOR_DB`, then the file, then `.conductor/runs.db`.
    /// Relative paths resolve against `project_dir`.
    pub fn db_path(&self, project_dir: &Path) -> PathBuf {
        let configured = std::env::var("CONDUCTOR_DB")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .or_else(|| self.store.db_path.clone())
            .unwrap_or_else(|| PathBuf::from(CONDUCTOR_DIR).join("runs.db"));
        if configured.is_absolute() {
            configured
        } else {
            project_dir.join(configured)
        }
    }

    pub fn workspace_config(&self) -> WorkspaceConfig {
        WorkspaceConfig {
            base_dir: self.workspace_base(),
            clone_depth: self.workspace.clone_depth,
            git_user_name: self.workspace.git_user_name.clone(),
            git_user_email: self.workspace.git_user_email.clone(),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            cancel_grace: Duration::from_secs(self.orchestrator.cancel_grace_secs),
            approval_message: self.orchestrator.approval_message.clone(),
            lease_dir: self.workspace_base().join(LEASE_DIR_NAME),
            notify: NotifySettings {
                log_event_budget: self.notify.log_event_budget,
                min_log_interval: Duration::from_millis(self.notify.min_log_interval_ms),
            },
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.agent.read_timeout_secs == 0 {
            warnings.push("agent.read_timeout_secs is 0: every output read would time out".to_string());
        }
        if self.agent.startup_line_limit == 0 {
            warnings.push(
                "agent.startup_line_limit is 0: instance addresses can never be read".to_string(),
            );
        }
        if self.agent.command_timeout_secs == 0 {
            warnings.push("agent.command_timeout_secs is 0: agent commands would time out".to_string());
        }
        if self.orchestrator.approval_message.trim().is_empty() {
            warnings.push("orchestrator.approval_message is empty".to_string());
        }
        if self.workspace.git_user_name.is_some() != self.workspace.git_user_email.is_some() {
            warnings.push(
                "workspace.git_user_name and workspace.git_user_email should be set together"
                    .to_string(),
            );
        }
        if let Some(email) = &self.workspace.git_user_email
            && !email.contains('@')
        {
            warnings.push(format!("workspace.git_user_email '{}' is not an email address", email));
        }

        warnings
    }
}

/// Resolved runtime configuration for one CLI invocation.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub conductor_dir: PathBuf,
    pub config_path: PathBuf,
    pub toml: ConductorToml,
    pub driver: DriverKind,
    pub agent_command: String,
    pub db_path: PathBuf,
}

impl Config {
    /// Load the project's configuration, applying environment overrides and
    /// the optional config-path and driver flags.
    pub fn load(
        project_dir: &Path,
        config_path: Option<&Path>,
        driver: Option<DriverKind>,
    ) -> Result<Self> {
        let conductor_dir = project_dir.join(CONDUCTOR_DIR);
        let config_path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| conductor_dir.join(CONFIG_FILE));
        let toml = if config_path.exists() {
            ConductorToml::load(&config_path)?
        } else {
            ConductorToml::default()
        };

        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            driver: driver.unwrap_or(toml.agent.driver),
            agent_command: toml.agent_command(),
            db_path: toml.db_path(project_dir),
            conductor_dir,
            config_path,
            toml,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.conductor_dir)
            .with_context(|| format!("Failed to create {}", self.conductor_dir.display()))?;
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(())
    }
}
