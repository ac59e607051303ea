//! Agent process drivers.
//!
//! [`AgentDriver`] is the capability interface the orchestrator talks to.
//! Implementations are selected by [`DriverKind`]:
//!
//! | Kind       | Type             | Use                                        |
//! |------------|------------------|--------------------------------------------|
//! | `cline`    | `ClineDriver`    | Spawns the `cline` CLI per run             |
//! | `scripted` | `ScriptedDriver` | Replays canned events (dry runs, tests)    |

pub mod cline;
pub mod parser;
pub mod scripted;

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::config::AgentSection;
use crate::engine::models::{Credentials, InstanceHandle, RunEvent, TaskMode, ToolResponse};
use crate::errors::DriverError;

pub use cline::{ClineConfig, ClineDriver};
pub use scripted::{Script, ScriptedDriver};

/// Lazily produced events for one attached output session.
///
/// The stream ends after yielding a `complete` or `error` event. Dropping it
/// stops the underlying reader.
pub type EventStream = Pin<Box<dyn Stream<Item = RunEvent> + Send>>;

#[async_trait]
pub trait AgentDriver: Send + Sync {
    /// Start an agent instance rooted at `workspace`.
    async fn create_instance(&self, workspace: &Path) -> Result<InstanceHandle, DriverError>;

    /// Hand provider credentials to the instance. Never logs the key.
    async fn configure_auth(
        &self,
        instance: &InstanceHandle,
        credentials: &Credentials,
    ) -> Result<(), DriverError>;

    /// Submit the task. Returns the driver's task handle.
    async fn submit_task(
        &self,
        instance: &InstanceHandle,
        prompt: &str,
        mode: TaskMode,
    ) -> Result<String, DriverError>;

    async fn stream_output(&self, instance: &InstanceHandle) -> Result<EventStream, DriverError>;

    /// Approve the pending plan and switch the agent to autonomous execution.
    async fn approve(&self, instance: &InstanceHandle, message: &str) -> Result<(), DriverError>;

    /// Approve or deny a tool request raised while executing.
    async fn respond(
        &self,
        instance: &InstanceHandle,
        response: ToolResponse,
        message: Option<&str>,
    ) -> Result<(), DriverError>;

    async fn send_message(&self, instance: &InstanceHandle, message: &str)
    -> Result<(), DriverError>;

    /// Ask the agent to stop. `Ok(false)` means the request did not reach it.
    async fn cancel(&self, instance: &InstanceHandle) -> Result<bool, DriverError>;

    /// Stop the instance and release its process. Unknown handles are a no-op.
    async fn destroy_instance(&self, instance: &InstanceHandle) -> Result<(), DriverError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    Cline,
    Scripted,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cline => "cline",
            Self::Scripted => "scripted",
        }
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cline" => Ok(Self::Cline),
            "scripted" => Ok(Self::Scripted),
            _ => Err(format!("Invalid driver: {} (expected cline or scripted)", s)),
        }
    }
}

/// Build the driver an `[agent]` section asks for.
pub fn build_driver(kind: DriverKind, agent: &AgentSection, command: String) -> Arc<dyn AgentDriver> {
    match kind {
        DriverKind::Cline => Arc::new(ClineDriver::new(ClineConfig::from_section(agent, command))),
        DriverKind::Scripted => Arc::new(ScriptedDriver::new(Script::demo())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_kind_parse() {
        assert_eq!("cline".parse::<DriverKind>().unwrap(), DriverKind::Cline);
        assert_eq!("Scripted".parse::<DriverKind>().unwrap(), DriverKind::Scripted);
        assert!("docker".parse::<DriverKind>().is_err());
    }

    #[test]
    fn test_driver_kind_toml_spelling() {
        #[derive(Deserialize)]
        struct Wrapper {
            driver: DriverKind,
        }
        let w: Wrapper = toml::from_str("driver = \"scripted\"").unwrap();
        assert_eq!(w.driver, DriverKind::Scripted);
    }
}
