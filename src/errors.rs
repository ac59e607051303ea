//! Typed error hierarchy for the run orchestrator.
//!
//! One enum per seam:
//! - `WorkspaceError` — workspace directory and clone failures
//! - `DriverError` — agent process failures
//! - `SetupError` — anything that stops a run before it reaches planning
//! - `RunError` — failures surfaced by the orchestrator API
//! - `TeardownError` — release failures, logged and queued for the sweep

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::engine::models::{RunId, RunStatus, describe_duration};

fn timeout_text(timeout: &Duration) -> String {
    describe_duration(*timeout)
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Failed to create workspace directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to clone {url}: {message}")]
    Clone { url: String, message: String },

    #[error("Ref '{reference}' not found in {url}")]
    InvalidRef { url: String, reference: String },

    #[error("Failed to remove workspace {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent instance did not report an address. Output: {output}")]
    InstanceCreation { output: String },

    #[error("Agent authentication failed: {0}")]
    AuthConfiguration(String),

    #[error("Task submission failed: {0}")]
    TaskSubmission(String),

    #[error("No output from agent for {}", timeout_text(.timeout))]
    StreamTimeout { timeout: Duration },

    #[error("`{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("Unknown agent instance {0}")]
    UnknownInstance(String),
}

/// A failure before the run reached planning. Fatal, never retried.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Workspace preparation failed: {0}")]
    Workspace(#[source] WorkspaceError),

    #[error("Instance creation failed: {0}")]
    InstanceCreation(#[source] DriverError),

    #[error("Auth configuration failed: {0}")]
    AuthConfiguration(#[source] DriverError),

    #[error("Task submission failed: {0}")]
    TaskSubmission(#[source] DriverError),
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Run {run_id} setup failed: {source}")]
    Setup {
        run_id: RunId,
        #[source]
        source: SetupError,
    },

    #[error("Run {0} not found")]
    NotFound(RunId),

    #[error("Cannot {operation} run {run_id} while it is {status}")]
    InvalidState {
        run_id: RunId,
        status: RunStatus,
        operation: &'static str,
    },

    #[error("Run {0} is no longer accepting commands")]
    WorkerGone(RunId),

    #[error("Agent rejected {operation}: {source}")]
    Driver {
        operation: &'static str,
        #[source]
        source: DriverError,
    },

    #[error("Run store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("Failed to take run lease: {0}")]
    Lease(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TeardownError {
    #[error("Failed to destroy instance {instance}: {source}")]
    Instance {
        instance: String,
        #[source]
        source: DriverError,
    },

    #[error("Failed to remove workspace {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: WorkspaceError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_error_wraps_driver_failure() {
        let err = SetupError::AuthConfiguration(DriverError::AuthConfiguration(
            "invalid api key".into(),
        ));
        match &err {
            SetupError::AuthConfiguration(DriverError::AuthConfiguration(msg)) => {
                assert_eq!(msg, "invalid api key");
            }
            _ => panic!("Expected AuthConfiguration variant"),
        }
        assert!(err.to_string().contains("invalid api key"));
    }

    #[test]
    fn run_error_invalid_state_names_status() {
        let run_id = uuid::Uuid::new_v4();
        let err = RunError::InvalidState {
            run_id,
            status: RunStatus::Running,
            operation: "approve",
        };
        let msg = err.to_string();
        assert!(msg.contains("approve"));
        assert!(msg.contains("running"));
        assert!(msg.contains(&run_id.to_string()));
    }

    #[test]
    fn setup_error_source_chain_is_preserved() {
        use std::error::Error as _;
        let err = RunError::Setup {
            run_id: uuid::Uuid::new_v4(),
            source: SetupError::Workspace(WorkspaceError::InvalidRef {
                url: "file:///repo".into(),
                reference: "nope".into(),
            }),
        };
        let source = err.source().expect("setup error has a source");
        assert!(source.to_string().contains("nope"));
    }

    #[test]
    fn driver_error_stream_timeout_message() {
        let err = DriverError::StreamTimeout {
            timeout: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "No output from agent for 30s");

        let err = DriverError::StreamTimeout {
            timeout: Duration::from_millis(200),
        };
        assert_eq!(err.to_string(), "No output from agent for 200ms");
    }

    #[test]
    fn teardown_error_carries_path() {
        let path = PathBuf::from("/ws/run-1");
        let err = TeardownError::Workspace {
            path: path.clone(),
            source: WorkspaceError::Remove {
                path: path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            },
        };
        match err {
            TeardownError::Workspace { path: p, .. } => assert_eq!(p, path),
            _ => panic!("Expected Workspace variant"),
        }
    }
}
