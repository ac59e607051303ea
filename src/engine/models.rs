use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type RunId = Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Planning,
    AwaitingApproval,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Statuses in which an agent instance is alive for the run.
    pub fn has_instance(&self) -> bool {
        matches!(
            self,
            Self::Planning | Self::AwaitingApproval | Self::Running
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "planning" => Ok(Self::Planning),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunEventType {
    Status,
    Step,
    Log,
    Diff,
    TaskResponse,
    ApprovalRequired,
    Complete,
    Error,
}

impl RunEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Step => "step",
            Self::Log => "log",
            Self::Diff => "diff",
            Self::TaskResponse => "task_response",
            Self::ApprovalRequired => "approval_required",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    /// Events that end an output stream once they have been yielded.
    pub fn is_closing(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl FromStr for RunEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status" => Ok(Self::Status),
            "step" => Ok(Self::Step),
            "log" => Ok(Self::Log),
            "diff" => Ok(Self::Diff),
            "task_response" => Ok(Self::TaskResponse),
            "approval_required" => Ok(Self::ApprovalRequired),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid event type: {}", s)),
        }
    }
}

/// A structured event parsed from agent output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEvent {
    pub event_type: RunEventType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl RunEvent {
    pub fn new(event_type: RunEventType, message: impl Into<String>) -> Self {
        Self {
            event_type,
            message: message.into(),
            payload: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn log(message: impl Into<String>) -> Self {
        Self::new(RunEventType::Log, message)
    }

    pub fn complete(message: impl Into<String>) -> Self {
        Self::new(RunEventType::Complete, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(RunEventType::Error, message)
    }

    /// The error event emitted when no output line arrives within the read timeout.
    pub fn stream_timeout(timeout: Duration) -> Self {
        Self::error(format!("No output from agent for {}", describe_duration(timeout))).with_payload(
            serde_json::json!({
                "kind": "stream_timeout",
                "timeout_secs": timeout.as_secs_f64(),
                "timeout_ms": timeout.as_millis() as u64,
            }),
        )
    }

    pub fn is_stream_timeout(&self) -> bool {
        self.event_type == RunEventType::Error
            && self
                .payload
                .as_ref()
                .and_then(|p| p.get("kind"))
                .and_then(|k| k.as_str())
                == Some("stream_timeout")
    }
}

/// Repository location and the ref (branch, tag or commit) to check out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoRef {
    pub url: String,
    pub reference: String,
}

impl RepoRef {
    pub fn new(url: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reference: reference.into(),
        }
    }

    /// Last path segment of the URL without a trailing `.git`.
    pub fn name(&self) -> &str {
        let trimmed = self.url.trim_end_matches('/');
        let last = trimmed
            .rsplit(['/', ':'])
            .next()
            .unwrap_or(trimmed);
        last.strip_suffix(".git").unwrap_or(last)
    }

    /// A full hex object id is checked out as a detached commit rather than a branch.
    pub fn is_commit(&self) -> bool {
        self.reference.len() == 40 && self.reference.chars().all(|c| c.is_ascii_hexdigit())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    /// The agent proposes a plan and waits for approval.
    Plan,
    /// The agent acts without asking.
    Autonomous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolResponse {
    Approve,
    Deny,
}

/// Handle of a running agent instance (the address the CLI reports).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceHandle(pub String);

impl InstanceHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Provider credentials handed to an instance at setup. Never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub provider: String,
    pub model_id: String,
    pub api_key: String,
    pub base_url: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("provider", &self.provider)
            .field("model_id", &self.model_id)
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl Credentials {
    /// Read `CLINE_PROVIDER`, `CLINE_API_KEY`, `CLINE_MODEL_ID` and the optional
    /// `CLINE_BASE_URL`. Call after `dotenvy` has loaded `.env`.
    pub fn from_env() -> anyhow::Result<Self> {
        fn required(name: &str) -> anyhow::Result<String> {
            match std::env::var(name) {
                Ok(v) if !v.trim().is_empty() => Ok(v),
                _ => anyhow::bail!("{} is not set", name),
            }
        }
        Ok(Self {
            provider: required("CLINE_PROVIDER")?,
            api_key: required("CLINE_API_KEY")?,
            model_id: required("CLINE_MODEL_ID")?,
            base_url: std::env::var("CLINE_BASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        })
    }
}

/// One end-to-end execution of a user task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: RunId,
    pub channel: String,
    pub task: String,
    pub repo: RepoRef,
    pub status: RunStatus,
    pub instance: Option<InstanceHandle>,
    pub task_id: Option<String>,
    pub workspace_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub message_ref: Option<String>,
    pub cancel_requested: bool,
}

impl Run {
    pub fn new(channel: impl Into<String>, repo: RepoRef, task: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            task: task.into(),
            repo,
            status: RunStatus::Queued,
            instance: None,
            task_id: None,
            workspace_path: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            summary: None,
            error: None,
            message_ref: None,
            cancel_requested: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub channel: Option<String>,
    /// Only runs that have not reached a terminal status.
    pub active_only: bool,
}

impl RunFilter {
    pub fn matches(&self, run: &Run) -> bool {
        self.status.is_none_or(|s| s == run.status)
            && self.channel.as_deref().is_none_or(|c| c == run.channel)
            && (!self.active_only || !run.status.is_terminal())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub total: u64,
    pub active: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// What subscribers of a single run receive.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RunUpdate {
    Transition {
        from: RunStatus,
        to: RunStatus,
        summary: Option<String>,
    },
    Event(RunEvent),
    Closed {
        status: RunStatus,
    },
}

/// Whole seconds when exact, milliseconds otherwise (`30s`, `250ms`).
pub fn describe_duration(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_roundtrip() {
        for status in [
            RunStatus::Queued,
            RunStatus::Planning,
            RunStatus::AwaitingApproval,
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(RunStatus::from_str("done").is_err());
    }

    #[test]
    fn test_run_status_serializes_snake_case() {
        let json = serde_json::to_string(&RunStatus::AwaitingApproval).unwrap();
        assert_eq!(json, "\"awaiting_approval\"");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::AwaitingApproval.is_terminal());
        assert!(!RunStatus::Queued.has_instance());
        assert!(RunStatus::Running.has_instance());
    }

    #[test]
    fn test_stream_timeout_event_is_tagged() {
        let event = RunEvent::stream_timeout(Duration::from_secs(30));
        assert_eq!(event.event_type, RunEventType::Error);
        assert_eq!(event.message, "No output from agent for 30s");
        assert!(event.is_stream_timeout());
        assert!(!RunEvent::error("boom").is_stream_timeout());
    }

    #[test]
    fn test_sub_second_timeout_is_not_rounded_to_zero() {
        let event = RunEvent::stream_timeout(Duration::from_millis(250));
        assert_eq!(event.message, "No output from agent for 250ms");
        let payload = event.payload.unwrap();
        assert_eq!(payload["timeout_ms"], 250);
        assert_eq!(payload["timeout_secs"], 0.25);
        assert_eq!(describe_duration(Duration::from_millis(1500)), "1500ms");
    }

    #[test]
    fn test_repo_name() {
        assert_eq!(RepoRef::new("https://github.com/acme/widgets.git", "main").name(), "widgets");
        assert_eq!(RepoRef::new("git@github.com:acme/widgets", "main").name(), "widgets");
        assert_eq!(RepoRef::new("/tmp/local/repo/", "main").name(), "repo");
    }

    #[test]
    fn test_repo_ref_commit_detection() {
        let sha = "0123456789abcdef0123456789abcdef01234567";
        assert!(RepoRef::new("u", sha).is_commit());
        assert!(!RepoRef::new("u", "main").is_commit());
    }

    #[test]
    fn test_credentials_debug_redacts_key() {
        let creds = Credentials {
            provider: "anthropic".into(),
            model_id: "m".into(),
            api_key: "sk-secret".into(),
            base_url: None,
        };
        let dbg = format!("{:?}", creds);
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn test_run_update_tagged_json() {
        let update = RunUpdate::Closed {
            status: RunStatus::Succeeded,
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "closed");
        assert_eq!(json["data"]["status"], "succeeded");
    }
}
