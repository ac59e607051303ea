//! Outward progress notifications.
//!
//! A run posts one message per status transition into its channel thread and
//! edits the latest one with step and log lines. Log lines are bounded per run
//! by [`LogBudget`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use uuid::Uuid;

use crate::engine::models::{Run, RunEvent, RunEventType, RunStatus};

/// Opaque reference to a posted message, used to edit it later.
pub type MessageRef = String;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Post a new message into `thread_ref` and return a reference to it.
    async fn post_progress(&self, thread_ref: &str, text: &str) -> Result<MessageRef>;
    /// Replace the text of a previously posted message.
    async fn update_progress(&self, message_ref: &str, text: &str) -> Result<()>;
    /// The message will not be edited again.
    async fn release_progress(&self, _message_ref: &str) {}
}

#[derive(Debug, Clone)]
pub struct NotifySettings {
    /// Log and step notifications allowed per run.
    pub log_event_budget: usize,
    pub min_log_interval: Duration,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            log_event_budget: 20,
            min_log_interval: Duration::from_millis(500),
        }
    }
}

/// Per-run throttle for log-like notifications.
#[derive(Debug)]
pub struct LogBudget {
    remaining: usize,
    min_interval: Duration,
    last: Option<Instant>,
}

impl LogBudget {
    pub fn new(settings: &NotifySettings) -> Self {
        Self {
            remaining: settings.log_event_budget,
            min_interval: settings.min_log_interval,
            last: None,
        }
    }

    /// Whether a notification may be sent at `now`; consumes budget if so.
    pub fn allow(&mut self, now: Instant) -> bool {
        if self.remaining == 0 {
            return false;
        }
        if let Some(last) = self.last
            && now.duration_since(last) < self.min_interval
        {
            return false;
        }
        self.remaining -= 1;
        self.last = Some(now);
        true
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

/// Text of the message posted when a run enters `run.status`.
pub fn render_transition(run: &Run) -> String {
    let header = format!("[{}] {}", run.status, run.repo.name());
    match run.status {
        RunStatus::Queued => format!("{} queued: {}", header, run.task),
        RunStatus::Planning => format!("{} planning on {}", header, run.repo.reference),
        RunStatus::AwaitingApproval => format!(
            "{} plan ready for approval\n\n{}",
            header,
            run.summary.as_deref().unwrap_or("(no plan text)")
        ),
        RunStatus::Running => format!("{} executing the approved plan", header),
        RunStatus::Succeeded => format!(
            "{} finished\n\n{}",
            header,
            run.summary.as_deref().unwrap_or("Task completed successfully")
        ),
        RunStatus::Failed => render_failure(run, &header),
        RunStatus::Cancelled => format!("{} cancelled", header),
    }
}

fn render_failure(run: &Run, header: &str) -> String {
    let mut text = format!(
        "{} failed: {}",
        header,
        run.error.as_deref().unwrap_or("unknown error")
    );
    if let Some(summary) = run.summary.as_deref().filter(|s| !s.trim().is_empty()) {
        text.push_str("\n\nLast summary:\n");
        text.push_str(summary);
    }
    text
}

/// One-line rendering of a progress event.
pub fn render_event(event: &RunEvent) -> String {
    let first_line = event.message.lines().next().unwrap_or_default();
    let line = first_line.trim_start_matches('#').trim();
    match event.event_type {
        RunEventType::Step => format!("> {}", line),
        RunEventType::Diff => format!("~ {}", line),
        RunEventType::ApprovalRequired => format!("? {}", line),
        _ => line.to_string(),
    }
}

/// Event types that count against the log budget.
pub fn is_progress_event(event_type: RunEventType) -> bool {
    matches!(
        event_type,
        RunEventType::Log | RunEventType::Step | RunEventType::Diff | RunEventType::Status
    )
}

/// Emits notifications as `info!` records.
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn post_progress(&self, thread_ref: &str, text: &str) -> Result<MessageRef> {
        let message_ref = Uuid::new_v4().simple().to_string();
        tracing::info!(thread = %thread_ref, message_ref = %message_ref, "{}", text);
        Ok(message_ref)
    }

    async fn update_progress(&self, message_ref: &str, text: &str) -> Result<()> {
        tracing::info!(message_ref = %message_ref, "{}", text);
        Ok(())
    }
}

/// Message published by [`BroadcastSink`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Notice {
    Posted {
        thread_ref: String,
        message_ref: MessageRef,
        text: String,
    },
    Updated {
        message_ref: MessageRef,
        text: String,
    },
}

/// Broadcast a notice to all receivers as JSON.
pub fn broadcast_notice(tx: &broadcast::Sender<String>, notice: &Notice) {
    match serde_json::to_string(notice) {
        Ok(json) => {
            let _ = tx.send(json); // no receivers is fine
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize notice");
        }
    }
}

/// Publishes notices as JSON strings on a broadcast channel.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<String>,
}

impl BroadcastSink {
    pub fn new(tx: broadcast::Sender<String>) -> Self {
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl NotificationSink for BroadcastSink {
    async fn post_progress(&self, thread_ref: &str, text: &str) -> Result<MessageRef> {
        let message_ref = Uuid::new_v4().simple().to_string();
        broadcast_notice(
            &self.tx,
            &Notice::Posted {
                thread_ref: thread_ref.to_string(),
                message_ref: message_ref.clone(),
                text: text.to_string(),
            },
        );
        Ok(message_ref)
    }

    async fn update_progress(&self, message_ref: &str, text: &str) -> Result<()> {
        broadcast_notice(
            &self.tx,
            &Notice::Updated {
                message_ref: message_ref.to_string(),
                text: text.to_string(),
            },
        );
        Ok(())
    }
}

/// Forwards every notification to several sinks.
///
/// Each inner sink hands out its own message refs; the fanout returns its own
/// ref and remembers which inner refs it stands for until the ref is
/// released. A failing sink is logged and skipped.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
    refs: Mutex<HashMap<MessageRef, Vec<Option<MessageRef>>>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self {
            sinks,
            refs: Mutex::new(HashMap::new()),
        }
    }

    /// Messages posted and not yet released.
    pub async fn open_messages(&self) -> usize {
        self.refs.lock().await.len()
    }
}

#[async_trait]
impl NotificationSink for FanoutSink {
    async fn post_progress(&self, thread_ref: &str, text: &str) -> Result<MessageRef> {
        let mut inner_refs = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            match sink.post_progress(thread_ref, text).await {
                Ok(r) => inner_refs.push(Some(r)),
                Err(e) => {
                    tracing::warn!(error = %e, "Notification sink failed to post");
                    inner_refs.push(None);
                }
            }
        }
        let message_ref = Uuid::new_v4().simple().to_string();
        self.refs.lock().await.insert(message_ref.clone(), inner_refs);
        Ok(message_ref)
    }

    async fn update_progress(&self, message_ref: &str, text: &str) -> Result<()> {
        let inner_refs = self
            .refs
            .lock()
            .await
            .get(message_ref)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown message ref {}", message_ref))?;
        for (sink, inner) in self.sinks.iter().zip(inner_refs) {
            let Some(inner) = inner else { continue };
            if let Err(e) = sink.update_progress(&inner, text).await {
                tracing::warn!(error = %e, "Notification sink failed to update");
            }
        }
        Ok(())
    }

    async fn release_progress(&self, message_ref: &str) {
        let Some(inner_refs) = self.refs.lock().await.remove(message_ref) else {
            return;
        };
        for (sink, inner) in self.sinks.iter().zip(inner_refs) {
            if let Some(inner) = inner {
                sink.release_progress(&inner).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::models::RepoRef;

    fn run_with(status: RunStatus) -> Run {
        let mut run = Run::new(
            "C1",
            RepoRef::new("https://github.com/acme/widgets.git", "main"),
            "add unit tests",
        );
        run.status = status;
        run
    }

    #[test]
    fn test_log_budget_caps_count() {
        let mut budget = LogBudget::new(&NotifySettings {
            log_event_budget: 3,
            min_log_interval: Duration::ZERO,
        });
        let now = Instant::now();
        let allowed = (0..10).filter(|_| budget.allow(now)).count();
        assert_eq!(allowed, 3);
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn test_log_budget_rate_limits() {
        let mut budget = LogBudget::new(&NotifySettings {
            log_event_budget: 20,
            min_log_interval: Duration::from_millis(500),
        });
        let start = Instant::now();
        assert!(budget.allow(start));
        assert!(!budget.allow(start + Duration::from_millis(100)));
        assert!(budget.allow(start + Duration::from_millis(600)));
        assert_eq!(budget.remaining(), 18);
    }

    #[test]
    fn test_failure_text_carries_summary_and_error() {
        let mut run = run_with(RunStatus::Failed);
        run.summary = Some("1. add tests".into());
        run.error = Some("No output from agent for 30s".into());
        let text = render_transition(&run);
        assert!(text.contains("failed: No output from agent for 30s"));
        assert!(text.contains("Last summary:\n1. add tests"));
    }

    #[test]
    fn test_plan_text_in_approval_message() {
        let mut run = run_with(RunStatus::AwaitingApproval);
        run.summary = Some("Plan: touch lib.rs".into());
        let text = render_transition(&run);
        assert!(text.starts_with("[awaiting_approval] widgets"));
        assert!(text.contains("Plan: touch lib.rs"));
    }

    #[test]
    fn test_render_event_first_line() {
        let event = RunEvent::new(RunEventType::Step, "### Reading files\nmore");
        assert_eq!(render_event(&event), "> Reading files");
        assert_eq!(render_event(&RunEvent::log("plain")), "plain");
    }

    #[tokio::test]
    async fn test_broadcast_sink_publishes_json() {
        let (tx, _) = broadcast::channel(16);
        let sink = BroadcastSink::new(tx);
        let mut rx = sink.subscribe();

        let message_ref = sink.post_progress("C1/t1", "hello").await.unwrap();
        sink.update_progress(&message_ref, "edited").await.unwrap();

        let posted: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(posted["type"], "posted");
        assert_eq!(posted["data"]["thread_ref"], "C1/t1");
        assert_eq!(posted["data"]["message_ref"], message_ref.as_str());

        let updated: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(updated["type"], "updated");
        assert_eq!(updated["data"]["text"], "edited");
    }

    #[tokio::test]
    async fn test_fanout_maps_refs_to_each_sink() {
        let (tx_a, _) = broadcast::channel(16);
        let (tx_b, _) = broadcast::channel(16);
        let a = BroadcastSink::new(tx_a);
        let b = BroadcastSink::new(tx_b);
        let mut rx_a = a.subscribe();
        let mut rx_b = b.subscribe();
        let fanout = FanoutSink::new(vec![Arc::new(a), Arc::new(b)]);

        let message_ref = fanout.post_progress("C1", "start").await.unwrap();
        fanout.update_progress(&message_ref, "step").await.unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let posted: serde_json::Value =
                serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            let updated: serde_json::Value =
                serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(posted["data"]["message_ref"], updated["data"]["message_ref"]);
            assert_ne!(updated["data"]["message_ref"], message_ref.as_str());
        }
        assert!(fanout.update_progress("missing", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_fanout_forgets_released_messages() {
        let fanout = FanoutSink::new(vec![Arc::new(TracingSink)]);
        let first = fanout.post_progress("C1", "queued").await.unwrap();
        let second = fanout.post_progress("C1", "planning").await.unwrap();
        assert_eq!(fanout.open_messages().await, 2);

        fanout.release_progress(&first).await;
        assert_eq!(fanout.open_messages().await, 1);
        assert!(fanout.update_progress(&first, "late").await.is_err());
        fanout.update_progress(&second, "step").await.unwrap();

        fanout.release_progress(&second).await;
        fanout.release_progress(&second).await;
        assert_eq!(fanout.open_messages().await, 0);
    }
}
