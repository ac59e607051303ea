use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};

use super::{AgentDriver, EventStream};
use crate::engine::models::{
    Credentials, InstanceHandle, RunEvent, RunEventType, TaskMode, ToolResponse,
};
use crate::errors::DriverError;

/// A driver operation that a [`Script`] can make fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptStep {
    CreateInstance,
    ConfigureAuth,
    SubmitTask,
    /// Attaching output after approval.
    ExecutionStream,
    Approve,
    Cancel,
    DestroyInstance,
}

/// Canned behaviour for [`ScriptedDriver`].
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Events of the first attached stream, before approval.
    pub plan: Vec<RunEvent>,
    /// Events of streams attached after approval.
    pub execution: Vec<RunEvent>,
    /// Steps that fail once, in order of occurrence.
    pub failures: Vec<ScriptStep>,
    /// Keep the plan stream open after its events instead of ending it.
    pub stall_plan: bool,
    /// Keep the execution stream open after its events instead of ending it.
    pub stall_execution: bool,
    /// A stalled stream yields a stream-timeout error after this long.
    pub read_timeout: Option<Duration>,
    /// Whether a cancel request makes the open stream report the stop.
    pub confirm_cancel: bool,
    /// Pause before each event.
    pub event_delay: Duration,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// A short plan/execute session for `--dry-run`.
    pub fn demo() -> Self {
        Self {
            plan: vec![
                RunEvent::new(RunEventType::Status, "Agent instance ready"),
                RunEvent::new(RunEventType::Step, "### Reading repository layout"),
                RunEvent::log("Found Cargo.toml, src/, tests/"),
                RunEvent::new(
                    RunEventType::TaskResponse,
                    "Plan:\n1. Locate the affected module\n2. Apply the change\n3. Add a regression test",
                ),
            ],
            execution: vec![
                RunEvent::new(RunEventType::Step, "### Applying the change"),
                RunEvent::new(RunEventType::Diff, "diff --git a/src/lib.rs b/src/lib.rs"),
                RunEvent::log("Running tests"),
                RunEvent::complete("Applied the plan and added a regression test."),
            ],
            confirm_cancel: true,
            event_delay: Duration::from_millis(200),
            ..Self::default()
        }
    }

    pub fn plan(mut self, events: Vec<RunEvent>) -> Self {
        self.plan = events;
        self
    }

    pub fn execution(mut self, events: Vec<RunEvent>) -> Self {
        self.execution = events;
        self
    }

    pub fn fail_at(mut self, step: ScriptStep) -> Self {
        self.failures.push(step);
        self
    }

    pub fn stall_plan(mut self) -> Self {
        self.stall_plan = true;
        self
    }

    pub fn stall_execution(mut self) -> Self {
        self.stall_execution = true;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn confirm_cancel(mut self) -> Self {
        self.confirm_cancel = true;
        self
    }

    pub fn event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }
}

/// Every driver call, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    CreateInstance(PathBuf),
    ConfigureAuth { provider: String },
    SubmitTask { prompt: String, mode: TaskMode },
    StreamOutput(InstanceHandle),
    Approve(InstanceHandle),
    Respond(InstanceHandle, ToolResponse),
    SendMessage(InstanceHandle, String),
    Cancel(InstanceHandle),
    DestroyInstance(InstanceHandle),
}

struct ScriptedInstance {
    approved: bool,
    cancel_tx: watch::Sender<bool>,
}

/// In-process driver replaying a [`Script`]. Records every call.
pub struct ScriptedDriver {
    script: Script,
    failures: Mutex<Vec<ScriptStep>>,
    calls: Mutex<Vec<DriverCall>>,
    instances: Mutex<HashMap<InstanceHandle, ScriptedInstance>>,
    next_port: AtomicU64,
}

impl ScriptedDriver {
    pub fn new(script: Script) -> Self {
        Self {
            failures: Mutex::new(script.failures.clone()),
            script,
            calls: Mutex::new(Vec::new()),
            instances: Mutex::new(HashMap::new()),
            next_port: AtomicU64::new(50052),
        }
    }

    pub async fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().await.clone()
    }

    /// Number of recorded calls matching `pred`.
    pub async fn count(&self, pred: impl Fn(&DriverCall) -> bool) -> usize {
        self.calls.lock().await.iter().filter(|c| pred(c)).count()
    }

    /// Instances created and not yet destroyed.
    pub async fn live_instances(&self) -> usize {
        self.instances.lock().await.len()
    }

    async fn record(&self, call: DriverCall) {
        self.calls.lock().await.push(call);
    }

    /// Consume a scripted failure for `step`, if one is pending.
    async fn should_fail(&self, step: ScriptStep) -> bool {
        let mut failures = self.failures.lock().await;
        match failures.iter().position(|s| *s == step) {
            Some(idx) => {
                failures.remove(idx);
                true
            }
            None => false,
        }
    }

    async fn require(&self, instance: &InstanceHandle) -> Result<(), DriverError> {
        if self.instances.lock().await.contains_key(instance) {
            Ok(())
        } else {
            Err(DriverError::UnknownInstance(instance.to_string()))
        }
    }
}

struct ScriptedStream {
    queue: VecDeque<RunEvent>,
    stall: bool,
    read_timeout: Option<Duration>,
    event_delay: Duration,
    cancel_rx: watch::Receiver<bool>,
    done: bool,
}

impl ScriptedStream {
    fn cancelled_event() -> RunEvent {
        RunEvent::error("Task cancelled").with_payload(serde_json::json!({"kind": "cancelled"}))
    }

    async fn next_event(&mut self) -> Option<RunEvent> {
        if self.done {
            return None;
        }
        if *self.cancel_rx.borrow() {
            self.done = true;
            return Some(Self::cancelled_event());
        }
        if let Some(event) = self.queue.pop_front() {
            if !self.event_delay.is_zero() {
                tokio::time::sleep(self.event_delay).await;
            }
            if event.event_type.is_closing() {
                self.done = true;
            }
            return Some(event);
        }
        if !self.stall {
            self.done = true;
            return None;
        }

        let timeout = self.read_timeout;
        let expire = async move {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };
        self.done = true;
        let cancel_rx = &mut self.cancel_rx;
        let cancelled = async move { cancel_rx.wait_for(|c| *c).await.is_ok() };
        tokio::select! {
            // false: the instance was destroyed while the stream was open
            confirmed = cancelled => confirmed.then(Self::cancelled_event),
            _ = expire => Some(RunEvent::stream_timeout(timeout.unwrap_or_default())),
        }
    }
}

#[async_trait]
impl AgentDriver for ScriptedDriver {
    async fn create_instance(&self, workspace: &Path) -> Result<InstanceHandle, DriverError> {
        self.record(DriverCall::CreateInstance(workspace.to_path_buf())).await;
        if self.should_fail(ScriptStep::CreateInstance).await {
            return Err(DriverError::InstanceCreation {
                output: "scripted instance failure".to_string(),
            });
        }
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let handle = InstanceHandle(format!("127.0.0.1:{}", port));
        let (cancel_tx, _) = watch::channel(false);
        self.instances.lock().await.insert(
            handle.clone(),
            ScriptedInstance {
                approved: false,
                cancel_tx,
            },
        );
        Ok(handle)
    }

    async fn configure_auth(
        &self,
        instance: &InstanceHandle,
        credentials: &Credentials,
    ) -> Result<(), DriverError> {
        self.record(DriverCall::ConfigureAuth {
            provider: credentials.provider.clone(),
        })
        .await;
        self.require(instance).await?;
        if self.should_fail(ScriptStep::ConfigureAuth).await {
            return Err(DriverError::AuthConfiguration("scripted auth failure".to_string()));
        }
        Ok(())
    }

    async fn submit_task(
        &self,
        instance: &InstanceHandle,
        prompt: &str,
        mode: TaskMode,
    ) -> Result<String, DriverError> {
        self.record(DriverCall::SubmitTask {
            prompt: prompt.to_string(),
            mode,
        })
        .await;
        self.require(instance).await?;
        if self.should_fail(ScriptStep::SubmitTask).await {
            return Err(DriverError::TaskSubmission("scripted submit failure".to_string()));
        }
        Ok(format!("task-{}", instance))
    }

    async fn stream_output(&self, instance: &InstanceHandle) -> Result<EventStream, DriverError> {
        self.record(DriverCall::StreamOutput(instance.clone())).await;
        let instances = self.instances.lock().await;
        let state = instances
            .get(instance)
            .ok_or_else(|| DriverError::UnknownInstance(instance.to_string()))?;
        if state.approved && self.should_fail(ScriptStep::ExecutionStream).await {
            return Err(DriverError::Command {
                command: "task view --follow".to_string(),
                message: "scripted stream failure".to_string(),
            });
        }

        let (events, stall) = if state.approved {
            (self.script.execution.clone(), self.script.stall_execution)
        } else {
            (self.script.plan.clone(), self.script.stall_plan)
        };
        let stream = ScriptedStream {
            queue: events.into(),
            stall,
            read_timeout: self.script.read_timeout,
            event_delay: self.script.event_delay,
            cancel_rx: state.cancel_tx.subscribe(),
            done: false,
        };
        Ok(Box::pin(futures::stream::unfold(stream, |mut s| async move {
            s.next_event().await.map(|event| (event, s))
        })))
    }

    async fn approve(&self, instance: &InstanceHandle, _message: &str) -> Result<(), DriverError> {
        self.record(DriverCall::Approve(instance.clone())).await;
        if self.should_fail(ScriptStep::Approve).await {
            return Err(DriverError::Command {
                command: "scripted approve".to_string(),
                message: "scripted approve failure".to_string(),
            });
        }
        let mut instances = self.instances.lock().await;
        let state = instances
            .get_mut(instance)
            .ok_or_else(|| DriverError::UnknownInstance(instance.to_string()))?;
        state.approved = true;
        Ok(())
    }

    async fn respond(
        &self,
        instance: &InstanceHandle,
        response: ToolResponse,
        _message: Option<&str>,
    ) -> Result<(), DriverError> {
        self.record(DriverCall::Respond(instance.clone(), response)).await;
        self.require(instance).await
    }

    async fn send_message(
        &self,
        instance: &InstanceHandle,
        message: &str,
    ) -> Result<(), DriverError> {
        self.record(DriverCall::SendMessage(instance.clone(), message.to_string()))
            .await;
        self.require(instance).await
    }

    async fn cancel(&self, instance: &InstanceHandle) -> Result<bool, DriverError> {
        self.record(DriverCall::Cancel(instance.clone())).await;
        if self.should_fail(ScriptStep::Cancel).await {
            return Ok(false);
        }
        let instances = self.instances.lock().await;
        let state = instances
            .get(instance)
            .ok_or_else(|| DriverError::UnknownInstance(instance.to_string()))?;
        if self.script.confirm_cancel {
            state.cancel_tx.send_replace(true);
        }
        Ok(true)
    }

    async fn destroy_instance(&self, instance: &InstanceHandle) -> Result<(), DriverError> {
        self.record(DriverCall::DestroyInstance(instance.clone())).await;
        if !self.instances.lock().await.contains_key(instance) {
            return Ok(());
        }
        if self.should_fail(ScriptStep::DestroyInstance).await {
            return Err(DriverError::Command {
                command: "scripted instance kill".to_string(),
                message: "scripted destroy failure".to_string(),
            });
        }
        self.instances.lock().await.remove(instance);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn creds() -> Credentials {
        Credentials {
            provider: "anthropic".into(),
            model_id: "m".into(),
            api_key: "k".into(),
            base_url: None,
        }
    }

    #[tokio::test]
    async fn test_plan_then_execution_streams() {
        let driver = ScriptedDriver::new(
            Script::new()
                .plan(vec![RunEvent::new(RunEventType::TaskResponse, "plan")])
                .execution(vec![RunEvent::complete("done")]),
        );
        let handle = driver.create_instance(Path::new("/tmp/ws")).await.unwrap();
        driver.configure_auth(&handle, &creds()).await.unwrap();

        let plan: Vec<_> = driver.stream_output(&handle).await.unwrap().collect().await;
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].event_type, RunEventType::TaskResponse);

        driver.approve(&handle, "go").await.unwrap();
        let exec: Vec<_> = driver.stream_output(&handle).await.unwrap().collect().await;
        assert_eq!(exec[0].message, "done");
    }

    #[tokio::test]
    async fn test_failures_fire_once() {
        let driver = ScriptedDriver::new(Script::new().fail_at(ScriptStep::CreateInstance));
        assert!(driver.create_instance(Path::new("/tmp/a")).await.is_err());
        assert!(driver.create_instance(Path::new("/tmp/a")).await.is_ok());
        assert_eq!(driver.live_instances().await, 1);
    }

    #[tokio::test]
    async fn test_stalled_stream_times_out() {
        let driver = ScriptedDriver::new(
            Script::new()
                .stall_plan()
                .read_timeout(Duration::from_millis(50)),
        );
        let handle = driver.create_instance(Path::new("/tmp/ws")).await.unwrap();
        let events: Vec<_> = driver.stream_output(&handle).await.unwrap().collect().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_stream_timeout());
    }

    #[tokio::test]
    async fn test_cancel_confirms_on_open_stream() {
        let driver = std::sync::Arc::new(ScriptedDriver::new(
            Script::new().stall_execution().confirm_cancel(),
        ));
        let handle = driver.create_instance(Path::new("/tmp/ws")).await.unwrap();
        driver.approve(&handle, "go").await.unwrap();
        let mut stream = driver.stream_output(&handle).await.unwrap();

        assert!(driver.cancel(&handle).await.unwrap());
        let event = stream.next().await.unwrap();
        assert_eq!(event.event_type, RunEventType::Error);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_recorded() {
        let driver = ScriptedDriver::new(Script::new());
        let handle = driver.create_instance(Path::new("/tmp/ws")).await.unwrap();
        driver.destroy_instance(&handle).await.unwrap();
        driver.destroy_instance(&handle).await.unwrap();
        assert_eq!(driver.live_instances().await, 0);
        let destroys = driver
            .count(|c| matches!(c, DriverCall::DestroyInstance(_)))
            .await;
        assert_eq!(destroys, 2);
    }
}
