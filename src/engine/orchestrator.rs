//! Run orchestration.
//!
//! [`Orchestrator::start_run`] performs setup synchronously, then hands the
//! run to a dedicated worker task. The worker owns the [`RunMachine`] and
//! consumes a FIFO queue of [`RunSignal`]s fed by the output pump, the public
//! API and the cancel grace timer, so every change to one run is serialized.
//!
//! On reaching a terminal status the worker persists and announces the run,
//! then tears down the agent instance and the workspace once. Teardown
//! failures are queued for [`Orchestrator::sweep`].
//!
//! Each run holds a [`RunLease`] for its whole life so that another process
//! sharing the store and workspace root never mistakes it for a crashed run.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::engine::driver::{AgentDriver, EventStream};
use crate::engine::lease::{LeaseDir, RunLease};
use crate::engine::machine::{CancelOutcome, RunMachine, Transition};
use crate::engine::models::{
    Credentials, InstanceHandle, RepoRef, Run, RunEvent, RunEventType, RunFilter, RunId,
    RunStats, RunStatus, RunUpdate, TaskMode, ToolResponse,
};
use crate::engine::notify::{
    LogBudget, NotificationSink, NotifySettings, is_progress_event, render_event,
    render_transition,
};
use crate::engine::store::RunStore;
use crate::engine::workspace::{WorkspaceProvider, run_id_of};
use crate::errors::{RunError, SetupError, TeardownError};

/// Capacity of each run's update channel.
const UPDATE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// How long a cancel waits for the agent to confirm before forcing CANCELLED.
    pub cancel_grace: Duration,
    /// Sent to the agent along with an approval.
    pub approval_message: String,
    /// Where run leases are kept. Processes sharing a store must share this.
    pub lease_dir: PathBuf,
    pub notify: NotifySettings,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            cancel_grace: Duration::from_secs(10),
            approval_message: "Proceed with the plan".to_string(),
            lease_dir: std::env::temp_dir().join("conductor-leases"),
            notify: NotifySettings::default(),
        }
    }
}

type Reply = oneshot::Sender<Result<(), RunError>>;

/// Work items for a run worker.
enum RunSignal {
    /// Injected through [`Orchestrator::handle_event`].
    Event(RunEvent),
    /// Read from the attached output stream.
    Stream { generation: u64, event: RunEvent },
    StreamEnded { generation: u64 },
    Approve(Reply),
    Respond {
        response: ToolResponse,
        message: Option<String>,
        reply: Reply,
    },
    Message { text: String, reply: Reply },
    Cancel { reason: String, reply: Reply },
    GraceExpired,
}

impl RunSignal {
    fn into_reply(self) -> Option<(Reply, &'static str)> {
        match self {
            Self::Approve(reply) => Some((reply, "approve")),
            Self::Respond { reply, .. } => Some((reply, "respond to")),
            Self::Message { reply, .. } => Some((reply, "message")),
            Self::Cancel { reply, .. } => Some((reply, "cancel")),
            _ => None,
        }
    }
}

/// Registry entry for a run with a live worker.
struct ActiveRun {
    signals: mpsc::UnboundedSender<RunSignal>,
    updates: broadcast::Sender<RunUpdate>,
    snapshot: watch::Receiver<Run>,
}

#[derive(Debug, Clone)]
enum PendingTeardown {
    Instance(InstanceHandle),
    Workspace(PathBuf),
}

/// Outcome of [`Orchestrator::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Unfinished runs no live process owned, now marked FAILED.
    pub interrupted: usize,
    /// Workspace directories removed because no run owns them.
    pub orphans_removed: usize,
}

struct Inner {
    driver: Arc<dyn AgentDriver>,
    workspaces: Arc<dyn WorkspaceProvider>,
    store: Arc<dyn RunStore>,
    sink: Arc<dyn NotificationSink>,
    settings: OrchestratorSettings,
    leases: LeaseDir,
    registry: Mutex<HashMap<RunId, ActiveRun>>,
    pending: Mutex<Vec<PendingTeardown>>,
}

impl Inner {
    async fn persist(&self, run: &Run) {
        if let Err(e) = self.store.save_run(run).await {
            tracing::warn!(run_id = %run.id, status = %run.status, error = %e, "Failed to persist run");
        }
    }

    /// Post the message for the run's current status and remember its ref.
    ///
    /// Only the latest message is ever edited, so the previous one is
    /// released, and a terminal message is released right away.
    async fn announce(&self, run: &mut Run) {
        match self
            .sink
            .post_progress(&run.channel, &render_transition(run))
            .await
        {
            Ok(message_ref) => {
                if let Some(previous) = run.message_ref.replace(message_ref) {
                    self.sink.release_progress(&previous).await;
                }
            }
            Err(e) => tracing::warn!(run_id = %run.id, error = %e, "Failed to post progress"),
        }
        if run.status.is_terminal()
            && let Some(message_ref) = &run.message_ref
        {
            self.sink.release_progress(message_ref).await;
        }
    }

    /// Destroy the run's instance and workspace. Failures are queued.
    async fn release(&self, run: &Run) {
        if let Some(instance) = &run.instance
            && let Err(source) = self.driver.destroy_instance(instance).await
        {
            let err = TeardownError::Instance {
                instance: instance.to_string(),
                source,
            };
            tracing::error!(run_id = %run.id, error = %err, "Teardown failed, queued for sweep");
            self.pending
                .lock()
                .await
                .push(PendingTeardown::Instance(instance.clone()));
        }
        if let Some(path) = &run.workspace_path {
            self.release_workspace(run.id, path).await;
        }
    }

    async fn release_workspace(&self, run_id: RunId, path: &Path) {
        if let Err(source) = self.workspaces.destroy(path).await {
            let err = TeardownError::Workspace {
                path: path.to_path_buf(),
                source,
            };
            tracing::error!(run_id = %run_id, error = %err, "Teardown failed, queued for sweep");
            self.pending
                .lock()
                .await
                .push(PendingTeardown::Workspace(path.to_path_buf()));
        }
    }
}

/// Drives runs from setup to teardown. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        driver: Arc<dyn AgentDriver>,
        workspaces: Arc<dyn WorkspaceProvider>,
        store: Arc<dyn RunStore>,
        sink: Arc<dyn NotificationSink>,
        settings: OrchestratorSettings,
    ) -> Self {
        let leases = LeaseDir::new(settings.lease_dir.clone());
        Self {
            inner: Arc::new(Inner {
                driver,
                workspaces,
                store,
                sink,
                settings,
                leases,
                registry: Mutex::new(HashMap::new()),
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a run, prepare its workspace and agent, and submit the task in
    /// plan mode. Returns once the run is PLANNING and its worker is started.
    ///
    /// A setup failure leaves the run FAILED, releases whatever was acquired
    /// and is returned as [`RunError::Setup`].
    pub async fn start_run(
        &self,
        channel: &str,
        repo: RepoRef,
        task: &str,
        credentials: &Credentials,
    ) -> Result<RunId, RunError> {
        let mut machine = RunMachine::new(Run::new(channel, repo, task));
        let run_id = machine.run().id;
        tracing::info!(
            run_id = %run_id,
            repo = %machine.run().repo.url,
            reference = %machine.run().repo.reference,
            "Starting run"
        );
        let lease = self
            .inner
            .leases
            .try_acquire(run_id)
            .map_err(RunError::Lease)?
            .ok_or_else(|| RunError::Lease(std::io::Error::other("run lease is already held")))?;

        self.inner.announce(machine.run_mut()).await;
        if let Err(e) = self.inner.store.save_run(machine.run()).await {
            lease.release();
            return Err(RunError::Store(e));
        }

        if let Err(source) = self.setup(&mut machine, credentials).await {
            machine.fail(source.to_string());
            tracing::error!(run_id = %run_id, error = %source, "Run setup failed");
            self.inner.announce(machine.run_mut()).await;
            self.inner.persist(machine.run()).await;
            self.inner.release(machine.run()).await;
            lease.release();
            return Err(RunError::Setup { run_id, source });
        }

        machine.start_planning();
        tracing::info!(run_id = %run_id, status = %machine.status(), "Run transition");
        self.inner.announce(machine.run_mut()).await;
        self.inner.persist(machine.run()).await;

        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (updates_tx, _) = broadcast::channel(UPDATE_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(machine.run().clone());

        let worker = RunWorker {
            inner: self.inner.clone(),
            budget: LogBudget::new(&self.inner.settings.notify),
            machine,
            signals: signals_tx.clone(),
            updates: updates_tx.clone(),
            snapshot: snapshot_tx,
            pump: None,
            generation: 0,
            grace: None,
            lease,
        };

        // Registered before the worker can finish and deregister itself.
        let mut registry = self.inner.registry.lock().await;
        registry.insert(
            run_id,
            ActiveRun {
                signals: signals_tx,
                updates: updates_tx,
                snapshot: snapshot_rx,
            },
        );
        tokio::spawn(worker.run(signals_rx));
        drop(registry);

        Ok(run_id)
    }

    async fn setup(
        &self,
        machine: &mut RunMachine,
        credentials: &Credentials,
    ) -> Result<(), SetupError> {
        let run_id = machine.run().id;
        let repo = machine.run().repo.clone();
        let task = machine.run().task.clone();

        let path = self
            .inner
            .workspaces
            .prepare(run_id, &repo)
            .await
            .map_err(SetupError::Workspace)?;
        tracing::debug!(run_id = %run_id, workspace = %path.display(), "Workspace ready");
        machine.run_mut().workspace_path = Some(path.clone());

        let instance = self
            .inner
            .driver
            .create_instance(&path)
            .await
            .map_err(SetupError::InstanceCreation)?;
        tracing::debug!(run_id = %run_id, instance = %instance, "Agent instance ready");
        machine.run_mut().instance = Some(instance.clone());

        self.inner
            .driver
            .configure_auth(&instance, credentials)
            .await
            .map_err(SetupError::AuthConfiguration)?;

        let task_id = self
            .inner
            .driver
            .submit_task(&instance, &task, TaskMode::Plan)
            .await
            .map_err(SetupError::TaskSubmission)?;
        machine.run_mut().task_id = Some(task_id);
        Ok(())
    }

    /// Queue an event for the run's worker as if the agent had emitted it.
    pub async fn handle_event(&self, run_id: RunId, event: RunEvent) -> Result<(), RunError> {
        let signals = self.signals(run_id, "deliver events to").await?;
        signals
            .send(RunSignal::Event(event))
            .map_err(|_| RunError::WorkerGone(run_id))
    }

    pub async fn try_approve(&self, run_id: RunId) -> Result<(), RunError> {
        self.command(run_id, "approve", RunSignal::Approve).await
    }

    /// Approve the plan of a run AWAITING_APPROVAL.
    ///
    /// `false` leaves the run unchanged, except when the agent accepted but
    /// its output could not be re-attached: the run is then FAILED.
    pub async fn approve_run(&self, run_id: RunId) -> bool {
        report("approve", run_id, self.try_approve(run_id).await)
    }

    pub async fn try_cancel(&self, run_id: RunId, reason: &str) -> Result<(), RunError> {
        let reason = reason.to_string();
        self.command(run_id, "cancel", |reply| RunSignal::Cancel { reason, reply })
            .await
    }

    /// Request cancellation of a non-terminal run.
    pub async fn cancel_run(&self, run_id: RunId, reason: &str) -> bool {
        report("cancel", run_id, self.try_cancel(run_id, reason).await)
    }

    pub async fn try_respond(
        &self,
        run_id: RunId,
        response: ToolResponse,
        message: Option<&str>,
    ) -> Result<(), RunError> {
        let message = message.map(str::to_string);
        self.command(run_id, "respond to", |reply| RunSignal::Respond {
            response,
            message,
            reply,
        })
        .await
    }

    /// Answer a tool request raised while RUNNING.
    pub async fn respond_run(
        &self,
        run_id: RunId,
        response: ToolResponse,
        message: Option<&str>,
    ) -> bool {
        report(
            "respond to",
            run_id,
            self.try_respond(run_id, response, message).await,
        )
    }

    pub async fn try_message(&self, run_id: RunId, text: &str) -> Result<(), RunError> {
        let text = text.to_string();
        self.command(run_id, "message", |reply| RunSignal::Message { text, reply })
            .await
    }

    /// Send a follow-up message to the agent of a live run.
    pub async fn message_run(&self, run_id: RunId, text: &str) -> bool {
        report("message", run_id, self.try_message(run_id, text).await)
    }

    /// Current state of the run, live if it has a worker, else from the store.
    pub async fn get_run(&self, run_id: RunId) -> Result<Run, RunError> {
        let live = self
            .inner
            .registry
            .lock()
            .await
            .get(&run_id)
            .map(|active| Run::clone(&active.snapshot.borrow()));
        if let Some(run) = live {
            return Ok(run);
        }
        self.inner
            .store
            .load_run(run_id)
            .await
            .map_err(RunError::Store)?
            .ok_or(RunError::NotFound(run_id))
    }

    /// Updates for one run. The receiver closes once the run is terminal and
    /// torn down; for a run that already finished it is closed immediately.
    pub async fn subscribe(&self, run_id: RunId) -> Result<broadcast::Receiver<RunUpdate>, RunError> {
        if let Some(active) = self.inner.registry.lock().await.get(&run_id) {
            return Ok(active.updates.subscribe());
        }
        self.get_run(run_id).await?;
        let (_, rx) = broadcast::channel(1);
        Ok(rx)
    }

    /// Wait until the run's status satisfies `pred` or the run is terminal.
    pub async fn wait_for(
        &self,
        run_id: RunId,
        pred: impl Fn(RunStatus) -> bool,
    ) -> Result<Run, RunError> {
        if let Some(mut rx) = self.snapshot(run_id).await {
            let seen = rx
                .wait_for(|run| pred(run.status) || run.status.is_terminal())
                .await
                .map(|run| Run::clone(&run));
            if let Ok(run) = seen {
                return Ok(run);
            }
        }
        self.get_run(run_id).await
    }

    /// Wait until the run's worker has finished teardown.
    pub async fn wait_finished(&self, run_id: RunId) -> Result<Run, RunError> {
        if let Some(mut rx) = self.snapshot(run_id).await {
            while rx.changed().await.is_ok() {}
        }
        self.get_run(run_id).await
    }

    pub async fn list_runs(&self, filter: &RunFilter, limit: usize) -> Result<Vec<Run>, RunError> {
        self.inner
            .store
            .list_runs(filter, limit)
            .await
            .map_err(RunError::Store)
    }

    pub async fn stats(&self) -> Result<RunStats, RunError> {
        self.inner.store.stats().await.map_err(RunError::Store)
    }

    pub async fn active_runs(&self) -> Vec<RunId> {
        self.inner.registry.lock().await.keys().copied().collect()
    }

    /// Fail runs a crashed process left unfinished and remove workspace
    /// directories no live run owns.
    ///
    /// A run whose lease is held, by this process or another one, is live
    /// and left alone.
    pub async fn recover(&self) -> Result<RecoveryReport, RunError> {
        let unfinished = self
            .inner
            .store
            .list_runs(
                &RunFilter {
                    active_only: true,
                    ..Default::default()
                },
                usize::MAX,
            )
            .await
            .map_err(RunError::Store)?;
        let live: HashSet<RunId> = self.active_runs().await.into_iter().collect();

        let mut report = RecoveryReport::default();
        for run in unfinished.into_iter().filter(|r| !live.contains(&r.id)) {
            let lease = match self.inner.leases.try_acquire(run.id) {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    tracing::debug!(run_id = %run.id, status = %run.status, "Run is owned by another process");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(run_id = %run.id, error = %e, "Could not take run lease, leaving run alone");
                    continue;
                }
            };
            let run = RunMachine::interrupted(run);
            tracing::warn!(run_id = %run.id, "Run interrupted by restart");
            self.inner.persist(&run).await;
            if let Some(path) = &run.workspace_path {
                self.inner.release_workspace(run.id, path).await;
            }
            lease.release();
            report.interrupted += 1;
        }

        let own: HashSet<PathBuf> = self
            .inner
            .registry
            .lock()
            .await
            .values()
            .filter_map(|active| active.snapshot.borrow().workspace_path.clone())
            .collect();
        let leases = &self.inner.leases;
        let keep = |path: &Path| {
            own.contains(path) || run_id_of(path).is_some_and(|run_id| leases.is_held(run_id))
        };
        match self.inner.workspaces.sweep_orphans(&keep).await {
            Ok(removed) => report.orphans_removed = removed.len(),
            Err(e) => tracing::warn!(error = %e, "Orphan workspace sweep failed"),
        }
        Ok(report)
    }

    /// Retry queued teardowns. Returns how many still failed.
    pub async fn sweep(&self) -> usize {
        let pending = std::mem::take(&mut *self.inner.pending.lock().await);
        let mut remaining = Vec::new();
        for item in pending {
            let result = match &item {
                PendingTeardown::Instance(instance) => self
                    .inner
                    .driver
                    .destroy_instance(instance)
                    .await
                    .map_err(|e| e.to_string()),
                PendingTeardown::Workspace(path) => self
                    .inner
                    .workspaces
                    .destroy(path)
                    .await
                    .map_err(|e| e.to_string()),
            };
            if let Err(e) = result {
                tracing::warn!(item = ?item, error = %e, "Teardown retry failed");
                remaining.push(item);
            }
        }
        let count = remaining.len();
        self.inner.pending.lock().await.extend(remaining);
        count
    }

    pub async fn pending_teardowns(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Cancel every live run and wait for their teardown.
    pub async fn shutdown(&self) {
        let runs = self.active_runs().await;
        if !runs.is_empty() {
            tracing::info!(count = runs.len(), "Cancelling active runs");
        }
        for run_id in &runs {
            if let Err(e) = self.try_cancel(*run_id, "shutdown").await {
                tracing::debug!(run_id = %run_id, error = %e, "Cancel on shutdown skipped");
            }
        }
        for run_id in runs {
            let _ = self.wait_finished(run_id).await;
        }
    }

    async fn snapshot(&self, run_id: RunId) -> Option<watch::Receiver<Run>> {
        self.inner
            .registry
            .lock()
            .await
            .get(&run_id)
            .map(|active| active.snapshot.clone())
    }

    async fn signals(
        &self,
        run_id: RunId,
        operation: &'static str,
    ) -> Result<mpsc::UnboundedSender<RunSignal>, RunError> {
        let signals = self
            .inner
            .registry
            .lock()
            .await
            .get(&run_id)
            .map(|active| active.signals.clone());
        match signals {
            Some(signals) => Ok(signals),
            None => {
                let run = self.get_run(run_id).await?;
                Err(RunError::InvalidState {
                    run_id,
                    status: run.status,
                    operation,
                })
            }
        }
    }

    async fn command(
        &self,
        run_id: RunId,
        operation: &'static str,
        make: impl FnOnce(Reply) -> RunSignal,
    ) -> Result<(), RunError> {
        let signals = self.signals(run_id, operation).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        signals
            .send(make(reply_tx))
            .map_err(|_| RunError::WorkerGone(run_id))?;
        reply_rx.await.map_err(|_| RunError::WorkerGone(run_id))?
    }
}

fn report(operation: &str, run_id: RunId, result: Result<(), RunError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::info!(run_id = %run_id, operation, error = %e, "Request rejected");
            false
        }
    }
}

/// Owns one run from PLANNING until teardown.
struct RunWorker {
    inner: Arc<Inner>,
    machine: RunMachine,
    signals: mpsc::UnboundedSender<RunSignal>,
    updates: broadcast::Sender<RunUpdate>,
    snapshot: watch::Sender<Run>,
    budget: LogBudget,
    pump: Option<JoinHandle<()>>,
    /// Incremented on every attach and detach; stale pump output is dropped.
    generation: u64,
    grace: Option<JoinHandle<()>>,
    lease: RunLease,
}

impl RunWorker {
    fn run_id(&self) -> RunId {
        self.machine.run().id
    }

    async fn run(mut self, mut signals: mpsc::UnboundedReceiver<RunSignal>) {
        if let Err(e) = self.attach().await {
            tracing::debug!(run_id = %self.run_id(), error = %e, "Run failed before its first output");
        }
        while !self.machine.status().is_terminal() {
            let Some(signal) = signals.recv().await else {
                break;
            };
            self.handle(signal).await;
        }

        self.detach();
        if let Some(grace) = self.grace.take() {
            grace.abort();
        }
        signals.close();
        while let Ok(signal) = signals.try_recv() {
            if let Some((reply, operation)) = signal.into_reply() {
                let _ = reply.send(Err(RunError::InvalidState {
                    run_id: self.run_id(),
                    status: self.machine.status(),
                    operation,
                }));
            }
        }

        self.inner.release(self.machine.run()).await;
        self.inner.registry.lock().await.remove(&self.run_id());
        tracing::debug!(run_id = %self.run_id(), "Run worker finished");
        self.lease.release();
    }

    async fn handle(&mut self, signal: RunSignal) {
        match signal {
            RunSignal::Event(event) => self.on_event(event).await,
            RunSignal::Stream { generation, event } => {
                if generation == self.generation {
                    self.on_event(event).await;
                }
            }
            RunSignal::StreamEnded { generation } => {
                if generation == self.generation {
                    self.pump = None;
                    tracing::debug!(run_id = %self.run_id(), "Agent output ended");
                    let transition = self.machine.stream_ended();
                    self.commit(transition).await;
                }
            }
            RunSignal::Approve(reply) => {
                let result = self.approve().await;
                let _ = reply.send(result);
            }
            RunSignal::Respond {
                response,
                message,
                reply,
            } => {
                let result = self.respond(response, message.as_deref()).await;
                let _ = reply.send(result);
            }
            RunSignal::Message { text, reply } => {
                let result = self.message(&text).await;
                let _ = reply.send(result);
            }
            RunSignal::Cancel { reason, reply } => {
                let result = self.cancel(&reason).await;
                let _ = reply.send(result);
            }
            RunSignal::GraceExpired => {
                self.grace = None;
                let transition = self.machine.grace_expired();
                if transition.is_some() {
                    tracing::warn!(run_id = %self.run_id(), "Agent did not confirm cancel within grace period");
                }
                self.commit(transition).await;
            }
        }
    }

    async fn on_event(&mut self, event: RunEvent) {
        let run_id = self.run_id();
        tracing::debug!(
            run_id = %run_id,
            event_type = event.event_type.as_str(),
            "{}",
            event.message
        );
        let _ = self.updates.send(RunUpdate::Event(event.clone()));

        if event.event_type == RunEventType::ApprovalRequired {
            let channel = self.machine.run().channel.clone();
            if let Err(e) = self
                .inner
                .sink
                .post_progress(&channel, &render_event(&event))
                .await
            {
                tracing::warn!(run_id = %run_id, error = %e, "Failed to post tool request");
            }
        } else if is_progress_event(event.event_type) && self.budget.allow(Instant::now()) {
            self.update_progress(&render_event(&event)).await;
        }

        let before = (
            self.machine.run().summary.clone(),
            self.machine.run().error.clone(),
        );
        let transition = self.machine.apply_event(&event);
        if transition.is_some() {
            self.commit(transition).await;
        } else if before.0 != self.machine.run().summary || before.1 != self.machine.run().error {
            self.save().await;
        }
    }

    async fn update_progress(&self, text: &str) {
        let Some(message_ref) = self.machine.run().message_ref.as_deref() else {
            return;
        };
        if let Err(e) = self.inner.sink.update_progress(message_ref, text).await {
            tracing::warn!(run_id = %self.run_id(), error = %e, "Failed to update progress");
        }
    }

    /// Persist, announce and publish a transition.
    async fn commit(&mut self, transition: Option<Transition>) {
        let Some(Transition { from, to }) = transition else {
            return;
        };
        tracing::info!(run_id = %self.run_id(), from = %from, to = %to, "Run transition");
        if to == RunStatus::AwaitingApproval || to.is_terminal() {
            self.detach();
        }
        if to.is_terminal()
            && let Some(grace) = self.grace.take()
        {
            grace.abort();
        }

        self.inner.announce(self.machine.run_mut()).await;
        self.save().await;
        let _ = self.updates.send(RunUpdate::Transition {
            from,
            to,
            summary: self.machine.run().summary.clone(),
        });
        if to.is_terminal() {
            let _ = self.updates.send(RunUpdate::Closed { status: to });
        }
    }

    async fn save(&self) {
        self.inner.persist(self.machine.run()).await;
        self.snapshot.send_replace(self.machine.run().clone());
    }

    fn instance(&self, operation: &'static str) -> Result<InstanceHandle, RunError> {
        self.machine
            .run()
            .instance
            .clone()
            .ok_or_else(|| self.invalid(operation))
    }

    fn invalid(&self, operation: &'static str) -> RunError {
        RunError::InvalidState {
            run_id: self.run_id(),
            status: self.machine.status(),
            operation,
        }
    }

    /// Start pumping the agent's output. A failure fails the run.
    async fn attach(&mut self) -> Result<(), RunError> {
        let instance = self.instance("attach output of")?;
        match self.inner.driver.stream_output(&instance).await {
            Ok(stream) => {
                self.generation += 1;
                self.pump = Some(spawn_pump(stream, self.signals.clone(), self.generation));
                Ok(())
            }
            Err(source) => {
                tracing::error!(run_id = %self.run_id(), error = %source, "Failed to attach agent output");
                let transition = self
                    .machine
                    .fail(format!("Failed to attach agent output: {}", source));
                self.commit(transition).await;
                Err(RunError::Driver {
                    operation: "attach output",
                    source,
                })
            }
        }
    }

    fn detach(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.generation += 1;
    }

    async fn approve(&mut self) -> Result<(), RunError> {
        if self.machine.status() != RunStatus::AwaitingApproval {
            return Err(self.invalid("approve"));
        }
        let instance = self.instance("approve")?;
        self.inner
            .driver
            .approve(&instance, &self.inner.settings.approval_message)
            .await
            .map_err(|source| RunError::Driver {
                operation: "approve",
                source,
            })?;
        let transition = self.machine.approve();
        self.commit(transition).await;
        self.attach().await
    }

    async fn respond(&mut self, response: ToolResponse, message: Option<&str>) -> Result<(), RunError> {
        if self.machine.status() != RunStatus::Running {
            return Err(self.invalid("respond to"));
        }
        let instance = self.instance("respond to")?;
        self.inner
            .driver
            .respond(&instance, response, message)
            .await
            .map_err(|source| RunError::Driver {
                operation: "respond",
                source,
            })
    }

    async fn message(&mut self, text: &str) -> Result<(), RunError> {
        if !self.machine.status().has_instance() {
            return Err(self.invalid("message"));
        }
        let instance = self.instance("message")?;
        self.inner
            .driver
            .send_message(&instance, text)
            .await
            .map_err(|source| RunError::Driver {
                operation: "message",
                source,
            })
    }

    async fn cancel(&mut self, reason: &str) -> Result<(), RunError> {
        match self.machine.request_cancel(reason) {
            CancelOutcome::Rejected(_) => Err(self.invalid("cancel")),
            CancelOutcome::AlreadyRequested => Ok(()),
            CancelOutcome::Immediate(transition) => {
                tracing::info!(run_id = %self.run_id(), reason, "Run cancelled");
                self.commit(Some(transition)).await;
                Ok(())
            }
            CancelOutcome::Pending => {
                tracing::info!(run_id = %self.run_id(), reason, "Cancel requested");
                self.save().await;
                if let Some(instance) = self.machine.run().instance.clone() {
                    match self.inner.driver.cancel(&instance).await {
                        Ok(true) => {}
                        Ok(false) => tracing::warn!(
                            run_id = %self.run_id(),
                            "Agent did not acknowledge cancel, waiting for grace period"
                        ),
                        Err(e) => tracing::warn!(run_id = %self.run_id(), error = %e, "Cancel request failed"),
                    }
                }
                let signals = self.signals.clone();
                let grace = self.inner.settings.cancel_grace;
                self.grace = Some(tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = signals.send(RunSignal::GraceExpired);
                }));
                Ok(())
            }
        }
    }
}

/// Forward a driver stream into the worker queue.
fn spawn_pump(
    mut stream: EventStream,
    signals: mpsc::UnboundedSender<RunSignal>,
    generation: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            if signals.send(RunSignal::Stream { generation, event }).is_err() {
                return;
            }
        }
        let _ = signals.send(RunSignal::StreamEnded { generation });
    })
}
