//! Pure run state machine.
//!
//! [`RunMachine`] owns a [`Run`] record and applies events and commands to it
//! without any I/O. The orchestrator persists, notifies and tears down around
//! the transitions it returns.

use chrono::Utc;

use crate::engine::models::{Run, RunEvent, RunEventType, RunStatus};

/// Check whether a status transition is allowed.
pub fn is_valid_transition(from: RunStatus, to: RunStatus) -> bool {
    use crate::engine::models::RunStatus::*;
    match (from, to) {
        (Queued, Planning) | (Queued, Failed) => true,
        (Planning, AwaitingApproval) | (Planning, Failed) => true,
        (AwaitingApproval, Running) => true,
        (Running, Succeeded) | (Running, Failed) => true,
        (from, Cancelled) => is_cancellable(from),
        _ => false,
    }
}

/// Any run that has not finished can be cancelled.
pub fn is_cancellable(status: RunStatus) -> bool {
    !status.is_terminal()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: RunStatus,
    pub to: RunStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// No stream to confirm the stop; the run is already cancelled.
    Immediate(Transition),
    /// Waiting for the agent to confirm or the grace period to expire.
    Pending,
    /// A cancel was requested before and is still pending.
    AlreadyRequested,
    Rejected(RunStatus),
}

#[derive(Debug, Clone)]
pub struct RunMachine {
    run: Run,
}

impl RunMachine {
    pub fn new(run: Run) -> Self {
        Self { run }
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    /// Resource fields (workspace, instance, task id) are filled in during setup.
    pub fn run_mut(&mut self) -> &mut Run {
        &mut self.run
    }

    pub fn into_run(self) -> Run {
        self.run
    }

    pub fn status(&self) -> RunStatus {
        self.run.status
    }

    fn transition(&mut self, to: RunStatus) -> Option<Transition> {
        let from = self.run.status;
        if !is_valid_transition(from, to) {
            return None;
        }
        self.run.status = to;
        if to == RunStatus::Planning && self.run.started_at.is_none() {
            self.run.started_at = Some(Utc::now());
        }
        if to.is_terminal() {
            self.run.finished_at = Some(Utc::now());
        }
        Some(Transition { from, to })
    }

    /// Setup finished: the plan-mode task is submitted.
    pub fn start_planning(&mut self) -> Option<Transition> {
        self.transition(RunStatus::Planning)
    }

    /// Fold an agent event into the run and return the transition it causes.
    ///
    /// Log, step, diff, status and approval events never change status.
    pub fn apply_event(&mut self, event: &RunEvent) -> Option<Transition> {
        if self.run.status.is_terminal() {
            return None;
        }

        match event.event_type {
            RunEventType::TaskResponse | RunEventType::Complete => {
                if !event.message.trim().is_empty() {
                    self.run.summary = Some(event.message.clone());
                }
            }
            RunEventType::Error => {
                self.run.error = Some(event.message.clone());
            }
            _ => {}
        }

        if self.run.cancel_requested && event.event_type.is_closing() {
            return self.transition(RunStatus::Cancelled);
        }

        match (self.run.status, event.event_type) {
            (RunStatus::Planning, RunEventType::TaskResponse | RunEventType::Complete) => {
                self.transition(RunStatus::AwaitingApproval)
            }
            (RunStatus::Running, RunEventType::Complete) => self.transition(RunStatus::Succeeded),
            (RunStatus::Planning | RunStatus::Running, RunEventType::Error) => {
                self.transition(RunStatus::Failed)
            }
            _ => None,
        }
    }

    /// The attached output stream ended without a closing event.
    pub fn stream_ended(&mut self) -> Option<Transition> {
        if self.run.cancel_requested {
            return self.transition(RunStatus::Cancelled);
        }
        match self.run.status {
            RunStatus::Planning => self.fail("Agent output ended before a plan was produced"),
            RunStatus::Running => self.fail("Agent output ended before the task completed"),
            _ => None,
        }
    }

    pub fn approve(&mut self) -> Option<Transition> {
        if self.run.status != RunStatus::AwaitingApproval {
            return None;
        }
        self.transition(RunStatus::Running)
    }

    pub fn request_cancel(&mut self, reason: &str) -> CancelOutcome {
        let status = self.run.status;
        if !is_cancellable(status) {
            return CancelOutcome::Rejected(status);
        }
        if self.run.cancel_requested {
            return CancelOutcome::AlreadyRequested;
        }
        self.run.cancel_requested = true;
        if self.run.error.is_none() {
            self.run.error = Some(format!("Cancelled: {}", reason));
        }
        match status {
            RunStatus::Queued | RunStatus::AwaitingApproval => self
                .transition(RunStatus::Cancelled)
                .map_or(CancelOutcome::Rejected(status), CancelOutcome::Immediate),
            _ => CancelOutcome::Pending,
        }
    }

    /// The agent never confirmed a pending cancel.
    pub fn grace_expired(&mut self) -> Option<Transition> {
        if !self.run.cancel_requested {
            return None;
        }
        self.transition(RunStatus::Cancelled)
    }

    /// Fail the run with `error` if the current status allows it.
    pub fn fail(&mut self, error: impl Into<String>) -> Option<Transition> {
        let transition = self.transition(RunStatus::Failed)?;
        self.run.error = Some(error.into());
        Some(transition)
    }

    /// Mark a run found non-terminal in the store after a restart.
    ///
    /// The process that drove it is gone, so this bypasses the transition
    /// table.
    pub fn interrupted(mut run: Run) -> Run {
        if !run.status.is_terminal() {
            run.status = RunStatus::Failed;
            run.error = Some("interrupted by restart".to_string());
            run.finished_at = Some(Utc::now());
        }
        run
    }
}
