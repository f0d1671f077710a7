//! RunHandle - the disposal handle of one run.
//!
//! Completion and cancellation both try to move the run out of `Running`.
//! Whichever lands first wins, so once `cancel` returns `true` no callback
//! will fire for that run.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::{AtomicTaskState, RunId, TaskId, TaskState};

struct RunSlot {
    id: RunId,
    task_id: TaskId,
    state: AtomicTaskState,
    /// Fired by `cancel`; operations may watch it to interrupt themselves.
    token: CancellationToken,
    /// Fired on any exit from `Running`.
    settled: CancellationToken,
}

#[derive(Clone)]
pub struct RunHandle {
    slot: Arc<RunSlot>,
}

impl RunHandle {
    pub(crate) fn new(task_id: TaskId) -> Self {
        Self {
            slot: Arc::new(RunSlot {
                id: RunId::generate(),
                task_id,
                state: AtomicTaskState::new(TaskState::Running),
                token: CancellationToken::new(),
                settled: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> RunId {
        self.slot.id
    }

    pub fn task_id(&self) -> TaskId {
        self.slot.task_id
    }

    pub fn state(&self) -> TaskState {
        self.slot.state.load()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    /// Token that fires when this run is cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.slot.token.clone()
    }

    /// Cancel the run if it is still running. Idempotent.
    ///
    /// Returns `true` only for the call that actually cancelled.
    pub fn cancel(&self) -> bool {
        if !self
            .slot
            .state
            .transition(TaskState::Running, TaskState::Cancelled)
        {
            return false;
        }
        self.slot.token.cancel();
        self.slot.settled.cancel();
        debug!(task_id = %self.slot.task_id, run_id = %self.slot.id, "run cancelled");
        true
    }

    /// Claim the right to deliver. Fails if the run was cancelled first.
    pub(crate) fn complete(&self) -> bool {
        let won = self
            .slot
            .state
            .transition(TaskState::Running, TaskState::Completed);
        if won {
            self.slot.settled.cancel();
        }
        won
    }

    pub fn same_run(&self, other: &RunHandle) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Cancel the run if it is still running after `timeout`.
    ///
    /// The returned join handle yields `true` if the timeout fired the cancel.
    pub fn cancel_after(&self, timeout: Duration, runtime: &Handle) -> JoinHandle<bool> {
        let run = self.clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = run.slot.settled.cancelled() => false,
                _ = tokio::time::sleep(timeout) => {
                    let fired = run.cancel();
                    if fired {
                        info!(
                            task_id = %run.slot.task_id,
                            run_id = %run.slot.id,
                            timeout_ms = timeout.as_millis() as u64,
                            "run timed out"
                        );
                    }
                    fired
                }
            }
        })
    }

    /// Guard that cancels the run when dropped.
    pub fn cancel_on_drop(self) -> CancelOnDrop {
        CancelOnDrop {
            run: self,
            armed: true,
        }
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("id", &self.slot.id)
            .field("task_id", &self.slot.task_id)
            .field("state", &self.state())
            .finish()
    }
}

/// See [`RunHandle::cancel_on_drop`].
#[derive(Debug)]
pub struct CancelOnDrop {
    run: RunHandle,
    armed: bool,
}

impl CancelOnDrop {
    /// Give the handle back without cancelling.
    pub fn disarm(mut self) -> RunHandle {
        self.armed = false;
        self.run.clone()
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.run.cancel();
        }
    }
}
