//! Task - one blocking (or async) operation with a one-shot outcome.
//!
//! # Lifecycle
//! - `start` cancels whatever run is still in flight, then schedules the new
//!   operation on the task's execution context.
//! - When the operation returns, delivery hops to the completion context and
//!   claims the run (`Running -> Completed`). Only a successful claim invokes
//!   the callback.
//! - `cancel` claims the run the other way (`Running -> Cancelled`). A result
//!   that arrives afterwards is an orphan: successes are dropped, failures go
//!   to the fault handler as undeliverable.
//!
//! The handle slot is cleared on every exit path. Dropping a `Task` does not
//! cancel its run; use [`Task::cancel`] or [`RunHandle::cancel_on_drop`].

use std::future::Future;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::handle::RunHandle;
use crate::context::{self, ExecutionContext};
use crate::domain::{AtomicTaskState, Failure, Outcome, TaskId, TaskState};
use crate::fault::{self, FaultHandler};
use crate::ports::callback::{self, Detached, TaskCallback};
use crate::ports::{Admission, Job};

/// State shared between a task and its in-flight jobs.
struct TaskShared {
    current: Mutex<Option<RunHandle>>,
    /// State of the last released run, reported while no run is live.
    settled: AtomicTaskState,
}

impl TaskShared {
    /// Clear the slot if it still holds `run`.
    fn release(&self, run: &RunHandle) {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|live| live.same_run(run)) {
            *current = None;
            self.settled.store(run.state());
        }
    }
}

pub struct Task<T> {
    id: TaskId,
    run_on: ExecutionContext,
    shared: Arc<TaskShared>,
    fault: Option<FaultHandler>,
    _output: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> Task<T> {
    /// A task whose operations run on `run_on`.
    pub fn new(run_on: ExecutionContext) -> Self {
        Self {
            id: TaskId::generate(),
            run_on,
            shared: Arc::new(TaskShared {
                current: Mutex::new(None),
                settled: AtomicTaskState::new(TaskState::Idle),
            }),
            fault: None,
            _output: PhantomData,
        }
    }

    /// Use `handler` instead of the global one for orphaned failures.
    pub fn with_fault_handler(mut self, handler: FaultHandler) -> Self {
        self.fault = Some(handler);
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn execution_context(&self) -> &ExecutionContext {
        &self.run_on
    }

    pub fn state(&self) -> TaskState {
        match self.shared.current.lock().as_ref() {
            Some(run) => run.state(),
            None => self.shared.settled.load(),
        }
    }

    /// Run a blocking `operation` and deliver its outcome to `callback` on
    /// `complete_on`.
    pub fn start<F, C>(&self, operation: F, complete_on: ExecutionContext, callback: C) -> RunHandle
    where
        F: FnOnce() -> Result<T, Failure> + Send + 'static,
        C: TaskCallback<T>,
    {
        self.start_cancellable(move |_| operation(), complete_on, callback)
    }

    /// Like [`start`](Self::start), but the operation can watch the run's
    /// cancellation token and give up early.
    pub fn start_cancellable<F, C>(
        &self,
        operation: F,
        complete_on: ExecutionContext,
        callback: C,
    ) -> RunHandle
    where
        F: FnOnce(&CancellationToken) -> Result<T, Failure> + Send + 'static,
        C: TaskCallback<T>,
    {
        let run = self.begin();
        let finisher = self.finisher(&run, complete_on, callback);
        let context = self.run_on.label().to_owned();

        self.run_on.dispatch(Job::new(move |admission| {
            if admission == Admission::Rejected {
                finisher.finish(Err(Failure::invariant(format!(
                    "execution context `{context}` rejected the run"
                ))));
                return;
            }
            if finisher.run.is_cancelled() {
                finisher.skip();
                return;
            }
            let token = finisher.run.cancellation_token();
            let result = catch_unwind(AssertUnwindSafe(|| operation(&token)))
                .unwrap_or_else(|payload| Err(Failure::from_panic(payload)));
            finisher.finish(result);
        }));
        run
    }

    /// Run an async operation on the task's runtime. Cancelling the run drops
    /// the future at its next await point.
    pub fn start_async<F, Fut, C>(
        &self,
        operation: F,
        complete_on: ExecutionContext,
        callback: C,
    ) -> RunHandle
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Failure>> + Send + 'static,
        C: TaskCallback<T>,
    {
        let run = self.begin();
        let finisher = self.finisher(&run, complete_on, callback);

        let runtime = match self.run_on.runtime() {
            Some(runtime) => runtime.clone(),
            None => match Handle::try_current() {
                Ok(runtime) => runtime,
                Err(_) => {
                    finisher.finish(Err(Failure::invariant(
                        "no tokio runtime available for an async operation",
                    )));
                    return run;
                }
            },
        };

        let token = run.cancellation_token();
        runtime.spawn(async move {
            let child = token.clone();
            let work = AssertUnwindSafe(async move { operation(child).await }).catch_unwind();
            tokio::select! {
                biased;
                _ = token.cancelled() => finisher.skip(),
                result = work => {
                    let result = result.unwrap_or_else(|payload| Err(Failure::from_panic(payload)));
                    finisher.finish(result);
                }
            }
        });
        run
    }

    /// Operation that may legitimately produce nothing. `None` is delivered
    /// as a `FILTER_REJECTED` failure.
    pub fn start_maybe<F, C>(&self, operation: F, complete_on: ExecutionContext, callback: C) -> RunHandle
    where
        F: FnOnce() -> Result<Option<T>, Failure> + Send + 'static,
        C: TaskCallback<T>,
    {
        self.start(
            move || operation()?.ok_or_else(Failure::filter_rejected),
            complete_on,
            callback,
        )
    }

    /// Operation run for its side effect; `value` is delivered on success.
    pub fn start_completable<F, C>(
        &self,
        operation: F,
        value: T,
        complete_on: ExecutionContext,
        callback: C,
    ) -> RunHandle
    where
        F: FnOnce() -> Result<(), Failure> + Send + 'static,
        C: TaskCallback<T>,
    {
        self.start(move || operation().map(|()| value), complete_on, callback)
    }

    /// Fire and forget. Failures go to the fault handler.
    pub fn start_detached<F>(&self, operation: F) -> RunHandle
    where
        F: FnOnce() -> Result<T, Failure> + Send + 'static,
    {
        match &self.fault {
            Some(handler) => {
                let handler = handler.clone();
                self.start(
                    operation,
                    ExecutionContext::immediate(),
                    callback::from_fn(move |outcome: Outcome<T>| {
                        if let Outcome::Failure(failure) = outcome {
                            handler.handle(failure);
                        }
                    }),
                )
            }
            None => self.start(operation, ExecutionContext::immediate(), Detached),
        }
    }

    /// Cancel the in-flight run, if any.
    ///
    /// Returns `true` if a run was cancelled before it could deliver.
    pub fn cancel(&self) -> bool {
        let taken = self.shared.current.lock().take();
        let Some(run) = taken else {
            return false;
        };
        let cancelled = run.cancel();
        self.shared.settled.store(run.state());
        cancelled
    }

    /// Cancel anything in flight and go back to `Idle`.
    pub fn reset(&self) {
        self.cancel();
        self.shared.settled.store(TaskState::Idle);
    }

    fn begin(&self) -> RunHandle {
        let run = RunHandle::new(self.id);
        let previous = self.shared.current.lock().replace(run.clone());
        if let Some(previous) = previous
            && previous.cancel()
        {
            debug!(task_id = %self.id, run_id = %previous.id(), "in-flight run cancelled by restart");
        }
        debug!(
            task_id = %self.id,
            run_id = %run.id(),
            context = self.run_on.label(),
            "run started"
        );
        run
    }

    fn finisher<C>(&self, run: &RunHandle, complete_on: ExecutionContext, callback: C) -> Finisher<C> {
        Finisher {
            shared: Arc::clone(&self.shared),
            run: run.clone(),
            complete_on,
            callback,
            fault: self.fault.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("run_on", &self.run_on)
            .finish_non_exhaustive()
    }
}

/// Everything a run needs to report back once its operation returns.
struct Finisher<C> {
    shared: Arc<TaskShared>,
    run: RunHandle,
    complete_on: ExecutionContext,
    callback: C,
    fault: Option<FaultHandler>,
}

impl<C> Finisher<C> {
    /// Hop to the completion context and deliver there.
    fn finish<T>(self, result: Result<T, Failure>)
    where
        T: Send + 'static,
        C: TaskCallback<T>,
    {
        let complete_on = self.complete_on.clone();
        complete_on.dispatch(Job::new(move |admission| match admission {
            Admission::Run => self.deliver(result),
            Admission::Rejected => {
                warn!(
                    task_id = %self.run.task_id(),
                    run_id = %self.run.id(),
                    context = self.complete_on.label(),
                    "completion context rejected delivery"
                );
                self.run.complete();
                self.shared.release(&self.run);
                self.orphan(result);
            }
        }));
    }

    fn deliver<T>(self, result: Result<T, Failure>)
    where
        C: TaskCallback<T>,
    {
        if !self.run.complete() {
            self.shared.release(&self.run);
            self.orphan(result);
            return;
        }
        self.shared.release(&self.run);
        let outcome = Outcome::from(result);
        let label = context::current_label();
        debug!(
            task_id = %self.run.task_id(),
            run_id = %self.run.id(),
            outcome = ?outcome.kind(),
            context = label.as_deref().unwrap_or(context::IMMEDIATE_LABEL),
            "delivering outcome"
        );
        callback::deliver(self.callback, outcome);
    }

    /// The run was cancelled before its operation started.
    fn skip(self) {
        debug!(task_id = %self.run.task_id(), run_id = %self.run.id(), "cancelled run skipped");
        self.shared.release(&self.run);
    }

    fn orphan<T>(self, result: Result<T, Failure>) {
        match result {
            Ok(_) => {
                debug!(task_id = %self.run.task_id(), run_id = %self.run.id(), "cancelled run finished, dropping result");
            }
            Err(failure) => {
                let handler = self.fault.unwrap_or_else(fault::global);
                handler.handle_undeliverable(failure);
            }
        }
    }
}
