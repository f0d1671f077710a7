//! ContinuousTask - re-run a body in a loop on its own worker thread.
//!
//! The loop has no pacing: the body is called again as soon as it returns.
//! Bodies that poll a remote system should sleep or block inside themselves.
//!
//! `stop_task` is best effort. It flips the running flag, cancels the body's
//! token and shuts the worker down without waiting for the body call that is
//! in progress.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::domain::{Failure, codes};
use crate::error::CourierError;
use crate::fault::{self, FaultHandler};
use crate::impls::SingleThreadExecutor;
use crate::ports::{Executor, Job};

type Body = Box<dyn FnMut(&CancellationToken) + Send + 'static>;

struct Worker {
    executor: SingleThreadExecutor,
    token: CancellationToken,
}

struct Shared {
    /// Read lock-free by the loop; written only while `worker` is locked.
    running: AtomicBool,
    worker: Mutex<Option<Worker>>,
}

pub struct ContinuousTask {
    name: String,
    body: Arc<Mutex<Option<Body>>>,
    shared: Arc<Shared>,
    fault: Option<FaultHandler>,
}

impl ContinuousTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: Arc::new(Mutex::new(None)),
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
            fault: None,
        }
    }

    pub fn with_fault_handler(mut self, handler: FaultHandler) -> Self {
        self.fault = Some(handler);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the body. Takes effect from the next iteration.
    pub fn set_body<F>(&self, mut body: F)
    where
        F: FnMut() + Send + 'static,
    {
        *self.body.lock() = Some(Box::new(move |_: &CancellationToken| body()));
    }

    /// Body that receives the worker's token, cancelled by `stop_task`.
    pub fn set_interruptible_body<F>(&self, body: F)
    where
        F: FnMut(&CancellationToken) + Send + 'static,
    {
        *self.body.lock() = Some(Box::new(body));
    }

    /// Start the loop on a fresh worker thread.
    ///
    /// Rejected if a worker already exists (even one whose loop has stopped)
    /// or no body is set.
    pub fn start_task(&self) -> Result<(), CourierError> {
        let mut worker = self.shared.worker.lock();
        if worker.is_some() {
            error!(task = %self.name, "start_task: worker already exists");
            return Err(CourierError::AlreadyStarted(self.name.clone()));
        }
        if self.body.lock().is_none() {
            error!(task = %self.name, "start_task: no body set");
            return Err(CourierError::MissingBody(self.name.clone()));
        }

        let executor = SingleThreadExecutor::new(format!("{}-worker", self.name))?;
        let token = CancellationToken::new();
        self.shared.running.store(true, Ordering::SeqCst);

        let job = Job::from_fn(run_loop(
            self.name.clone(),
            Arc::clone(&self.body),
            Arc::clone(&self.shared),
            token.clone(),
            self.fault.clone(),
        ));
        if executor.execute(job).is_err() {
            self.shared.running.store(false, Ordering::SeqCst);
            return Err(CourierError::WorkerRejected(self.name.clone()));
        }

        *worker = Some(Worker { executor, token });
        info!(task = %self.name, "continuous task started");
        Ok(())
    }

    /// Stop the loop. A no-op when never started or already stopped.
    pub fn stop_task(&self) {
        let mut worker = self.shared.worker.lock();
        self.shared.running.store(false, Ordering::SeqCst);

        match worker.take() {
            Some(Worker { executor, token }) => {
                token.cancel();
                if executor.shutdown_now() {
                    info!(task = %self.name, "continuous task stopped, worker interrupted");
                } else {
                    info!(task = %self.name, "continuous task stopped, worker was already shut down");
                }
            }
            None => debug!(task = %self.name, "stop_task: no worker"),
        }
    }

    pub fn is_running(&self) -> bool {
        let _worker = self.shared.worker.lock();
        self.shared.running.load(Ordering::SeqCst)
    }
}

impl Drop for ContinuousTask {
    fn drop(&mut self) {
        self.stop_task();
    }
}

fn run_loop(
    name: String,
    body: Arc<Mutex<Option<Body>>>,
    shared: Arc<Shared>,
    token: CancellationToken,
    fault: Option<FaultHandler>,
) -> impl FnOnce() + Send + 'static {
    move || {
        let mut iterations: u64 = 0;
        while !token.is_cancelled() && shared.running.load(Ordering::Acquire) {
            let mut guard = body.lock();
            let Some(body) = guard.as_mut() else {
                error!(task = %name, "body disappeared, leaving loop");
                break;
            };
            let call = catch_unwind(AssertUnwindSafe(|| body(&token)));
            drop(guard);

            if let Err(payload) = call {
                {
                    let _worker = shared.worker.lock();
                    shared.running.store(false, Ordering::SeqCst);
                }
                let failure = Failure::from_panic(payload)
                    .chain(codes::PANICKED, format!("continuous task `{name}` body panicked"));
                fault.unwrap_or_else(fault::global).handle(failure);
                break;
            }
            iterations += 1;
        }
        debug!(task = %name, iterations, "continuous loop exited");
    }
}
