//! SingleThreadExecutor - one dedicated OS thread fed by a channel.
//!
//! Used as the worker of a [`ContinuousTask`](crate::app::ContinuousTask) and
//! as a caller-supplied [`ExecutionContext`](crate::context::ExecutionContext).

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::context::enter;
use crate::domain::Failure;
use crate::error::CourierError;
use crate::ports::{Executor, Job};

pub struct SingleThreadExecutor {
    name: Arc<str>,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    terminated: Arc<AtomicBool>,
}

impl SingleThreadExecutor {
    /// Spawn the worker thread. The thread carries `name`.
    pub fn new(name: impl Into<String>) -> Result<Self, CourierError> {
        let name: Arc<str> = Arc::from(name.into());
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let terminated = Arc::new(AtomicBool::new(false));

        let label = Arc::clone(&name);
        let stop = Arc::clone(&terminated);
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(job) = receiver.blocking_recv() {
                    if stop.load(Ordering::Acquire) {
                        job.reject();
                        continue;
                    }
                    let _label = enter(Arc::clone(&label));
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| job.run())) {
                        let failure = Failure::from_panic(payload);
                        error!(executor = %label, error = %failure, "job panicked on worker thread");
                    }
                }
                debug!(executor = %label, "worker thread exiting");
            })?;

        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            terminated,
        })
    }

    /// Stop accepting jobs. Jobs already queued still run.
    pub fn shutdown(&self) {
        self.sender.lock().take();
    }

    /// Stop accepting jobs and reject everything still queued. The job that
    /// is currently running is not waited for.
    ///
    /// Returns `false` if the executor was already shut down.
    pub fn shutdown_now(&self) -> bool {
        let was_live = self.sender.lock().take().is_some();
        self.terminated.store(true, Ordering::Release);
        was_live
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl Executor for SingleThreadExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, job: Job) -> Result<(), Job> {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(tx) => tx.send(job).map_err(|rejected| rejected.0),
            None => Err(job),
        }
    }
}

impl Drop for SingleThreadExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::current_label;
    use crate::ports::Admission;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    #[test]
    fn jobs_run_in_order_on_the_named_thread() {
        let executor = SingleThreadExecutor::new("ordered").unwrap();
        let (tx, rx) = std_mpsc::channel();
        for i in 0..3 {
            let tx = tx.clone();
            executor
                .execute(Job::from_fn(move || {
                    let thread = std::thread::current().name().map(str::to_owned);
                    tx.send((i, thread, current_label())).unwrap();
                }))
                .unwrap();
        }
        for expected in 0..3 {
            let (i, thread, label) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
            assert_eq!(i, expected);
            assert_eq!(thread.as_deref(), Some("ordered"));
            assert_eq!(label.as_deref(), Some("ordered"));
        }
    }

    #[test]
    fn shutdown_now_rejects_queued_jobs() {
        let executor = SingleThreadExecutor::new("gated").unwrap();
        let (gate_tx, gate_rx) = std_mpsc::channel::<()>();
        let (started_tx, started_rx) = std_mpsc::channel::<()>();
        executor
            .execute(Job::from_fn(move || {
                started_tx.send(()).unwrap();
                let _ = gate_rx.recv();
            }))
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let (seen_tx, seen_rx) = std_mpsc::channel();
        executor
            .execute(Job::new(move |admission| seen_tx.send(admission).unwrap()))
            .unwrap();

        assert!(executor.shutdown_now());
        assert!(!executor.shutdown_now());
        assert!(executor.is_shutdown());
        gate_tx.send(()).unwrap();

        let admission = seen_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(admission, Admission::Rejected);
        assert!(executor.execute(Job::from_fn(|| {})).is_err());
    }
}
