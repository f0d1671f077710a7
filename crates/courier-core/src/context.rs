//! Execution contexts: named places where operations and callbacks run.
//!
//! - `Io`: the runtime's blocking pool. Elastic, meant for blocking I/O.
//! - `Compute`: the blocking pool behind a semaphore, one slot per CPU by default.
//! - `Executor`: any caller-supplied [`Executor`].
//! - `Immediate`: the dispatching thread itself.
//!
//! While a job runs on a context, [`current_label`] returns that context's label.

use std::cell::RefCell;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::config::SchedulerConfig;
use crate::domain::{Failure, FailureKind, codes};
use crate::ports::{Admission, Executor, Job};

pub const IO_LABEL: &str = "io";
pub const COMPUTE_LABEL: &str = "compute";
pub const IMMEDIATE_LABEL: &str = "immediate";

thread_local! {
    static CURRENT: RefCell<Option<Arc<str>>> = const { RefCell::new(None) };
}

/// Label of the context the current thread is running a job for.
pub fn current_label() -> Option<Arc<str>> {
    CURRENT.with(|current| current.borrow().clone())
}

pub(crate) struct LabelGuard {
    previous: Option<Arc<str>>,
}

pub(crate) fn enter(label: Arc<str>) -> LabelGuard {
    let previous = CURRENT.with(|current| current.replace(Some(label)));
    LabelGuard { previous }
}

impl Drop for LabelGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

pub fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Blocking pool gated to a fixed number of concurrent jobs.
#[derive(Clone)]
pub struct ComputePool {
    runtime: Handle,
    permits: Arc<Semaphore>,
    size: usize,
}

impl ComputePool {
    pub fn new(runtime: Handle, size: usize) -> Self {
        let size = size.max(1);
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    fn spawn(&self, job: Job) {
        let permits = Arc::clone(&self.permits);
        let runtime = self.runtime.clone();
        self.runtime.spawn(async move {
            // the semaphore is never closed, so Err only if that changes
            let Ok(permit) = permits.acquire_owned().await else {
                job.reject();
                return;
            };
            runtime.spawn_blocking(move || {
                let _permit = permit;
                let _label = enter(Arc::from(COMPUTE_LABEL));
                job.run();
            });
        });
    }
}

#[derive(Clone)]
pub enum ExecutionContext {
    Immediate,
    Io(Handle),
    Compute(ComputePool),
    Executor(Arc<dyn Executor>),
}

impl ExecutionContext {
    pub fn immediate() -> Self {
        ExecutionContext::Immediate
    }

    pub fn io(runtime: Handle) -> Self {
        ExecutionContext::Io(runtime)
    }

    pub fn compute(pool: ComputePool) -> Self {
        ExecutionContext::Compute(pool)
    }

    pub fn executor(executor: Arc<dyn Executor>) -> Self {
        ExecutionContext::Executor(executor)
    }

    pub fn label(&self) -> &str {
        match self {
            ExecutionContext::Immediate => IMMEDIATE_LABEL,
            ExecutionContext::Io(_) => IO_LABEL,
            ExecutionContext::Compute(_) => COMPUTE_LABEL,
            ExecutionContext::Executor(executor) => executor.name(),
        }
    }

    /// Runtime behind this context, if it has one.
    pub fn runtime(&self) -> Option<&Handle> {
        match self {
            ExecutionContext::Io(runtime) => Some(runtime),
            ExecutionContext::Compute(pool) => Some(pool.runtime()),
            ExecutionContext::Immediate | ExecutionContext::Executor(_) => None,
        }
    }

    /// Hand `job` to this context. Never blocks, except for `Immediate`,
    /// which runs the job before returning.
    pub fn dispatch(&self, job: Job) {
        match self {
            ExecutionContext::Immediate => job.run(),
            ExecutionContext::Io(runtime) => {
                runtime.spawn_blocking(move || {
                    let _label = enter(Arc::from(IO_LABEL));
                    job.run();
                });
            }
            ExecutionContext::Compute(pool) => pool.spawn(job),
            ExecutionContext::Executor(executor) => {
                let label: Arc<str> = Arc::from(executor.name());
                let labeled = Job::new(move |admission| match admission {
                    Admission::Run => {
                        let _label = enter(label);
                        job.run();
                    }
                    Admission::Rejected => job.reject(),
                });
                if let Err(rejected) = executor.execute(labeled) {
                    warn!(context = executor.name(), "executor rejected job");
                    rejected.reject();
                }
            }
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ExecutionContext").field(&self.label()).finish()
    }
}

/// The io and compute contexts of one tokio runtime.
#[derive(Clone)]
pub struct Schedulers {
    runtime: Handle,
    compute: ComputePool,
}

impl Schedulers {
    pub fn new(runtime: Handle, config: &SchedulerConfig) -> Self {
        let compute = ComputePool::new(runtime.clone(), config.compute_threads());
        Self { runtime, compute }
    }

    /// Schedulers for the runtime the caller is inside of.
    pub fn current() -> Result<Self, Failure> {
        Self::current_with(&SchedulerConfig::default())
    }

    pub fn current_with(config: &SchedulerConfig) -> Result<Self, Failure> {
        let runtime = Handle::try_current()
            .map_err(|e| Failure::wrap(FailureKind::Invariant, codes::INVARIANT, e))?;
        Ok(Self::new(runtime, config))
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn io(&self) -> ExecutionContext {
        ExecutionContext::io(self.runtime.clone())
    }

    pub fn compute(&self) -> ExecutionContext {
        ExecutionContext::compute(self.compute.clone())
    }
}

impl fmt::Debug for Schedulers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedulers")
            .field("compute_threads", &self.compute.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    struct RejectAll;

    impl Executor for RejectAll {
        fn name(&self) -> &str {
            "reject-all"
        }

        fn execute(&self, job: Job) -> Result<(), Job> {
            Err(job)
        }
    }

    #[tokio::test]
    async fn io_jobs_see_the_io_label() {
        let schedulers = Schedulers::current().unwrap();
        let (tx, rx) = oneshot::channel();
        schedulers.io().dispatch(Job::from_fn(move || {
            let _ = tx.send(current_label());
        }));
        assert_eq!(rx.await.unwrap().as_deref(), Some(IO_LABEL));
    }

    #[tokio::test]
    async fn immediate_keeps_the_callers_label() {
        assert!(current_label().is_none());
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let slot = Arc::clone(&seen);
        ExecutionContext::immediate().dispatch(Job::from_fn(move || {
            *slot.lock() = Some(current_label());
        }));
        assert_eq!(*seen.lock(), Some(None));
    }

    #[tokio::test]
    async fn rejected_jobs_are_told_so() {
        let ctx = ExecutionContext::executor(Arc::new(RejectAll));
        let (tx, rx) = oneshot::channel();
        ctx.dispatch(Job::new(move |admission| {
            let _ = tx.send(admission);
        }));
        assert_eq!(rx.await.unwrap(), Admission::Rejected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn compute_pool_bounds_concurrency() {
        let runtime = Handle::current();
        let schedulers = Schedulers::new(
            runtime,
            &SchedulerConfig {
                compute_threads: Some(2),
            },
        );
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut done = Vec::new();

        for _ in 0..8 {
            let (tx, rx) = oneshot::channel::<()>();
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            schedulers.compute().dispatch(Job::from_fn(move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(10));
                active.fetch_sub(1, Ordering::SeqCst);
                let _ = tx.send(());
            }));
            done.push(rx);
        }
        for rx in done {
            rx.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
