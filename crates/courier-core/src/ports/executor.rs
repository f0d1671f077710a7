//! Executor port: a caller-supplied place to run jobs.

/// Whether an executor accepted a job or turned it away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Run,
    Rejected,
}

/// A unit of work handed to an [`Executor`].
///
/// The closure is told whether it is being run or rejected so that work which
/// owns a callback can still report back when no thread will ever run it.
pub struct Job(Box<dyn FnOnce(Admission) + Send + 'static>);

impl Job {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(Admission) + Send + 'static,
    {
        Self(Box::new(f))
    }

    /// Job that does nothing when rejected.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new(move |admission| {
            if admission == Admission::Run {
                f();
            }
        })
    }

    pub fn run(self) {
        (self.0)(Admission::Run)
    }

    pub fn reject(self) {
        (self.0)(Admission::Rejected)
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Job")
    }
}

/// Something that runs jobs off the calling thread.
///
/// `execute` must not block the caller. A job the executor cannot take is
/// handed back in `Err`; the caller then rejects it.
pub trait Executor: Send + Sync + 'static {
    /// Label shown in logs and by [`current_label`](crate::context::current_label).
    fn name(&self) -> &str;

    fn execute(&self, job: Job) -> Result<(), Job>;
}
