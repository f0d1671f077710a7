//! Domain model (outcomes, failures, run state, ids).

pub mod failure;
pub mod ids;
pub mod outcome;
pub mod state;

pub use failure::{Cause, Failure, FailureKind, ResultExt, codes};
pub use ids::{RunId, TaskId};
pub use outcome::{Outcome, OutcomeKind};
pub use state::{AtomicTaskState, TaskState};
