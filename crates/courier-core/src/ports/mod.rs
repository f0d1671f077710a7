//! Ports - the seams between the framework and the caller.
//!
//! - **TaskCallback**: where a run delivers its outcome
//! - **Executor**: a caller-supplied place to run jobs

pub mod callback;
pub mod executor;

pub use self::callback::{Detached, FnCallback, TaskCallback};
pub use self::executor::{Admission, Executor, Job};
