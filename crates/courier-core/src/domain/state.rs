//! Run state machine.
//!
//! ```text
//! Idle -> Running                 (start)
//! Running -> Completed            (outcome delivered)
//! Running -> Cancelled            (cancel before delivery)
//! Completed/Cancelled -> Idle     (reset / new run)
//! ```
//!
//! Completion and cancellation race through compare-and-swap on
//! [`AtomicTaskState`]; the first transition out of `Running` wins.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Running,
    Completed,
    Cancelled,
}

impl TaskState {
    /// Is this a terminal state for the current run?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled)
    }

    fn as_u8(self) -> u8 {
        match self {
            TaskState::Idle => 0,
            TaskState::Running => 1,
            TaskState::Completed => 2,
            TaskState::Cancelled => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::Idle,
            1 => TaskState::Running,
            2 => TaskState::Completed,
            _ => TaskState::Cancelled,
        }
    }
}

/// Lock-free cell holding a [`TaskState`].
#[derive(Debug)]
pub struct AtomicTaskState(AtomicU8);

impl AtomicTaskState {
    pub fn new(state: TaskState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    pub fn load(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: TaskState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }

    /// Move `from -> to` only if the cell still holds `from`.
    pub fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn first_exit_from_running_wins() {
        let cell = AtomicTaskState::new(TaskState::Running);
        assert!(cell.transition(TaskState::Running, TaskState::Cancelled));
        assert!(!cell.transition(TaskState::Running, TaskState::Completed));
        assert_eq!(cell.load(), TaskState::Cancelled);
    }

    #[rstest]
    #[case::idle(TaskState::Idle, false)]
    #[case::running(TaskState::Running, false)]
    #[case::completed(TaskState::Completed, true)]
    #[case::cancelled(TaskState::Cancelled, true)]
    fn terminal_states(#[case] state: TaskState, #[case] terminal: bool) {
        assert_eq!(state.is_terminal(), terminal);
        let cell = AtomicTaskState::new(state);
        assert_eq!(cell.load(), state);
    }
}
