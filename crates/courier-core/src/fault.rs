//! Fault classifier: the last stop for failures no callback will see.
//!
//! Orphaned failures (produced by a run that was cancelled), failures of
//! detached runs, and panicking continuous bodies end up here. Policy, in
//! priority order:
//!
//! 1. `Transport` - expected under cancellation or network flakiness. Log and drop.
//! 2. `Programming` - a bug. Escalate.
//! 3. `Invariant` - a framework bug. Escalate.
//! 4. `Unclassified` - log loudly and do nothing else.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::{error, warn};

use crate::domain::{Failure, FailureKind};

/// What the handler did with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Drop,
    Escalate,
    LogOnly,
}

pub fn classify(failure: &Failure) -> Disposition {
    match failure.kind() {
        FailureKind::Transport => Disposition::Drop,
        FailureKind::Programming | FailureKind::Invariant => Disposition::Escalate,
        FailureKind::Unclassified => Disposition::LogOnly,
    }
}

pub type EscalationHook = Arc<dyn Fn(&Failure) + Send + Sync + 'static>;

#[derive(Clone)]
pub struct FaultHandler {
    escalation: EscalationHook,
}

impl FaultHandler {
    pub fn new<F>(escalation: F) -> Self
    where
        F: Fn(&Failure) + Send + Sync + 'static,
    {
        Self {
            escalation: Arc::new(escalation),
        }
    }

    /// Escalate by panicking on the current thread, which hands the failure
    /// to the process panic hook.
    pub fn panicking() -> Self {
        Self::new(|failure| panic!("unrecoverable failure escaped task handling: {failure}"))
    }

    pub fn handle(&self, failure: Failure) -> Disposition {
        let disposition = classify(&failure);
        match disposition {
            Disposition::Drop => {
                warn!(code = failure.code(), error = %failure, "transport failure escaped task handling, dropping");
            }
            Disposition::Escalate => {
                error!(
                    code = failure.code(),
                    kind = ?failure.kind(),
                    error = %failure,
                    "failure escaped task handling, escalating"
                );
                (self.escalation)(&failure);
            }
            Disposition::LogOnly => {
                error!(code = failure.code(), error = %failure, "unclassified failure escaped task handling, not sure what to do");
            }
        }
        disposition
    }

    /// A run produced a failure after its callback was detached.
    pub fn handle_undeliverable(&self, failure: Failure) -> Disposition {
        error!(code = failure.code(), "undeliverable failure");
        self.handle(failure)
    }
}

impl Default for FaultHandler {
    fn default() -> Self {
        Self::panicking()
    }
}

impl std::fmt::Debug for FaultHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultHandler").finish_non_exhaustive()
    }
}

static GLOBAL: Lazy<RwLock<FaultHandler>> = Lazy::new(|| RwLock::new(FaultHandler::default()));

/// The process-wide handler used by tasks that were not given their own.
pub fn global() -> FaultHandler {
    GLOBAL.read().clone()
}

pub fn set_global(handler: FaultHandler) {
    *GLOBAL.write() = handler;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rstest::rstest;

    fn recording() -> (FaultHandler, Arc<Mutex<Vec<String>>>) {
        let escalated = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&escalated);
        let handler = FaultHandler::new(move |failure| sink.lock().push(failure.code().to_string()));
        (handler, escalated)
    }

    #[rstest]
    #[case::transport(Failure::transport("broken pipe"), Disposition::Drop)]
    #[case::interrupted(Failure::interrupted(), Disposition::Drop)]
    #[case::programming(Failure::programming("null argument"), Disposition::Escalate)]
    #[case::invariant(Failure::invariant("double delivery"), Disposition::Escalate)]
    #[case::unclassified(Failure::unclassified("???"), Disposition::LogOnly)]
    fn classification_follows_kind(#[case] failure: Failure, #[case] expected: Disposition) {
        assert_eq!(classify(&failure), expected);
    }

    #[test]
    fn only_escalations_reach_the_hook() {
        let (handler, escalated) = recording();

        handler.handle(Failure::transport("reset"));
        handler.handle(Failure::unclassified("odd"));
        handler.handle_undeliverable(Failure::programming("bad arg").with_code("12345"));

        assert_eq!(*escalated.lock(), vec!["12345".to_string()]);
    }

    #[test]
    fn default_handler_panics_on_escalation() {
        let handler = FaultHandler::default();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handler.handle(Failure::invariant("broken"))
        }));
        assert!(result.is_err());
    }
}
