//! Failure envelope: the classified error half of an [`Outcome`](super::Outcome).
//!
//! A `Failure` is created where a blocking operation fails and is never
//! mutated afterwards. Crossing a boundary that needs a different code goes
//! through [`Failure::chain`], which keeps the old failure as the source.
//!
//! The [`FailureKind`] tag is chosen at the throw site so that the fault
//! classifier never has to inspect error types or message text.

use std::any::Any;
use std::error::Error as StdError;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Well-known failure codes.
pub mod codes {
    /// Default code for failures that nobody classified.
    pub const UNCLASSIFIED: &str = "00000";

    /// A "maybe" operation produced no value.
    pub const FILTER_REJECTED: &str = "99953";

    /// A blocking call was interrupted by cancellation.
    pub const INTERRUPTED: &str = "99970";

    /// The operation panicked.
    pub const PANICKED: &str = "99980";

    /// The framework could not keep one of its own guarantees.
    pub const INVARIANT: &str = "99990";

    /// AMQP client failure codes.
    pub mod amqp {
        pub const NEW_CONNECTION: &str = "59999";
        pub const CREATE_CHANNEL: &str = "59998";
        pub const QUEUE_DECLARATION: &str = "59997";
        pub const CHANNEL_PUBLISH: &str = "59996";
        pub const CHANNEL_CONSUME: &str = "59995";
    }

    /// MQTT client failure codes.
    pub mod mqtt {
        pub const BUILD_CLIENT: &str = "49999";
        pub const CONNECTION_FAILURE: &str = "49998";
        pub const DISCONNECTION_FAILURE: &str = "49997";
        pub const PUBLISH_FAILURE: &str = "59998";
        pub const SUBSCRIBE_FAILURE: &str = "59999";
    }
}

/// Category of a failure, used by the fault classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Broken connection, interrupted blocking call, network flakiness.
    Transport,
    /// Invalid argument, missing required value: a bug in the caller.
    Programming,
    /// The framework broke one of its own invariants.
    Invariant,
    /// Nobody knows.
    Unclassified,
}

/// Underlying cause of a failure.
pub type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// A classified failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} (kind={kind:?}, code={code})")]
pub struct Failure {
    kind: FailureKind,
    code: String,
    message: String,
    #[source]
    source: Option<Cause>,
}

impl Failure {
    pub fn new(kind: FailureKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transport, codes::UNCLASSIFIED, message)
    }

    pub fn programming(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Programming, codes::UNCLASSIFIED, message)
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Invariant, codes::INVARIANT, message)
    }

    pub fn unclassified(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unclassified, codes::UNCLASSIFIED, message)
    }

    /// Wrap a foreign error, keeping it as the source.
    pub fn wrap<E>(kind: FailureKind, code: impl Into<String>, error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            kind,
            code: code.into(),
            message: error.to_string(),
            source: Some(Arc::new(error)),
        }
    }

    /// Wrap a foreign error with the default code.
    pub fn from_error<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::wrap(FailureKind::Unclassified, codes::UNCLASSIFIED, error)
    }

    /// A blocking call gave up because its run was cancelled.
    pub fn interrupted() -> Self {
        Self::new(
            FailureKind::Transport,
            codes::INTERRUPTED,
            "operation interrupted by cancellation",
        )
    }

    /// A "maybe" operation completed without a value.
    pub fn filter_rejected() -> Self {
        Self::new(
            FailureKind::Unclassified,
            codes::FILTER_REJECTED,
            "filter returns negative result",
        )
    }

    /// Convert a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let detail = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new(
            FailureKind::Programming,
            codes::PANICKED,
            format!("operation panicked: {detail}"),
        )
    }

    /// Rewrap under a new code. The kind is inherited and `self` becomes the source.
    pub fn chain(self, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: self.kind,
            code: code.into(),
            message: message.into(),
            source: Some(Arc::new(self)),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_kind(mut self, kind: FailureKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&Cause> {
        self.source.as_ref()
    }
}

impl From<std::io::Error> for Failure {
    fn from(error: std::io::Error) -> Self {
        let code = if error.kind() == std::io::ErrorKind::Interrupted {
            codes::INTERRUPTED
        } else {
            codes::UNCLASSIFIED
        };
        Self::wrap(FailureKind::Transport, code, error)
    }
}

/// Attach a code (and optionally a kind) to a foreign error at the call site.
///
/// ```ignore
/// let conn = factory.new_connection().with_failure(FailureKind::Transport, codes::amqp::NEW_CONNECTION)?;
/// ```
pub trait ResultExt<T> {
    fn with_code(self, code: &str) -> Result<T, Failure>;
    fn with_failure(self, kind: FailureKind, code: &str) -> Result<T, Failure>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: StdError + Send + Sync + 'static,
{
    fn with_code(self, code: &str) -> Result<T, Failure> {
        self.with_failure(FailureKind::Unclassified, code)
    }

    fn with_failure(self, kind: FailureKind, code: &str) -> Result<T, Failure> {
        self.map_err(|e| Failure::wrap(kind, code, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn foreign_errors_get_the_default_code() {
        let err = std::fmt::Error;
        let failure = Failure::from_error(err);
        assert_eq!(failure.code(), codes::UNCLASSIFIED);
        assert_eq!(failure.kind(), FailureKind::Unclassified);
        assert!(failure.source().is_some());
    }

    #[test]
    fn io_errors_are_transport_failures() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let failure = Failure::from(refused);
        assert_eq!(failure.kind(), FailureKind::Transport);
        assert_eq!(failure.code(), codes::UNCLASSIFIED);

        let interrupted = std::io::Error::new(std::io::ErrorKind::Interrupted, "eintr");
        assert_eq!(Failure::from(interrupted).code(), codes::INTERRUPTED);
    }

    #[test]
    fn caller_assigned_codes_survive() {
        let res: Result<(), std::io::Error> = Err(std::io::Error::other("no route"));
        let failure = res
            .with_failure(FailureKind::Transport, codes::amqp::NEW_CONNECTION)
            .unwrap_err();
        assert_eq!(failure.code(), "59999");
        assert_eq!(failure.message(), "no route");
    }

    #[test]
    fn chain_keeps_kind_and_source() {
        let inner = Failure::transport("socket closed").with_code(codes::amqp::CHANNEL_PUBLISH);
        let outer = inner.chain(codes::mqtt::PUBLISH_FAILURE, "publish failed");

        assert_eq!(outer.kind(), FailureKind::Transport);
        assert_eq!(outer.code(), codes::mqtt::PUBLISH_FAILURE);
        let source = outer.source().unwrap();
        assert!(source.to_string().contains("socket closed"));
    }

    #[test]
    fn panic_payloads_become_programming_failures() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        let failure = Failure::from_panic(payload);
        assert_eq!(failure.kind(), FailureKind::Programming);
        assert_eq!(failure.code(), codes::PANICKED);
        assert!(failure.message().contains("boom"));
    }
}
