//! Callback port: where a run delivers its outcome.
//!
//! Callbacks are consumed by value, so a single run can reach at most one of
//! `on_success` / `on_error`, at most once.

use tokio::sync::oneshot;
use tracing::debug;

use crate::domain::{Failure, Outcome};
use crate::fault;

pub trait TaskCallback<T>: Send + 'static {
    fn on_success(self, value: T);
    fn on_error(self, failure: Failure);
}

/// Route an outcome to the matching callback method.
pub fn deliver<T, C>(callback: C, outcome: Outcome<T>)
where
    C: TaskCallback<T>,
{
    match outcome {
        Outcome::Success(value) => callback.on_success(value),
        Outcome::Failure(failure) => callback.on_error(failure),
    }
}

/// A one-shot channel is the natural callback: the receiver awaits the outcome.
impl<T: Send + 'static> TaskCallback<T> for oneshot::Sender<Outcome<T>> {
    fn on_success(self, value: T) {
        // receiver may be gone; nobody is waiting then
        let _ = self.send(Outcome::Success(value));
    }

    fn on_error(self, failure: Failure) {
        let _ = self.send(Outcome::Failure(failure));
    }
}

/// Closure adapter, see [`from_fn`].
pub struct FnCallback<F>(F);

/// Build a callback from a closure receiving the whole [`Outcome`].
pub fn from_fn<T, F>(f: F) -> FnCallback<F>
where
    F: FnOnce(Outcome<T>) + Send + 'static,
{
    FnCallback(f)
}

impl<T, F> TaskCallback<T> for FnCallback<F>
where
    F: FnOnce(Outcome<T>) + Send + 'static,
{
    fn on_success(self, value: T) {
        (self.0)(Outcome::Success(value))
    }

    fn on_error(self, failure: Failure) {
        (self.0)(Outcome::Failure(failure))
    }
}

/// No caller is listening. Failures go to the global fault handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct Detached;

impl<T: Send + 'static> TaskCallback<T> for Detached {
    fn on_success(self, _value: T) {
        debug!("detached run succeeded");
    }

    fn on_error(self, failure: Failure) {
        fault::global().handle(failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn oneshot_sender_forwards_the_outcome() {
        let (tx, rx) = oneshot::channel::<Outcome<&str>>();
        deliver(tx, Outcome::Success("ok"));
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.value(), Some(&"ok"));
    }

    #[test]
    fn closure_callback_sees_failures() {
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        let cb = from_fn(move |outcome: Outcome<u8>| {
            if outcome.is_failure() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        deliver(cb, Outcome::Failure(Failure::transport("reset by peer")));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }
}
