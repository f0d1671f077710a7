//! BatchRunner - bounded fan-out / fan-in over independent items.
//!
//! Each item runs as its own [`Task`] on the io context. At most
//! [`BatchRunner::parallelism`] item tasks are in flight. An item that fails
//! (or panics) becomes a failed [`BatchEntry`]; its siblings keep going.
//! The batch itself is a `Task` whose single success is the full entry list,
//! in submission order.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt, stream};
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::task::Task;
use crate::config::BatchConfig;
use crate::context::{ExecutionContext, Schedulers};
use crate::domain::{Failure, Outcome, codes};
use crate::ports::TaskCallback;

/// One item of a batch together with what its operation produced.
#[derive(Debug, Clone)]
pub struct BatchEntry<In, Out> {
    pub item: In,
    pub outcome: Outcome<Out>,
}

impl<In, Out> BatchEntry<In, Out> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

#[derive(Debug, Clone)]
pub struct BatchRunner {
    schedulers: Schedulers,
    config: BatchConfig,
}

impl BatchRunner {
    pub fn new(schedulers: Schedulers, config: BatchConfig) -> Self {
        Self { schedulers, config }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// `min(cap, cpus * factor)`, at least 1.
    pub fn parallelism(&self) -> usize {
        self.config.parallelism()
    }

    /// Run `op` over every item and deliver all entries to `callback` on
    /// `complete_on`.
    ///
    /// The returned task owns the batch run: cancelling it cancels the item
    /// tasks still in flight and suppresses the batch result.
    pub fn run<In, Out, F, C>(
        &self,
        items: Vec<In>,
        op: F,
        complete_on: ExecutionContext,
        callback: C,
    ) -> Task<Vec<BatchEntry<In, Out>>>
    where
        In: Send + 'static,
        Out: Send + 'static,
        F: Fn(&In) -> Result<Out, Failure> + Send + Sync + 'static,
        C: TaskCallback<Vec<BatchEntry<In, Out>>>,
    {
        let batch = Task::new(self.schedulers.io());
        let worker = self.schedulers.io();
        let parallelism = self.parallelism();
        let op = Arc::new(op);

        batch.start_async(
            move |_token| run_all(items, op, worker, parallelism),
            complete_on,
            callback,
        );
        batch
    }
}

async fn run_all<In, Out, F>(
    items: Vec<In>,
    op: Arc<F>,
    worker: ExecutionContext,
    parallelism: usize,
) -> Result<Vec<BatchEntry<In, Out>>, Failure>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(&In) -> Result<Out, Failure> + Send + Sync + 'static,
{
    let total = items.len();
    debug!(total, parallelism, "batch started");

    let mut indexed: Vec<(usize, BatchEntry<In, Out>)> = stream::iter(items.into_iter().enumerate())
        .map(move |(index, item)| run_item(index, item, Arc::clone(&op), worker.clone()))
        .buffer_unordered(parallelism)
        .try_collect()
        .await?;

    indexed.sort_unstable_by_key(|(index, _)| *index);
    let entries: Vec<_> = indexed.into_iter().map(|(_, entry)| entry).collect();
    let failed = entries.iter().filter(|entry| !entry.is_success()).count();
    info!(total, failed, "batch finished");
    Ok(entries)
}

/// Run one item as its own task and wait for its entry.
///
/// The batch future is dropped when the batch run is cancelled, which drops
/// this future and cancels the item run with it.
async fn run_item<In, Out, F>(
    index: usize,
    item: In,
    op: Arc<F>,
    worker: ExecutionContext,
) -> Result<(usize, BatchEntry<In, Out>), Failure>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(&In) -> Result<Out, Failure> + Send + Sync + 'static,
{
    let task = Task::new(worker);
    let (tx, rx) = oneshot::channel();
    let guard = task
        .start(
            move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| op(&item)))
                    .unwrap_or_else(|payload| Err(Failure::from_panic(payload)));
                Ok(BatchEntry {
                    item,
                    outcome: outcome.into(),
                })
            },
            ExecutionContext::immediate(),
            tx,
        )
        .cancel_on_drop();

    let delivered = rx.await;
    guard.disarm();

    match delivered {
        Ok(Outcome::Success(entry)) => Ok((index, entry)),
        Ok(Outcome::Failure(failure)) => {
            Err(failure.chain(codes::INVARIANT, format!("batch item {index} lost its entry")))
        }
        Err(_) => Err(Failure::invariant(format!(
            "batch item {index} finished without an outcome"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::domain::FailureKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::runtime::Handle;

    fn runner(cap: usize) -> BatchRunner {
        let schedulers = Schedulers::new(Handle::current(), &SchedulerConfig::default());
        BatchRunner::new(schedulers, BatchConfig::new(cap, BatchConfig::DEFAULT_FACTOR))
    }

    async fn run_to_end<In, Out, F>(runner: &BatchRunner, items: Vec<In>, op: F) -> Outcome<Vec<BatchEntry<In, Out>>>
    where
        In: Send + 'static,
        Out: Send + 'static,
        F: Fn(&In) -> Result<Out, Failure> + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let _batch = runner.run(items, op, ExecutionContext::immediate(), tx);
        tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .expect("batch timed out")
            .expect("batch callback dropped")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failed_items_are_kept_and_paired_with_their_input() {
        let runner = runner(BatchConfig::DEFAULT_CAP);
        let outcome = run_to_end(&runner, vec![1, 2, 3, 4], |x: &i32| {
            if x % 2 == 0 {
                Err(Failure::transport(format!("publish {x} refused")))
            } else {
                Ok(x * 10)
            }
        })
        .await;

        let entries = outcome.into_result().unwrap();
        let items: Vec<i32> = entries.iter().map(|e| e.item).collect();
        assert_eq!(items, vec![1, 2, 3, 4]);
        assert_eq!(entries[0].outcome.value(), Some(&10));
        assert!(entries[1].outcome.is_failure());
        assert_eq!(entries[2].outcome.value(), Some(&30));
        assert!(entries[3].outcome.is_failure());
        assert_eq!(
            entries[1].outcome.failure().map(Failure::kind),
            Some(FailureKind::Transport)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn panicking_item_becomes_a_failed_entry() {
        let runner = runner(4);
        let outcome = run_to_end(&runner, vec!["ok", "boom", "ok"], |s: &&str| {
            if *s == "boom" {
                panic!("item exploded");
            }
            Ok(s.len())
        })
        .await;

        let entries = outcome.into_result().unwrap();
        assert_eq!(entries.len(), 3);
        let failure = entries[1].outcome.failure().unwrap();
        assert_eq!(failure.code(), codes::PANICKED);
        assert!(entries[0].is_success() && entries[2].is_success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_never_exceeds_parallelism() {
        let runner = runner(24);
        let parallelism = runner.parallelism();
        assert!(parallelism <= 24);

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let outcome = run_to_end(&runner, (0..1000).collect::<Vec<u32>>(), move |_| {
            let now = a.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_micros(200));
            a.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

        assert_eq!(outcome.into_result().unwrap().len(), 1000);
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= parallelism, "peak {peak} > {parallelism}");
    }

    #[tokio::test]
    async fn empty_batch_succeeds_with_no_entries() {
        let runner = runner(BatchConfig::DEFAULT_CAP);
        let outcome = run_to_end(&runner, Vec::<u8>::new(), |x: &u8| Ok(*x)).await;
        assert!(outcome.into_result().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancelling_the_batch_suppresses_its_result() {
        let runner = runner(2);
        let started = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&started);
        let (tx, rx) = oneshot::channel::<Outcome<Vec<BatchEntry<u32, u32>>>>();

        let batch = runner.run(
            (0..50).collect(),
            move |x: &u32| {
                seen.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                Ok(*x)
            },
            ExecutionContext::immediate(),
            tx,
        );

        while started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(batch.cancel());

        // the callback is dropped unused, so the receiver sees a closed channel
        let delivered = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap();
        assert!(delivered.is_err());
        assert!(started.load(Ordering::SeqCst) < 50);
    }
}
