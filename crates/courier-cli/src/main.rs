use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::oneshot;
use tokio::time::{Duration, sleep};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use courier_core::domain::codes;
use courier_core::{
    BatchRunner, ContinuousTask, CourierConfig, ExecutionContext, Failure, FailureKind, Outcome,
    Schedulers, Task,
};

#[derive(Debug, Deserialize)]
struct PublishRequest {
    topic: String,
    body: String,
}

/// ブローカーへの publish を模したブロッキング処理（たまに失敗する）
fn publish(req: &PublishRequest) -> Result<usize, Failure> {
    std::thread::sleep(Duration::from_millis(5));
    if rand::thread_rng().gen_bool(0.2) {
        return Err(Failure::new(
            FailureKind::Transport,
            codes::amqp::CHANNEL_PUBLISH,
            format!("broker refused publish to {}", req.topic),
        ));
    }
    Ok(req.body.len())
}

fn load_config() -> Result<CourierConfig, Box<dyn std::error::Error>> {
    match std::env::args().nth(1) {
        Some(path) => Ok(CourierConfig::load(path)?),
        None => Ok(CourierConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // (A) 設定と実行コンテキストを用意
    let config = load_config()?;
    let schedulers = Schedulers::current_with(&config.scheduler)?;

    // (B) 単発タスク：io 上で実行し、結果を oneshot で受け取る
    let task = Task::new(schedulers.io());
    let (tx, rx) = oneshot::channel();
    task.start(
        || Ok::<_, Failure>("connected to broker".to_string()),
        ExecutionContext::immediate(),
        tx,
    );
    match rx.await? {
        Outcome::Success(msg) => info!(task_id = %task.id(), "{msg}"),
        Outcome::Failure(failure) => warn!(task_id = %task.id(), error = %failure, "connect failed"),
    }

    // (C) バッチ publish：JSON のリクエストを並列度制限付きで投げる
    let requests: Vec<PublishRequest> = (0..40)
        .map(|i| {
            serde_json::from_value(serde_json::json!({
                "topic": format!("orders.{}", i % 4),
                "body": format!("order #{i}"),
            }))
        })
        .collect::<Result<_, _>>()?;

    let runner = BatchRunner::new(schedulers.clone(), config.batch.clone());
    info!(parallelism = runner.parallelism(), items = requests.len(), "publishing batch");
    let (tx, rx) = oneshot::channel();
    let _batch = runner.run(requests, publish, ExecutionContext::immediate(), tx);
    let entries = rx.await?.into_result()?;
    for entry in entries.iter().filter(|e| !e.is_success()) {
        if let Some(failure) = entry.outcome.failure() {
            warn!(topic = %entry.item.topic, code = failure.code(), "publish failed");
        }
    }

    // (D) 受信ループ：ContinuousTask を起動して、少し動かしてから止める
    let received = Arc::new(AtomicU32::new(0));
    let receiver = ContinuousTask::new("receiver");
    let counter = Arc::clone(&received);
    receiver.set_interruptible_body(move |token| {
        if token.is_cancelled() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
        counter.fetch_add(1, Ordering::Relaxed);
    });
    receiver.start_task()?;
    sleep(Duration::from_millis(100)).await;
    receiver.stop_task();

    info!(
        received = received.load(Ordering::Relaxed),
        running = receiver.is_running(),
        "receiver stopped"
    );
    Ok(())
}
