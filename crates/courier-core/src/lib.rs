//! courier-core
//!
//! Core building blocks for running blocking work off the caller's thread
//! and reporting the outcome back exactly once.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, failure, outcome, state）
//! - **ports**: 抽象化レイヤー（Executor, TaskCallback）
//! - **context**: 実行コンテキスト（io / compute / executor / immediate）
//! - **app**: Task, ContinuousTask, BatchRunner
//! - **fault**: タスク処理から漏れた失敗の分類とエスカレーション
//! - **impls**: 実装（SingleThreadExecutor）
//! - **config**: 設定（JSON から読み込み可能）

pub mod app;
pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod fault;
pub mod impls;
pub mod ports;

pub use crate::app::{BatchEntry, BatchRunner, ContinuousTask, RunHandle, Task};
pub use crate::config::{BatchConfig, CourierConfig, SchedulerConfig};
pub use crate::context::{ExecutionContext, Schedulers};
pub use crate::domain::{Failure, FailureKind, Outcome, TaskState};
pub use crate::error::CourierError;
pub use crate::fault::{Disposition, FaultHandler};
pub use crate::ports::TaskCallback;
