//! App - アプリケーション層
//!
//! ports と context を組み合わせて、タスクのライフサイクルを実装します。
//!
//! # 主要コンポーネント
//! - **Task**: 単発の操作と一度きりのコールバック（キャンセル可能）
//! - **RunHandle**: 1 回の実行のハンドル（cancel / cancel_after / cancel_on_drop）
//! - **ContinuousTask**: 専用スレッド上で body を繰り返し実行するループ
//! - **BatchRunner**: 並列度を制限した fan-out / fan-in

pub mod batch;
pub mod continuous;
pub mod handle;
pub mod task;

// 主要な型を再エクスポート
pub use self::batch::{BatchEntry, BatchRunner};
pub use self::continuous::ContinuousTask;
pub use self::handle::{CancelOnDrop, RunHandle};
pub use self::task::Task;
