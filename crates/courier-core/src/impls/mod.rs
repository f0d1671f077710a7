//! Bundled implementations of the ports.

pub mod single_thread;

pub use self::single_thread::SingleThreadExecutor;
