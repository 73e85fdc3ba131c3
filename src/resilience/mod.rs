//! 容错机制模块
//!
//! 提供重试与指数退避

mod retry;

pub use retry::{Retrier, RetryConfig, Transient};
