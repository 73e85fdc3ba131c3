//! 重试机制实现
//!
//! 提供带指数退避和抖动的重试逻辑，下载器用它处理瞬时网络故障

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// 可判断是否为瞬时故障的错误
///
/// 只有瞬时故障（连接重置、5xx 等）会被重试
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// 最大重试次数（不含首次请求）
    pub max_retries: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 8000,
        }
    }
}

impl RetryConfig {
    /// 创建新的重试配置
    pub fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
        }
    }
}

/// 重试器
#[derive(Debug, Clone)]
pub struct Retrier {
    config: RetryConfig,
}

impl Retrier {
    /// 创建新的重试器
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// 计算第 N 次重试的退避时间（指数退避 + 抖动）
    ///
    /// 公式: min(base_delay * 2^attempt + jitter, max_delay)
    /// 其中 jitter 是 [0, base_delay) 范围内的随机值
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let jitter_factor = rand::thread_rng().gen_range(0.0..1.0);
        self.backoff_delay_with_jitter(attempt, jitter_factor)
    }

    /// 计算退避时间（可指定抖动因子，用于测试）
    ///
    /// jitter_factor 应在 [0.0, 1.0) 范围内
    pub fn backoff_delay_with_jitter(&self, attempt: u32, jitter_factor: f64) -> Duration {
        let base = self.config.base_delay_ms as f64;
        let max = self.config.max_delay_ms as f64;

        let exponential = base * 2_f64.powi(attempt.min(30) as i32);
        let jitter = base * jitter_factor.clamp(0.0, 1.0);
        let delay = (exponential + jitter).min(max);

        Duration::from_millis(delay as u64)
    }

    /// 带重试执行异步操作
    ///
    /// 非瞬时错误立即返回；瞬时错误在重试次数耗尽后返回最后一次的错误
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + std::fmt::Display,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match operation(attempt).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt <= self.config.max_retries => {
                    let delay = self.backoff_delay(attempt - 1);
                    tracing::warn!(
                        "[RETRY] 第 {} 次尝试失败，{}ms 后重试: {}",
                        attempt,
                        delay.as_millis(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 同步计算重试序列的所有退避时间
    #[cfg(test)]
    pub(crate) fn compute_backoff_sequence(&self, jitter_factor: f64) -> Vec<Duration> {
        (0..self.config.max_retries)
            .map(|attempt| self.backoff_delay_with_jitter(attempt, jitter_factor))
            .collect()
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError {
        transient: bool,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error (transient={})", self.transient)
        }
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            self.transient
        }
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay_ms, 500);
        assert_eq!(config.max_delay_ms, 8000);
    }

    #[test]
    fn test_backoff_delay_no_jitter() {
        let retrier = Retrier::new(RetryConfig::new(5, 1000, 30000));

        assert_eq!(
            retrier.backoff_delay_with_jitter(0, 0.0),
            Duration::from_millis(1000)
        );
        assert_eq!(
            retrier.backoff_delay_with_jitter(1, 0.0),
            Duration::from_millis(2000)
        );
        assert_eq!(
            retrier.backoff_delay_with_jitter(3, 0.0),
            Duration::from_millis(8000)
        );
    }

    #[test]
    fn test_backoff_delay_with_jitter() {
        let retrier = Retrier::new(RetryConfig::new(5, 1000, 30000));

        assert_eq!(
            retrier.backoff_delay_with_jitter(0, 0.5),
            Duration::from_millis(1500)
        );
        assert_eq!(
            retrier.backoff_delay_with_jitter(1, 0.5),
            Duration::from_millis(2500)
        );
    }

    #[test]
    fn test_backoff_delay_max_cap() {
        let retrier = Retrier::new(RetryConfig::new(10, 1000, 5000));

        assert_eq!(
            retrier.backoff_delay_with_jitter(5, 0.0),
            Duration::from_millis(5000)
        );
        assert_eq!(
            retrier.backoff_delay_with_jitter(40, 0.0),
            Duration::from_millis(5000)
        );
    }

    #[test]
    fn test_compute_backoff_sequence() {
        let retrier = Retrier::new(RetryConfig::new(3, 1000, 30000));

        let sequence = retrier.compute_backoff_sequence(0.0);
        assert_eq!(
            sequence,
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000)
            ]
        );
    }

    #[tokio::test]
    async fn test_execute_success_first_try() {
        let retrier = Retrier::new(RetryConfig::default());

        let result: Result<i32, TestError> = retrier.execute(|_| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_execute_non_transient_error_not_retried() {
        let retrier = Retrier::new(RetryConfig::new(3, 1, 2));
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result: Result<i32, TestError> = retrier
            .execute(|_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(TestError { transient: false })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_recovers_after_transient_errors() {
        let retrier = Retrier::new(RetryConfig::new(3, 1, 2));

        let result: Result<u32, TestError> = retrier
            .execute(|attempt| async move {
                if attempt < 3 {
                    Err(TestError { transient: true })
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
    }
}
