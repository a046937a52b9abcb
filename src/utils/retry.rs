use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use crate::core::{Result, UploadError};

/// 重试策略
#[derive(Debug, Clone)]
pub enum RetryStrategy {
    /// 固定延迟
    Fixed(Duration),
    /// 线性退避
    Linear {
        initial: Duration,
        increment: Duration,
        max_delay: Duration,
    },
}

impl RetryStrategy {
    /// 计算第 n 次重试的延迟
    pub fn get_delay(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::Fixed(delay) => *delay,
            RetryStrategy::Linear { initial, increment, max_delay } => {
                let delay = *initial + (*increment * attempt);
                std::cmp::min(delay, *max_delay)
            }
        }
    }
}

impl Default for RetryStrategy {
    /// 2s, 4s, 6s, 6s ...
    fn default() -> Self {
        RetryStrategy::Linear {
            initial: Duration::from_secs(2),
            increment: Duration::from_secs(2),
            max_delay: Duration::from_secs(6),
        }
    }
}

/// 重试配置
pub struct RetryConfig {
    /// 最大尝试次数
    pub max_attempts: u32,
    /// 重试策略
    pub strategy: RetryStrategy,
    /// 是否重试的判断函数
    pub should_retry: Box<dyn Fn(&UploadError) -> bool + Send + Sync>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::default(),
            should_retry: Box::new(UploadError::is_retryable),
        }
    }
}

/// 执行带重试的操作
pub async fn retry_with_config<F, Fut, T>(
    config: RetryConfig,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                attempt += 1;
                if attempt >= max_attempts || !(config.should_retry)(&error) {
                    return Err(error);
                }

                let delay = config.strategy.get_delay(attempt - 1);
                tracing::debug!(attempt, ?delay, error = %error, "retrying operation");
                sleep(delay).await;
            }
        }
    }
}

/// 重试构建器
pub struct RetryBuilder {
    config: RetryConfig,
}

impl RetryBuilder {
    pub fn new() -> Self {
        Self {
            config: RetryConfig::default(),
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn strategy(mut self, strategy: RetryStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn should_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&UploadError) -> bool + Send + Sync + 'static,
    {
        self.config.should_retry = Box::new(f);
        self
    }

    pub async fn run<F, Fut, T>(self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_with_config(self.config, operation).await
    }
}

impl Default for RetryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_linear_delays() {
        let strategy = RetryStrategy::default();
        assert_eq!(strategy.get_delay(0), Duration::from_secs(2));
        assert_eq!(strategy.get_delay(1), Duration::from_secs(4));
        assert_eq!(strategy.get_delay(2), Duration::from_secs(6));
        assert_eq!(strategy.get_delay(10), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_success() {
        let count = AtomicU32::new(0);
        let result = RetryBuilder::new().run(|| async {
            if count.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(UploadError::NoSuchUpload)
            } else {
                Ok(42)
            }
        }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_failure() {
        let count = AtomicU32::new(0);
        let result = RetryBuilder::new().run(|| async {
            count.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(UploadError::NoSuchUpload)
        }).await;

        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 3); // 默认最大尝试次数
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_on_fatal_error() {
        let count = AtomicU32::new(0);
        let result = RetryBuilder::new()
            .max_attempts(5)
            .strategy(RetryStrategy::Fixed(Duration::from_millis(10)))
            .run(|| async {
                count.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(UploadError::PartNotSequential)
            })
            .await;

        assert!(matches!(result, Err(UploadError::PartNotSequential)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
