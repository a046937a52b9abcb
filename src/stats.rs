use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use crate::utils::SpeedCalculator;

/// 所有上传任务共享的速度统计
pub struct SpeedCounter {
    total: AtomicU64,
    calculator: SpeedCalculator,
}

impl SpeedCounter {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            calculator: SpeedCalculator::new(Duration::from_secs(5)),
        }
    }

    /// 累加已发送的字节数，返回新的累计值
    pub fn add(&self, bytes: u64) -> u64 {
        self.total.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    /// 扣除未被服务端接受的字节
    pub fn retract(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let _ = self
            .total
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |total| {
                Some(total.saturating_sub(bytes))
            });
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// 当前总速度（字节/秒）
    pub async fn speed(&self) -> u64 {
        self.calculator.add_data_point(self.total()).await;
        self.calculator.calculate_speed().await as u64
    }
}

impl Default for SpeedCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// 上传统计
pub struct UploadStatistic {
    total_size: AtomicU64,
    started_at: Instant,
}

impl UploadStatistic {
    pub fn new() -> Self {
        Self {
            total_size: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn add_total_size(&self, size: u64) {
        self.total_size.fetch_add(size, Ordering::Relaxed);
    }

    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Default for UploadStatistic {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_concurrent_increments() {
        let counter = Arc::new(SpeedCounter::new());
        let mut handles = Vec::new();

        for _ in 0..16 {
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..1000 {
                    counter.add(3);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(counter.total(), 16 * 1000 * 3);
    }

    #[test]
    fn test_retract_never_underflows() {
        let counter = SpeedCounter::new();
        counter.add(10);
        counter.retract(4);
        assert_eq!(counter.total(), 6);
        counter.retract(100);
        assert_eq!(counter.total(), 0);
    }

    #[test]
    fn test_statistic_total() {
        let statistic = UploadStatistic::new();
        statistic.add_total_size(10);
        statistic.add_total_size(32);
        assert_eq!(statistic.total_size(), 42);
    }
}
