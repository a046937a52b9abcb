use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use crate::core::TransferStatus;

/// 速度计算器
pub struct SpeedCalculator {
    /// 历史记录 (时间, 累计字节)
    history: Mutex<VecDeque<(Instant, u64)>>,
    /// 历史窗口大小
    window_size: Duration,
    /// 最大历史记录数
    max_entries: usize,
}

impl SpeedCalculator {
    pub fn new(window_size: Duration) -> Self {
        Self {
            history: Mutex::new(VecDeque::new()),
            window_size,
            max_entries: 100,
        }
    }

    /// 添加数据点，`total_bytes` 为累计值
    pub async fn add_data_point(&self, total_bytes: u64) {
        let now = Instant::now();
        let mut history = self.history.lock().await;

        history.push_back((now, total_bytes));

        // 移除过期的数据点
        if let Some(cutoff) = now.checked_sub(self.window_size) {
            while let Some(&(time, _)) = history.front() {
                if time < cutoff && history.len() > 2 {
                    history.pop_front();
                } else {
                    break;
                }
            }
        }

        while history.len() > self.max_entries {
            history.pop_front();
        }
    }

    /// 计算当前速度（字节/秒）
    pub async fn calculate_speed(&self) -> f64 {
        let history = self.history.lock().await;

        let (Some(first), Some(last)) = (history.front(), history.back()) else {
            return 0.0;
        };
        if history.len() < 2 {
            return 0.0;
        }

        let duration = last.0.duration_since(first.0).as_secs_f64();
        let bytes = last.1.saturating_sub(first.1);

        if duration > 0.0 {
            bytes as f64 / duration
        } else {
            0.0
        }
    }

    /// 估算剩余时间
    pub async fn estimate_eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.calculate_speed().await;

        if speed > 0.0 {
            Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
        } else {
            None
        }
    }
}

/// 给进度输出使用的一行进度信息
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    pub uploaded: u64,
    pub total: u64,
    pub percentage: f64,
    pub speed: u64,
    /// 所有任务的总速度
    pub aggregate_speed: u64,
    pub elapsed: Duration,
    pub time_left: Option<Duration>,
}

impl ProgressReport {
    pub fn from_status(status: &TransferStatus, aggregate_speed: u64) -> Self {
        let percentage = if status.total > 0 {
            status.uploaded as f64 / status.total as f64 * 100.0
        } else {
            100.0
        };

        Self {
            uploaded: status.uploaded,
            total: status.total,
            percentage,
            speed: status.speed,
            aggregate_speed,
            elapsed: status.elapsed,
            time_left: status.time_left,
        }
    }
}

impl fmt::Display for ProgressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 速度为 0 时剩余时间未知，用 - 代替
        let left = self
            .time_left
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string());

        write!(
            f,
            "↑ {}/{}({:.2}%) {}({}) in {}, left {}",
            format_bytes(self.uploaded),
            format_bytes(self.total),
            self.percentage,
            format_speed(self.speed as f64),
            format_speed(self.aggregate_speed as f64),
            format_duration(self.elapsed),
            left,
        )
    }
}

/// 格式化字节数
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const UNIT_SIZE: f64 = 1024.0;

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= UNIT_SIZE && unit_index < UNITS.len() - 1 {
        size /= UNIT_SIZE;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// 格式化速度
pub fn format_speed(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_second as u64))
}

/// 格式化持续时间
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_utils() {
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");

        assert_eq!(format_speed(1024.0), "1.00 KB/s");
        assert_eq!(format_speed(1048576.0), "1.00 MB/s");

        assert_eq!(format_duration(Duration::from_secs(59)), "59s");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m 0s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn test_progress_report_line() {
        let status = TransferStatus {
            uploaded: 512 * 1024,
            total: 1024 * 1024,
            speed: 1024,
            elapsed: Duration::from_secs(3),
            time_left: None,
        };

        let report = ProgressReport::from_status(&status, 2048);
        assert_eq!(report.percentage, 50.0);
        assert_eq!(
            report.to_string(),
            "↑ 512.00 KB/1.00 MB(50.00%) 1.00 KB/s(2.00 KB/s) in 3s, left -"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_calculator() {
        let calculator = SpeedCalculator::new(Duration::from_secs(5));
        assert_eq!(calculator.calculate_speed().await, 0.0);

        calculator.add_data_point(0).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        calculator.add_data_point(2048).await;

        let speed = calculator.calculate_speed().await;
        assert!(speed > 0.0);
        assert!(calculator.estimate_eta(1024).await.is_some());
    }
}
