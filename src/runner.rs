use tokio::time::sleep;
use tracing::debug;
use crate::config::UploadConfig;
use crate::core::TaskResult;
use crate::orchestrator::UploadOrchestrator;
use crate::utils::RetryStrategy;

/// 按重试预算反复运行编排器，并在结束时触发回调
#[derive(Debug, Clone)]
pub struct TaskRunner {
    max_retries: u32,
    strategy: RetryStrategy,
}

impl TaskRunner {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            strategy: RetryStrategy::default(),
        }
    }

    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(config.max_retries)
    }

    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub async fn run(&self, orchestrator: &mut UploadOrchestrator) -> TaskResult {
        let cancel = orchestrator.cancel_token();
        let mut retries = 0;

        loop {
            let result = orchestrator.run().await;

            if result.succeed {
                orchestrator.on_success(&result).await;
                return result;
            }
            if result.cancelled {
                orchestrator.on_cancel(&result).await;
                return result;
            }
            if !result.need_retry || retries >= self.max_retries {
                orchestrator.on_failed(&result).await;
                return result;
            }

            retries += 1;
            orchestrator.on_retry(&result, retries, self.max_retries);

            let delay = self.strategy.get_delay(retries - 1);
            debug!(?delay, "waiting before retry");
            tokio::select! {
                _ = cancel.cancelled() => {
                    let result = TaskResult::cancelled();
                    orchestrator.on_cancel(&result).await;
                    return result;
                }
                _ = sleep(delay) => {}
            }
        }
    }
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::from_config(&UploadConfig::default())
    }
}
