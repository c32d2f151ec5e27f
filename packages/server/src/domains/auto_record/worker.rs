use std::sync::Arc;

use anyhow::Result;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::pipeline::AutoRecordPipeline;
use crate::kernel::service_host::Service;
use crate::kernel::ServerDeps;

/// Drains the auto-record queue and runs the periodic sweeps.
pub struct AutoRecordWorker {
    pipeline: Arc<AutoRecordPipeline>,
    deps: Arc<ServerDeps>,
}

impl AutoRecordWorker {
    pub fn new(pipeline: Arc<AutoRecordPipeline>, deps: Arc<ServerDeps>) -> Self {
        Self { pipeline, deps }
    }

    /// Stranded results first, then a bounded slice of permanent failures.
    pub async fn sweep(&self) {
        let config = &self.deps.auto_record_config;
        if let Err(e) = self.pipeline.requeue_stranded(config.stranded_batch).await {
            error!(error = %e, "stranded auto-record sweep failed");
        }
        if let Err(e) = self.pipeline.retry_failed(config.retry_failed_batch).await {
            error!(error = %e, "retry-failed sweep failed");
        }
    }
}

#[async_trait::async_trait]
impl Service for AutoRecordWorker {
    fn name(&self) -> &'static str {
        "auto-record"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let poll = self.deps.auto_record_config.poll_interval;
        let sweep_every = self.deps.auto_record_config.sweep_interval;
        info!(poll_secs = poll.as_secs(), "auto-record worker starting");

        self.sweep().await;
        let mut last_sweep = Instant::now();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if last_sweep.elapsed() >= sweep_every {
                self.sweep().await;
                last_sweep = Instant::now();
            }

            // A full batch means more may be waiting; go again without sleeping.
            let drained = match self.pipeline.process_batch().await {
                Ok(report) => report.processed < self.deps.auto_record_config.batch_size,
                Err(e) => {
                    error!(error = %e, "auto-record batch failed");
                    true
                }
            };

            if drained {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }

        info!("auto-record worker stopped");
        Ok(())
    }
}
