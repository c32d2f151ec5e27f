use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::scheduler::DeferredResetScheduler;
use crate::kernel::service_host::Service;
use crate::kernel::ServerDeps;

/// Background loop driving rule passes and due-processing.
pub struct ResetLoop {
    scheduler: Arc<DeferredResetScheduler>,
    deps: Arc<ServerDeps>,
}

impl ResetLoop {
    pub fn new(scheduler: Arc<DeferredResetScheduler>, deps: Arc<ServerDeps>) -> Self {
        Self { scheduler, deps }
    }

    /// One iteration. Errors are logged so a bad cycle never ends the loop.
    pub async fn tick(&self) {
        match self.scheduler.run_rule_pass().await {
            Ok(report) if report.rules_fired > 0 => info!(
                rules_fired = report.rules_fired,
                jobs_registered = report.jobs_registered,
                "reset rule pass complete"
            ),
            Ok(_) => {}
            Err(e) => error!(error = %e, "reset rule pass failed"),
        }

        match self
            .scheduler
            .process_due(self.deps.scheduler_config.due_batch_size)
            .await
        {
            Ok(report) => debug!(
                reset = report.reset,
                skipped = report.skipped,
                failed = report.failed,
                "due resets processed"
            ),
            Err(e) => error!(error = %e, "due reset processing failed"),
        }
    }
}

#[async_trait::async_trait]
impl Service for ResetLoop {
    fn name(&self) -> &'static str {
        "reset-loop"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        if !self.scheduler.try_start() {
            warn!("reset loop already running, not starting another");
            return Ok(());
        }

        let interval = self.deps.scheduler_config.loop_interval;
        info!(interval_secs = interval.as_secs(), "reset loop starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.tick().await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        self.scheduler.stop();
        info!("reset loop stopped");
        Ok(())
    }
}
