//! Auto-record pipeline tests: queueing, dedupe, retries and sweeps.

mod common;

use std::time::Duration as StdDuration;

use common::{ml_payload, price, TestHarness};
use crawl_core::common::{JobId, ResultId};
use crawl_core::domains::auto_record::{AutoRecordWorker, ProcessOutcome};
use crawl_core::domains::crawl_jobs::models::{AutoRecordStatus, CrawlResult};
use crawl_core::domains::crawl_jobs::store::JobStore;
use crawl_core::kernel::cache::CacheBackend;
use crawl_core::kernel::Service;
use rust_decimal::Decimal;
use test_context::test_context;
use tokio_util::sync::CancellationToken;

const TARGET: &str = "https://shop.test/widget";

/// Lease `job_id` for `bot-a` and submit `amount` USD; returns the stored result.
async fn crawl_once(ctx: &TestHarness, job_id: JobId, amount: Decimal) -> CrawlResult {
    let pulled = ctx.pull("bot-a", 1).await.unwrap();
    assert_eq!(pulled.jobs[0].job_id, job_id);
    ctx.submit_success("bot-a", job_id, amount).await.unwrap();
    result_for(ctx, job_id).await
}

async fn result_for(ctx: &TestHarness, job_id: JobId) -> CrawlResult {
    ctx.deps
        .job_store
        .find_result_for_job(job_id)
        .await
        .unwrap()
        .expect("result stored")
}

async fn result(ctx: &TestHarness, id: ResultId) -> CrawlResult {
    ctx.deps
        .job_store
        .find_result(id)
        .await
        .unwrap()
        .expect("result stored")
}

#[test_context(TestHarness)]
#[tokio::test]
async fn successful_crawl_is_recorded_once(ctx: &TestHarness) {
    ctx.register_bot("bot-a").await;
    let job = ctx.enqueue_target(TARGET).await;

    let queued = crawl_once(ctx, job.id, price(9999)).await;
    assert_eq!(queued.auto_record_status, AutoRecordStatus::Queued);
    assert_eq!(ctx.services.auto_record.queue_depth().await.unwrap(), 1);

    let report = ctx.services.auto_record.process_batch().await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.recorded, 1);

    let recorded = result(ctx, queued.id).await;
    assert!(recorded.recorded);
    assert_eq!(recorded.auto_record_status, AutoRecordStatus::Completed);

    let history = ctx.deps.price_history.entries_for(TARGET);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].price, price(9999));
    assert_eq!(history[0].currency, "USD");
    assert!(history[0].available);

    // Redelivery of an already recorded result writes nothing.
    assert_eq!(
        ctx.services.auto_record.process_one(queued.id).await,
        ProcessOutcome::Skipped
    );
    assert_eq!(ctx.deps.price_history.entries_for(TARGET).len(), 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn unchanged_price_is_not_written_again(ctx: &TestHarness) {
    ctx.register_bot("bot-a").await;
    let job = ctx.enqueue_target(TARGET).await;

    crawl_once(ctx, job.id, price(9999)).await;
    ctx.services.auto_record.process_batch().await.unwrap();

    // Next day: the job is reset, crawled again at an equal price.
    ctx.advance_secs(24 * 3600);
    let second = crawl_once(ctx, job.id, Decimal::new(999900, 4)).await;
    let report = ctx.services.auto_record.process_batch().await.unwrap();
    assert_eq!(report.duplicates, 1);

    let second = result(ctx, second.id).await;
    assert_eq!(second.auto_record_status, AutoRecordStatus::Completed);
    assert_eq!(second.auto_record_reason.as_deref(), Some("duplicate"));
    assert!(!second.recorded);
    assert_eq!(ctx.deps.price_history.entries_for(TARGET).len(), 1);

    // A price change is recorded.
    ctx.advance_secs(24 * 3600);
    crawl_once(ctx, job.id, price(8999)).await;
    let report = ctx.services.auto_record.process_batch().await.unwrap();
    assert_eq!(report.recorded, 1);

    let history = ctx.deps.price_history.entries_for(TARGET);
    assert_eq!(history.len(), 2);
    assert_eq!(history.last().unwrap().price, price(8999));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn transient_sink_failures_are_retried(ctx: &TestHarness) {
    ctx.register_bot("bot-a").await;
    let job = ctx.enqueue_target(TARGET).await;
    ctx.deps.price_history.fail_next(2);

    let queued = crawl_once(ctx, job.id, price(1500)).await;
    let pipeline = &ctx.services.auto_record;

    assert_eq!(pipeline.process_batch().await.unwrap().retrying, 1);
    let retrying = result(ctx, queued.id).await;
    assert_eq!(retrying.auto_record_status, AutoRecordStatus::Queued);
    assert!(retrying
        .auto_record_reason
        .as_deref()
        .unwrap_or_default()
        .starts_with("attempt 1 failed"));

    assert_eq!(pipeline.process_batch().await.unwrap().retrying, 1);
    assert_eq!(pipeline.process_batch().await.unwrap().recorded, 1);

    assert_eq!(ctx.deps.price_history.writes_attempted(), 3);
    assert_eq!(ctx.deps.price_history.entries_for(TARGET).len(), 1);
    assert_eq!(pipeline.failed_count().await.unwrap(), 0);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn exhausted_retries_land_in_failed_set_until_retried(ctx: &TestHarness) {
    ctx.register_bot("bot-a").await;
    let job = ctx.enqueue_target(TARGET).await;
    ctx.deps.price_history.fail_next(100);

    let queued = crawl_once(ctx, job.id, price(1500)).await;
    let pipeline = &ctx.services.auto_record;

    pipeline.process_batch().await.unwrap();
    pipeline.process_batch().await.unwrap();
    let report = pipeline.process_batch().await.unwrap();
    assert_eq!(report.failed, 1);

    let failed = result(ctx, queued.id).await;
    assert_eq!(failed.auto_record_status, AutoRecordStatus::Failed);
    assert_eq!(pipeline.failed_count().await.unwrap(), 1);
    assert_eq!(pipeline.queue_depth().await.unwrap(), 0);

    // The sink recovers; an operator (or the worker sweep) retries.
    ctx.deps.price_history.fail_next(0);
    assert_eq!(pipeline.retry_failed(10).await.unwrap(), 1);
    assert_eq!(
        result(ctx, queued.id).await.auto_record_status,
        AutoRecordStatus::Queued
    );
    assert_eq!(pipeline.process_batch().await.unwrap().recorded, 1);
    assert_eq!(pipeline.failed_count().await.unwrap(), 0);
    assert_eq!(ctx.deps.price_history.entries_for(TARGET).len(), 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn ineligible_results_are_never_queued(ctx: &TestHarness) {
    ctx.register_bot("bot-a").await;
    let job = ctx.enqueue_target(TARGET).await;
    ctx.pull("bot-a", 1).await.unwrap();

    let mut request = ctx.success_request("bot-a", job.id, price(2500), "usd");
    request.in_stock = Some(false);
    ctx.services.submit.submit(request).await.unwrap();

    let stored = result_for(ctx, job.id).await;
    assert_eq!(stored.currency, "USD");
    assert_eq!(stored.auto_record_status, AutoRecordStatus::Ineligible);
    assert_eq!(stored.auto_record_reason.as_deref(), Some("out of stock"));
    assert_eq!(ctx.services.auto_record.queue_depth().await.unwrap(), 0);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn low_confidence_ml_reading_is_ineligible(ctx: &TestHarness) {
    ctx.register_bot("bot-a").await;
    let job = ctx.enqueue_target(TARGET).await;
    ctx.pull("bot-a", 1).await.unwrap();

    let mut request = ctx.success_request("bot-a", job.id, price(1000), "USD");
    request.structured_payload = Some(ml_payload(0.5));
    ctx.services.submit.submit(request).await.unwrap();

    let stored = result_for(ctx, job.id).await;
    assert_eq!(stored.auto_record_status, AutoRecordStatus::Ineligible);
    assert!(stored
        .auto_record_reason
        .as_deref()
        .unwrap_or_default()
        .starts_with("ml confidence"));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn failed_crawls_are_kept_but_not_recorded(ctx: &TestHarness) {
    ctx.register_bot("bot-a").await;
    let job = ctx.enqueue_target(TARGET).await;
    ctx.pull("bot-a", 1).await.unwrap();
    ctx.submit_failure("bot-a", job.id, "captcha").await.unwrap();

    let stored = result_for(ctx, job.id).await;
    assert!(!stored.succeeded);
    assert_eq!(stored.price, Decimal::ZERO);
    assert_eq!(stored.auto_record_status, AutoRecordStatus::Ineligible);
    let failure = stored.structured_payload.failure.clone().expect("failure recorded");
    assert_eq!(failure.message, "captcha");
    assert!(failure.will_retry);
    assert_eq!(ctx.services.auto_record.queue_depth().await.unwrap(), 0);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn sweep_requeues_stranded_results(ctx: &TestHarness) {
    ctx.register_bot("bot-a").await;
    let first = ctx.enqueue_target("https://shop.test/one").await;
    let second = ctx.enqueue_target("https://shop.test/two").await;

    ctx.pull("bot-a", 2).await.unwrap();
    ctx.submit_success("bot-a", first.id, price(100)).await.unwrap();
    ctx.submit_success("bot-a", second.id, price(200)).await.unwrap();

    // Simulate a lost queue: one result never made it, one was mid-write.
    let pipeline = &ctx.services.auto_record;
    pipeline.process_batch().await.unwrap();
    let lost = result_for(ctx, first.id).await;
    let interrupted = result_for(ctx, second.id).await;
    ctx.deps
        .job_store
        .set_auto_record_status(lost.id, AutoRecordStatus::Eligible, None, ctx.now())
        .await
        .unwrap();
    ctx.deps
        .job_store
        .set_auto_record_status(interrupted.id, AutoRecordStatus::Processing, None, ctx.now())
        .await
        .unwrap();

    let worker = AutoRecordWorker::new(pipeline.clone(), ctx.server_deps.clone());
    worker.sweep().await;
    assert_eq!(pipeline.queue_depth().await.unwrap(), 2);

    // Both were already written, so this pass only repairs their status.
    pipeline.process_batch().await.unwrap();
    assert_eq!(
        result(ctx, lost.id).await.auto_record_status,
        AutoRecordStatus::Completed
    );
    assert_eq!(
        result(ctx, interrupted.id).await.auto_record_status,
        AutoRecordStatus::Completed
    );
    assert_eq!(ctx.deps.price_history.entries_for("https://shop.test/one").len(), 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn flushed_queue_is_rebuilt_from_queued_results(ctx: &TestHarness) {
    ctx.register_bot("bot-a").await;
    let job = ctx.enqueue_target(TARGET).await;
    let queued = crawl_once(ctx, job.id, price(1250)).await;
    assert_eq!(queued.auto_record_status, AutoRecordStatus::Queued);

    // The backend loses the queue (flush, restart, crash after pop).
    let queue = ctx.server_deps.cache.keys().auto_record_queue();
    ctx.deps.backend.del(&queue).await.unwrap();
    let pipeline = &ctx.services.auto_record;
    assert_eq!(pipeline.queue_depth().await.unwrap(), 0);

    let worker = AutoRecordWorker::new(pipeline.clone(), ctx.server_deps.clone());

    // Within the grace period the result is assumed to still be queued.
    worker.sweep().await;
    assert_eq!(pipeline.queue_depth().await.unwrap(), 0);

    let grace = ctx.server_deps.auto_record_config.queued_grace;
    ctx.advance_secs(grace.num_seconds() + 1);
    worker.sweep().await;
    assert_eq!(pipeline.queue_depth().await.unwrap(), 1);

    assert_eq!(pipeline.process_batch().await.unwrap().recorded, 1);
    assert!(result(ctx, queued.id).await.recorded);
    assert_eq!(ctx.deps.price_history.entries_for(TARGET).len(), 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn delivery_is_skipped_while_another_worker_holds_the_guard(ctx: &TestHarness) {
    ctx.register_bot("bot-a").await;
    let job = ctx.enqueue_target(TARGET).await;
    let queued = crawl_once(ctx, job.id, price(1250)).await;

    let guard = ctx.server_deps.cache.keys().auto_record_processing(queued.id);
    ctx.deps.backend.set(&guard, b"1", None).await.unwrap();

    let report = ctx.services.auto_record.process_batch().await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.recorded, 0);
    assert_eq!(ctx.deps.price_history.writes_attempted(), 0);
    assert!(ctx.deps.price_history.entries_for(TARGET).is_empty());
    assert!(!result(ctx, queued.id).await.recorded);

    // Once the holder lets go, the next delivery records it.
    ctx.deps.backend.del(&guard).await.unwrap();
    assert_eq!(
        ctx.services.auto_record.process_one(queued.id).await,
        ProcessOutcome::Recorded
    );
    assert_eq!(ctx.deps.price_history.entries_for(TARGET).len(), 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn worker_drains_queue_until_cancelled(ctx: &TestHarness) {
    ctx.register_bot("bot-a").await;
    let job = ctx.enqueue_target(TARGET).await;
    let queued = crawl_once(ctx, job.id, price(4200)).await;

    let worker = AutoRecordWorker::new(ctx.services.auto_record.clone(), ctx.server_deps.clone());
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(Box::new(worker).run(shutdown.clone()));

    let recorded = tokio::time::timeout(StdDuration::from_secs(5), async {
        loop {
            if result(ctx, queued.id).await.recorded {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
    })
    .await;
    assert!(recorded.is_ok(), "worker did not record the result");

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}
