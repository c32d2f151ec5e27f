//! Pull/submit protocol tests over the in-memory stores.

mod common;

use chrono::Duration;
use common::{price, TestHarness, CREDENTIAL};
use crawl_core::common::{CoordinatorError, LeaseConflict};
use crawl_core::domains::bots::BotIdentity;
use crawl_core::domains::crawl_jobs::actions::{PullRequest, SubmitResponse};
use crawl_core::domains::crawl_jobs::models::{JobStatus, NewCrawlJob};
use crawl_core::domains::crawl_jobs::store::JobStore;
use test_context::test_context;

#[test_context(TestHarness)]
#[tokio::test]
async fn pull_leases_oldest_job_and_success_schedules_reset(ctx: &TestHarness) {
    ctx.register_bot("bot-a").await;
    ctx.register_bot("bot-b").await;

    let mut jobs = Vec::new();
    for i in 0..5 {
        jobs.push(ctx.enqueue_target(&format!("https://shop.test/p/{}", i)).await);
    }
    let oldest = jobs[0].id;

    let pulled = ctx.pull("bot-a", 1).await.unwrap();
    assert_eq!(pulled.count, 1);
    assert_eq!(pulled.jobs[0].job_id, oldest);

    let locked = ctx.job(oldest).await;
    assert_eq!(locked.status, JobStatus::Locked);
    assert_eq!(locked.lock_owner.as_deref(), Some("bot-a"));
    assert!(locked.lease_invariant_holds());

    // Another bot cannot submit for a job it does not hold.
    let err = ctx.submit_success("bot-b", oldest, price(100)).await.unwrap_err();
    assert_eq!(err.code(), "not_assigned");

    let submitted_at = ctx.now();
    let response = ctx.submit_success("bot-a", oldest, price(9999)).await.unwrap();
    match response {
        SubmitResponse::Done {
            job_id,
            price: recorded,
            currency,
            next_reset_at,
            ..
        } => {
            assert_eq!(job_id, oldest);
            assert_eq!(recorded, price(9999));
            assert_eq!(currency, "USD");
            assert_eq!(next_reset_at, submitted_at + Duration::hours(24));
        }
        other => panic!("expected done, got {:?}", other),
    }

    let done = ctx.job(oldest).await;
    assert_eq!(done.status, JobStatus::Done);
    assert!(done.lock_owner.is_none());
    assert!(done.lease_invariant_holds());

    let result = ctx
        .deps
        .job_store
        .find_result_for_job(oldest)
        .await
        .unwrap()
        .expect("result stored");
    assert!(result.succeeded);
    assert_eq!(result.price, price(9999));

    let bot = ctx.bot("bot-a").await;
    assert_eq!(bot.pulled, 1);
    assert_eq!(bot.completed, 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn concurrent_pulls_never_share_a_job(ctx: &TestHarness) {
    ctx.register_bot("bot-a").await;
    ctx.register_bot("bot-b").await;
    let job = ctx.enqueue_target("https://shop.test/only").await;

    let (a, b) = tokio::join!(ctx.pull("bot-a", 1), ctx.pull("bot-b", 1));
    let a = a.unwrap();
    let b = b.unwrap();

    assert_eq!(a.count + b.count, 1, "exactly one bot wins the lease");
    let winner = if a.count == 1 { "bot-a" } else { "bot-b" };
    assert_eq!(ctx.job(job.id).await.lock_owner.as_deref(), Some(winner));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn second_success_is_rejected_as_not_locked(ctx: &TestHarness) {
    ctx.register_bot("bot-a").await;
    let job = ctx.enqueue_target("https://shop.test/a").await;

    ctx.pull("bot-a", 1).await.unwrap();
    ctx.submit_success("bot-a", job.id, price(500)).await.unwrap();

    let err = ctx.submit_success("bot-a", job.id, price(500)).await.unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::LeaseConflict(LeaseConflict::NotLocked)
    ));
    assert_eq!(ctx.job(job.id).await.status, JobStatus::Done);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn failures_retry_until_max_retries(ctx: &TestHarness) {
    ctx.register_bot("bot-a").await;
    let job = ctx
        .enqueue(
            NewCrawlJob::builder()
                .target_ref("https://shop.test/flaky")
                .max_retries(3)
                .build(),
        )
        .await;

    for attempt in 1..=2 {
        let pulled = ctx.pull("bot-a", 1).await.unwrap();
        assert_eq!(pulled.count, 1, "attempt {} should lease the job", attempt);

        match ctx.submit_failure("bot-a", job.id, "timeout").await.unwrap() {
            SubmitResponse::Pending { retry_count, .. } => assert_eq!(retry_count, attempt),
            other => panic!("expected pending, got {:?}", other),
        }
        let pending = ctx.job(job.id).await;
        assert_eq!(pending.status, JobStatus::Pending);
        assert_eq!(pending.last_error.as_deref(), Some("timeout"));
    }

    ctx.pull("bot-a", 1).await.unwrap();
    match ctx.submit_failure("bot-a", job.id, "timeout").await.unwrap() {
        SubmitResponse::Failed {
            retry_count,
            max_retries,
            error,
            ..
        } => {
            assert_eq!(retry_count, 3);
            assert_eq!(max_retries, 3);
            assert_eq!(error, "timeout");
        }
        other => panic!("expected failed, got {:?}", other),
    }

    let failed = ctx.job(job.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.retry_count <= failed.max_retries);

    // FAILED jobs are not handed out again.
    assert_eq!(ctx.pull("bot-a", 1).await.unwrap().count, 0);
    assert_eq!(ctx.bot("bot-a").await.failed, 3);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn failure_without_retry_fails_immediately(ctx: &TestHarness) {
    ctx.register_bot("bot-a").await;
    let job = ctx.enqueue_target("https://shop.test/gone").await;
    ctx.pull("bot-a", 1).await.unwrap();

    let response = ctx
        .services
        .submit
        .submit(crawl_core::domains::crawl_jobs::actions::SubmitRequest {
            bot_id: "bot-a".into(),
            credential: CREDENTIAL.into(),
            job_id: job.id.to_string(),
            success: false,
            error_message: Some("404".into()),
            retry: Some(false),
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(matches!(response, SubmitResponse::Failed { retry_count: 1, .. }));
    assert_eq!(ctx.job(job.id).await.status, JobStatus::Failed);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn expired_lease_is_reclaimed_and_late_submit_refused(ctx: &TestHarness) {
    ctx.register_bot("bot-a").await;
    ctx.register_bot("bot-b").await;
    let job = ctx
        .enqueue(
            NewCrawlJob::builder()
                .target_ref("https://shop.test/slow")
                .lock_ttl_seconds(1)
                .build(),
        )
        .await;

    assert_eq!(ctx.pull("bot-a", 1).await.unwrap().count, 1);
    ctx.advance_secs(2);

    let reclaimed = ctx.pull("bot-b", 1).await.unwrap();
    assert_eq!(reclaimed.count, 1);
    assert_eq!(reclaimed.jobs[0].job_id, job.id);

    let stored = ctx.job(job.id).await;
    assert_eq!(stored.lock_owner.as_deref(), Some("bot-b"));
    assert_eq!(stored.expired_owner.as_deref(), Some("bot-a"));

    let err = ctx.submit_success("bot-a", job.id, price(100)).await.unwrap_err();
    assert_eq!(err.code(), "lease_expired");

    // The new holder is unaffected.
    ctx.submit_success("bot-b", job.id, price(100)).await.unwrap();
    assert_eq!(ctx.job(job.id).await.status, JobStatus::Done);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn late_submit_on_unclaimed_expired_lease_expires_the_job(ctx: &TestHarness) {
    ctx.register_bot("bot-a").await;
    let job = ctx
        .enqueue(
            NewCrawlJob::builder()
                .target_ref("https://shop.test/abandoned")
                .lock_ttl_seconds(1)
                .build(),
        )
        .await;

    ctx.pull("bot-a", 1).await.unwrap();
    ctx.advance_secs(5);

    let err = ctx.submit_success("bot-a", job.id, price(100)).await.unwrap_err();
    assert_eq!(err.code(), "lease_expired");

    let expired = ctx.job(job.id).await;
    assert_eq!(expired.status, JobStatus::Expired);
    assert!(expired.lease_invariant_holds());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn bot_lock_ttl_overrides_job_ttl(ctx: &TestHarness) {
    ctx.register(BotIdentity::new("bot-a", CREDENTIAL, ctx.now()).with_lock_ttl(900))
        .await;
    ctx.enqueue_target("https://shop.test/a").await;

    let pulled = ctx.pull("bot-a", 1).await.unwrap();
    let leased = &pulled.jobs[0];
    assert_eq!(leased.timeout_seconds, 900);
    assert_eq!(leased.lease_expires_at, ctx.now() + Duration::seconds(900));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn pull_respects_bot_limit_and_rejects_bad_max(ctx: &TestHarness) {
    ctx.register(BotIdentity::new("bot-a", CREDENTIAL, ctx.now()).with_max_jobs_per_pull(2))
        .await;
    for i in 0..4 {
        ctx.enqueue_target(&format!("https://shop.test/{}", i)).await;
    }

    assert_eq!(ctx.pull("bot-a", 10).await.unwrap().count, 2);

    let err = ctx.pull("bot-a", 0).await.unwrap_err();
    assert_eq!(err.code(), "validation_error");
}

#[test_context(TestHarness)]
#[tokio::test]
async fn unbounded_bot_limit_pulls_everything_available(ctx: &TestHarness) {
    ctx.register(BotIdentity::new("bot-a", CREDENTIAL, ctx.now()).with_max_jobs_per_pull(i64::MAX))
        .await;
    for i in 0..3 {
        ctx.enqueue_target(&format!("https://shop.test/{}", i)).await;
    }

    assert_eq!(ctx.pull("bot-a", i64::MAX).await.unwrap().count, 3);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn higher_priority_jobs_are_leased_first(ctx: &TestHarness) {
    ctx.register_bot("bot-a").await;
    ctx.enqueue_target("https://shop.test/low").await;
    let urgent = ctx
        .enqueue(
            NewCrawlJob::builder()
                .target_ref("https://shop.test/urgent")
                .priority(10)
                .build(),
        )
        .await;

    let pulled = ctx.pull("bot-a", 1).await.unwrap();
    assert_eq!(pulled.jobs[0].job_id, urgent.id);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn target_filter_limits_candidates(ctx: &TestHarness) {
    ctx.register_bot("bot-a").await;
    ctx.register(
        BotIdentity::new("bot-restricted", CREDENTIAL, ctx.now()).with_target_filter("shop-b.test"),
    )
    .await;

    ctx.enqueue_target("https://shop-a.test/1").await;
    let b = ctx.enqueue_target("https://shop-b.test/1").await;

    let pulled = ctx
        .services
        .pull
        .pull(PullRequest {
            bot_id: "bot-a".into(),
            credential: CREDENTIAL.into(),
            max_jobs: Some(5),
            target_filter: Some("SHOP-B.test".into()),
        })
        .await
        .unwrap();
    assert_eq!(pulled.count, 1);
    assert_eq!(pulled.jobs[0].job_id, b.id);

    // A restricted bot cannot ask for another group.
    let err = ctx
        .services
        .pull
        .pull(PullRequest {
            bot_id: "bot-restricted".into(),
            credential: CREDENTIAL.into(),
            max_jobs: Some(5),
            target_filter: Some("shop-a.test".into()),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation_error");
}

#[test_context(TestHarness)]
#[tokio::test]
async fn rate_limited_bot_is_refused_within_the_minute(ctx: &TestHarness) {
    ctx.register(BotIdentity::new("bot-a", CREDENTIAL, ctx.now()).with_rate_limit(2))
        .await;

    ctx.pull("bot-a", 1).await.unwrap();
    ctx.pull("bot-a", 1).await.unwrap();
    let err = ctx.pull("bot-a", 1).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::RateLimited { limit: 2 }));

    ctx.advance_secs(60);
    assert!(ctx.pull("bot-a", 1).await.is_ok());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn bad_credentials_and_disabled_bots_are_refused(ctx: &TestHarness) {
    ctx.register_bot("bot-a").await;
    ctx.register(BotIdentity::new("bot-off", CREDENTIAL, ctx.now()).disabled())
        .await;

    let wrong = ctx
        .services
        .pull
        .pull(PullRequest {
            bot_id: "bot-a".into(),
            credential: "nope".into(),
            max_jobs: Some(1),
            target_filter: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(wrong, CoordinatorError::Authentication));

    let disabled = ctx.pull("bot-off", 1).await.unwrap_err();
    assert!(matches!(disabled, CoordinatorError::Authentication));

    let unknown = ctx.pull("bot-ghost", 1).await.unwrap_err();
    assert!(matches!(unknown, CoordinatorError::Authentication));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn submit_validates_payload_before_touching_the_job(ctx: &TestHarness) {
    ctx.register_bot("bot-a").await;
    let job = ctx.enqueue_target("https://shop.test/a").await;
    ctx.pull("bot-a", 1).await.unwrap();

    let negative = ctx.success_request("bot-a", job.id, price(-1), "USD");
    let err = ctx.services.submit.submit(negative).await.unwrap_err();
    assert_eq!(err.code(), "validation_error");

    let bad_currency = ctx.success_request("bot-a", job.id, price(100), "dollars");
    let err = ctx.services.submit.submit(bad_currency).await.unwrap_err();
    assert_eq!(err.code(), "validation_error");

    assert_eq!(ctx.job(job.id).await.status, JobStatus::Locked);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn unknown_job_is_not_found(ctx: &TestHarness) {
    ctx.register_bot("bot-a").await;
    let missing = crawl_core::common::JobId::new();

    let err = ctx.submit_success("bot-a", missing, price(100)).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::NotFound(id) if id == missing));
}
