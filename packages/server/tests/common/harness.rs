//! Test harness over in-memory stores and a manual clock.
//!
//! Every test gets a fresh set of stores, a fresh in-process backend and a
//! clock that only moves when the test advances it, so lease expiry and reset
//! scheduling are deterministic.

use std::sync::Arc;

use axum::Router;
use chrono::Duration;
use crawl_core::common::{CoordinatorError, JobId};
use crawl_core::domains::bots::{BotIdentity, BotRegistry};
use crawl_core::domains::crawl_jobs::actions::{
    enqueue_job, PullRequest, PullResponse, SubmitRequest, SubmitResponse,
};
use crawl_core::domains::crawl_jobs::models::{CrawlJob, NewCrawlJob};
use crawl_core::domains::crawl_jobs::store::JobStore;
use crawl_core::kernel::{BaseClock, ManualClock, ServerDeps, TestDependencies};
use crawl_core::server::{build_app, AppServices};
use rust_decimal::Decimal;
use test_context::AsyncTestContext;

/// Test harness wiring the full coordinator over [`TestDependencies`].
///
/// # Example using test-context
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &TestHarness) {
///     let bot = ctx.register_bot("bot-a").await;
///     // ... test code
/// }
/// ```
pub struct TestHarness {
    /// Handles to the in-memory stores the services write to.
    pub deps: TestDependencies,
    pub server_deps: Arc<ServerDeps>,
    pub services: Arc<AppServices>,
    pub router: Router,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new()
    }

    async fn teardown(self) {}
}

pub const CREDENTIAL: &str = "s3cret";

impl TestHarness {
    pub fn new() -> Self {
        Self::with_deps(TestDependencies::new())
    }

    pub fn with_deps(deps: TestDependencies) -> Self {
        // Run tests with: RUST_LOG=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let server_deps = Arc::new(deps.server_deps());
        let (router, services) = build_app(server_deps.clone());
        Self {
            deps,
            server_deps,
            services,
            router,
        }
    }

    pub fn clock(&self) -> &ManualClock {
        &self.deps.clock
    }

    pub fn advance_secs(&self, seconds: i64) {
        self.deps.clock.advance(Duration::seconds(seconds));
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.deps.clock.now()
    }

    pub async fn register(&self, bot: BotIdentity) -> BotIdentity {
        self.deps
            .bot_registry
            .save_bot(&bot)
            .await
            .expect("Failed to register bot");
        bot
    }

    /// Enabled bot with the shared test credential.
    pub async fn register_bot(&self, bot_id: &str) -> BotIdentity {
        self.register(BotIdentity::new(bot_id, CREDENTIAL, self.now()))
            .await
    }

    pub async fn bot(&self, bot_id: &str) -> BotIdentity {
        self.deps
            .bot_registry
            .find_bot(bot_id)
            .await
            .expect("Failed to load bot")
            .expect("bot not registered")
    }

    pub async fn enqueue(&self, input: NewCrawlJob) -> CrawlJob {
        enqueue_job(input, &self.server_deps)
            .await
            .expect("Failed to enqueue job")
    }

    /// Enqueue a job for `target`, one clock second after the previous one.
    pub async fn enqueue_target(&self, target: &str) -> CrawlJob {
        let job = self
            .enqueue(NewCrawlJob::builder().target_ref(target).build())
            .await;
        self.advance_secs(1);
        job
    }

    pub async fn job(&self, id: JobId) -> CrawlJob {
        self.deps
            .job_store
            .find_job(id)
            .await
            .expect("Failed to load job")
            .expect("job not found")
    }

    pub async fn pull(&self, bot_id: &str, max_jobs: i64) -> Result<PullResponse, CoordinatorError> {
        self.services
            .pull
            .pull(PullRequest {
                bot_id: bot_id.to_string(),
                credential: CREDENTIAL.to_string(),
                max_jobs: Some(max_jobs),
                target_filter: None,
            })
            .await
    }

    pub fn success_request(&self, bot_id: &str, job_id: JobId, price: Decimal, currency: &str) -> SubmitRequest {
        SubmitRequest {
            bot_id: bot_id.to_string(),
            credential: CREDENTIAL.to_string(),
            job_id: job_id.to_string(),
            success: true,
            price: Some(price),
            currency: Some(currency.to_string()),
            title: Some("Widget".to_string()),
            in_stock: Some(true),
            ..Default::default()
        }
    }

    pub async fn submit_success(
        &self,
        bot_id: &str,
        job_id: JobId,
        price: Decimal,
    ) -> Result<SubmitResponse, CoordinatorError> {
        self.services
            .submit
            .submit(self.success_request(bot_id, job_id, price, "USD"))
            .await
    }

    /// Pull everything available to `bot_id` and submit a success for each.
    pub async fn complete_available(&self, bot_id: &str) -> Vec<JobId> {
        let pulled = self
            .pull(bot_id, i64::MAX)
            .await
            .expect("Failed to pull");
        let mut done = Vec::new();
        for leased in pulled.jobs {
            self.submit_success(bot_id, leased.job_id, Decimal::new(1000, 2))
                .await
                .expect("Failed to submit");
            done.push(leased.job_id);
        }
        done
    }

    pub async fn submit_failure(
        &self,
        bot_id: &str,
        job_id: JobId,
        message: &str,
    ) -> Result<SubmitResponse, CoordinatorError> {
        self.services
            .submit
            .submit(SubmitRequest {
                bot_id: bot_id.to_string(),
                credential: CREDENTIAL.to_string(),
                job_id: job_id.to_string(),
                success: false,
                error_message: Some(message.to_string()),
                ..Default::default()
            })
            .await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
