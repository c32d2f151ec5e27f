//! Application setup and server configuration.

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::{header::CONTENT_TYPE, HeaderName, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::domains::auto_record::{AutoRecordPipeline, AutoRecordWorker};
use crate::domains::crawl_jobs::actions::{PullService, SubmitService};
use crate::domains::reset::{DeferredResetScheduler, ResetLoop};
use crate::kernel::{ServerDeps, ServiceHost};
use crate::server::routes::{bot_stats_handler, health_handler, pull_handler, submit_handler};

/// The coordinator's services, built once over shared dependencies.
pub struct AppServices {
    pub pull: Arc<PullService>,
    pub submit: Arc<SubmitService>,
    pub scheduler: Arc<DeferredResetScheduler>,
    pub auto_record: Arc<AutoRecordPipeline>,
}

impl AppServices {
    pub fn new(deps: Arc<ServerDeps>) -> Self {
        let scheduler = Arc::new(DeferredResetScheduler::new(deps.clone()));
        let auto_record = Arc::new(AutoRecordPipeline::new(deps.clone()));

        Self {
            pull: Arc::new(PullService::new(deps.clone(), scheduler.clone())),
            submit: Arc::new(SubmitService::new(
                deps,
                scheduler.clone(),
                auto_record.clone(),
            )),
            scheduler,
            auto_record,
        }
    }

    /// Register the reset loop and the auto-record worker on `host`.
    pub fn background(&self, deps: Arc<ServerDeps>, host: ServiceHost) -> ServiceHost {
        host.with_service(ResetLoop::new(self.scheduler.clone(), deps.clone()))
            .with_service(AutoRecordWorker::new(self.auto_record.clone(), deps))
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AxumAppState {
    pub deps: Arc<ServerDeps>,
    pub services: Arc<AppServices>,
}

/// Build the Axum application router.
///
/// Returns the services too so the caller can start the background loops
/// over the same scheduler and pipeline the routes use.
pub fn build_app(deps: Arc<ServerDeps>) -> (Router, Arc<AppServices>) {
    let services = Arc::new(AppServices::new(deps.clone()));
    let app_state = AxumAppState {
        deps,
        services: services.clone(),
    };

    // Bots are server-side processes; CORS only matters for dashboards.
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE, HeaderName::from_static("x-bot-credential")]);

    let app = Router::new()
        // Bot protocol
        .route("/pull", post(pull_handler))
        .route("/submit", post(submit_handler))
        .route("/bots/:bot_id/stats", get(bot_stats_handler))
        .route("/health", get(health_handler))
        .layer(Extension(app_state))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    (app, services)
}
