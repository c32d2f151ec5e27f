use axum::{extract::rejection::JsonRejection, extract::Extension, Json};

use crate::common::CoordinatorError;
use crate::domains::crawl_jobs::actions::{PullRequest, PullResponse};
use crate::server::app::AxumAppState;
use crate::server::error::from_rejection;

/// `POST /pull`
pub async fn pull_handler(
    Extension(state): Extension<AxumAppState>,
    body: Result<Json<PullRequest>, JsonRejection>,
) -> Result<Json<PullResponse>, CoordinatorError> {
    let Json(request) = body.map_err(from_rejection)?;
    let response = state.services.pull.pull(request).await?;
    Ok(Json(response))
}
