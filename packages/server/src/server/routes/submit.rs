use axum::{extract::rejection::JsonRejection, extract::Extension, Json};

use crate::common::CoordinatorError;
use crate::domains::crawl_jobs::actions::{SubmitRequest, SubmitResponse};
use crate::server::app::AxumAppState;
use crate::server::error::from_rejection;

/// `POST /submit`
pub async fn submit_handler(
    Extension(state): Extension<AxumAppState>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Json<SubmitResponse>, CoordinatorError> {
    let Json(request) = body.map_err(from_rejection)?;
    let response = state.services.submit.submit(request).await?;
    Ok(Json(response))
}
