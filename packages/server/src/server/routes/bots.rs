use axum::{
    extract::{Extension, Path},
    http::HeaderMap,
    Json,
};

use crate::common::CoordinatorError;
use crate::domains::bots::{authenticate, BotStats};
use crate::server::app::AxumAppState;

pub const CREDENTIAL_HEADER: &str = "x-bot-credential";

/// `GET /bots/:bot_id/stats`, authenticated with the `x-bot-credential` header.
///
/// Served from the `bot-stats` cache entry when present; pulls and submits
/// invalidate it.
pub async fn bot_stats_handler(
    Extension(state): Extension<AxumAppState>,
    Path(bot_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<BotStats>, CoordinatorError> {
    let credential = headers
        .get(CREDENTIAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(CoordinatorError::Authentication)?;

    let deps = &state.deps;
    let bot = authenticate(deps.bot_registry.as_ref(), &bot_id, credential).await?;

    let key = deps.cache.keys().bot_stats(&bot.bot_id);
    if let Some(stats) = deps.cache.get_json::<BotStats>(&key).await {
        return Ok(Json(stats));
    }

    let stats = bot.stats();
    let ttl = deps.cache.config().bot_stats_ttl;
    deps.cache.set_json(&key, &stats, ttl).await;
    Ok(Json(stats))
}
