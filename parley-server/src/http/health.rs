use std::sync::Arc;

use axum::extract::State;

use super::envelope::{ok, ApiResult};
use super::HttpState;
use crate::subsystems::health::HealthReport;

/// Always 200; degradation is reported in `data.status`.
pub async fn health(State(state): State<Arc<HttpState>>) -> ApiResult<HealthReport> {
    ok(state.health.check().await)
}
