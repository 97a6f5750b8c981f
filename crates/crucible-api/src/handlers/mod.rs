//! HTTP API handlers — the core's ingress surface.

pub mod jobs;
pub mod status;
pub mod ws;

use axum::Json;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::sync::broadcast;

use crucible_core::JobError;
use crucible_core::user::UserRef;
use crucible_services::{Bus, Directory, JobStore, QueueAdapter, QuotaGate, SocketHub};

#[derive(Clone)]
pub struct ApiState {
    pub store: JobStore,
    pub directory: Directory,
    pub queue: QueueAdapter,
    pub bus: Bus,
    pub hub: SocketHub,
    pub quota: QuotaGate,
    /// Shutdown broadcast sender — signals graceful daemon shutdown.
    pub shutdown_tx: broadcast::Sender<()>,
}

// ── Error mapping ─────────────────────────────────────────────────────────────

/// Wraps the core taxonomy into HTTP responses. Quota rejections carry
/// their counters so clients can show "5/5 used".
pub struct ApiError(pub JobError);

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            JobError::BadInput(_) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "success": false, "error": self.0.to_string() }),
            ),
            JobError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                serde_json::json!({ "success": false, "error": "Unauthorized" }),
            ),
            JobError::Forbidden(_) => (
                StatusCode::FORBIDDEN,
                serde_json::json!({ "success": false, "error": self.0.to_string() }),
            ),
            JobError::QuotaExceeded { current, limit } => (
                StatusCode::FORBIDDEN,
                serde_json::json!({
                    "success": false,
                    "error": "QuotaExceeded",
                    "current": current,
                    "limit": limit,
                }),
            ),
            JobError::NotFound(_) => (
                StatusCode::NOT_FOUND,
                serde_json::json!({ "success": false, "error": self.0.to_string() }),
            ),
            JobError::Transient(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "success": false, "error": self.0.to_string() }),
            ),
            other => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "success": false, "error": other.to_string() }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

// ── Shared helpers ────────────────────────────────────────────────────────────

/// Resolve the bearer token to a user, or 401.
pub(crate) async fn authenticate(
    state: &ApiState,
    headers: &HeaderMap,
) -> Result<UserRef, ApiError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError(JobError::Unauthorized))?;
    state
        .directory
        .resolve_token(token)
        .await?
        .ok_or(ApiError(JobError::Unauthorized))
}

// Re-export handler functions for use in router setup.
pub use jobs::{handle_compile, handle_deploy, handle_get_job, handle_list_jobs};
pub use status::handle_status;
pub use ws::handle_ws;

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(e: JobError) -> StatusCode {
        ApiError(e).into_response().status()
    }

    #[test]
    fn taxonomy_maps_to_http_codes() {
        assert_eq!(status_of(JobError::BadInput("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(JobError::Unauthorized), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_of(JobError::Forbidden("not yours".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_of(JobError::QuotaExceeded { current: 5, limit: 5 }),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_of(JobError::NotFound("job x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(JobError::Transient("broker down".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(JobError::ToolchainMissing("cargo".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
