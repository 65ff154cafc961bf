//! `POST /api/sandbox` - deploy code to a new or existing sandbox.

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::conversation::driver::DEPLOY_FAILED;
use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxRequest {
    #[serde(default)]
    pub sandbox_id: Option<String>,
    pub code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxResponse {
    pub sandbox_id: String,
    pub url: String,
}

pub async fn handle_sandbox(
    State(state): State<AppState>,
    Json(request): Json<SandboxRequest>,
) -> ApiResult<Json<SandboxResponse>> {
    let handle = state
        .preview
        .ensure_sandbox(request.sandbox_id.as_deref(), &request.code)
        .await
        .map_err(|e| {
            tracing::error!("Sandbox request failed: {e:#}");
            ApiError::Internal(DEPLOY_FAILED)
        })?;

    Ok(Json(SandboxResponse {
        sandbox_id: handle.sandbox_id,
        url: handle.url,
    }))
}
