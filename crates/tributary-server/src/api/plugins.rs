//! Plugin inspection and job trigger endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tributary_plugin::{JobRequest, PluginError, PluginSummary};
use uuid::Uuid;

use super::{error_response, ApiError, AppState};

// ─── Request / Response types ───────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct PluginListResponse {
    pub plugins: Vec<PluginSummary>,
}

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    pub limit: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobRequest>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerJobRequest {
    pub payload: Option<Value>,
    /// Delay as `{amount, unit}`, e.g. `{"amount": 5, "unit": "minutes"}`.
    pub run_in: Option<RunIn>,
}

#[derive(Debug, Deserialize)]
pub struct RunIn {
    pub amount: i64,
    pub unit: String,
}

fn plugin_not_found(id: Uuid) -> ApiError {
    error_response(PluginError::NotFound(id.to_string()))
}

// ─── Handlers ───────────────────────────────────────────────────────────

/// GET /api/plugins
pub async fn list_plugins(State(state): State<Arc<AppState>>) -> Json<PluginListResponse> {
    Json(PluginListResponse {
        plugins: state.plugins.registry().summaries().await,
    })
}

/// DELETE /api/plugins/{id}
pub async fn disable_plugin(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.plugins.disable(id).await.map_err(error_response)?;
    tracing::info!(plugin_id = %id, "plugin disabled via API");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/plugins/{id}/jobs?limit=N: newest first.
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<JobListResponse>, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let jobs = state
        .plugins
        .jobs()
        .store()
        .list_for_plugin(id, limit)
        .await
        .map_err(error_response)?;
    Ok(Json(JobListResponse { jobs }))
}

/// POST /api/plugins/{id}/jobs/{name}: enqueue a job by hand. The body
/// is optional.
pub async fn trigger_job(
    State(state): State<Arc<AppState>>,
    Path((id, name)): Path<(Uuid, String)>,
    body: Option<Json<TriggerJobRequest>>,
) -> Result<StatusCode, ApiError> {
    let plugin = state
        .plugins
        .registry()
        .get(id)
        .await
        .ok_or_else(|| plugin_not_found(id))?;
    let request = body.map(|Json(b)| b).unwrap_or_default();

    let mut call = plugin.context.jobs().job(name.as_str());
    if let Some(payload) = request.payload {
        call = call.payload(payload);
    }
    let queued = match request.run_in {
        Some(RunIn { amount, unit }) => call.run_in(amount, &unit).await,
        None => call.run_now().await,
    };
    queued.map_err(error_response)?;

    tracing::info!(plugin = %plugin.name, job = %name, "job triggered via API");
    Ok(StatusCode::ACCEPTED)
}
