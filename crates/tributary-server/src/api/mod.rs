pub mod events;
pub mod plugins;

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tributary_plugin::{PluginError, PluginServer};

/// Shared state handed to every handler.
pub struct AppState {
    pub plugins: Arc<PluginServer>,
}

pub type ApiError = (StatusCode, Json<serde_json::Value>);

/// Map a runtime error to a status code and `{ "error": ... }` body.
pub fn error_response(err: PluginError) -> ApiError {
    let status = match &err {
        PluginError::NotFound(_) | PluginError::UnknownJob { .. } => StatusCode::NOT_FOUND,
        PluginError::InvalidTimeUnit(_)
        | PluginError::InvalidConfig(_)
        | PluginError::InvalidDescriptor(_)
        | PluginError::Serialization(_) => StatusCode::BAD_REQUEST,
        PluginError::AlreadyLoaded(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "request failed");
    }
    (status, Json(json!({ "error": err.to_string() })))
}

#[derive(Serialize)]
struct ApiStatus {
    status: &'static str,
    version: &'static str,
    plugins: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<ApiStatus> {
    Json(ApiStatus {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        plugins: state.plugins.registry().loaded_count().await,
    })
}

/// Routes mounted under `/api`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", post(events::ingest))
        .route("/plugins", get(plugins::list_plugins))
        .route("/plugins/{id}", delete(plugins::disable_plugin))
        .route("/plugins/{id}/jobs", get(plugins::list_jobs))
        .route("/plugins/{id}/jobs/{name}", post(plugins::trigger_job))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::state;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health() {
        let resp = router(state())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["plugins"], 0);
    }

    #[test]
    fn test_error_status_mapping() {
        let (status, Json(body)) = error_response(PluginError::UnknownJob {
            plugin: "p".into(),
            job: "j".into(),
        });
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("unknown job"));

        let (status, _) = error_response(PluginError::InvalidTimeUnit("fortnight".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = error_response(PluginError::JobStore("down".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
