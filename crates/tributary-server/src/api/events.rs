//! Event ingestion endpoint.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use tributary_plugin::{PipelineOutcome, PluginEvent};

use super::AppState;

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestResponse {
    Ingested { event: PluginEvent },
    Dropped { plugin: String },
}

/// POST /api/events: run one event through the plugin chain.
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Json(event): Json<PluginEvent>,
) -> (StatusCode, Json<IngestResponse>) {
    match state.plugins.process_event(event).await {
        PipelineOutcome::Ingested(event) => (StatusCode::OK, Json(IngestResponse::Ingested { event })),
        PipelineOutcome::Dropped { plugin } => {
            tracing::debug!(%plugin, "event dropped by plugin");
            (StatusCode::OK, Json(IngestResponse::Dropped { plugin }))
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::api::router;
    use crate::test_support::{install, state};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use tributary_plugin::{PluginContext, PluginEvent, PluginModule};

    fn post_event(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/events")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: axum::response::Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_ingest_without_plugins_passes_through() {
        let app = router(state());
        let resp = app
            .oneshot(post_event(json!({"event": "signup", "distinct_id": "u1"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "ingested");
        assert_eq!(body["event"]["event"], "signup");
    }

    #[tokio::test]
    async fn test_ingest_applies_process_event() {
        let state = state();
        let module = PluginModule::new().process_event(
            |event: PluginEvent, _ctx: PluginContext| async move {
                Ok(Some(event.with_property("hello", "world!")))
            },
        );
        install(&state, "greeter", module).await;

        let resp = router(state)
            .oneshot(post_event(json!({"event": "signup", "distinct_id": "u1"})))
            .await
            .unwrap();
        let body = json_body(resp).await;
        assert_eq!(body["event"]["properties"]["hello"], "world!");
    }

    #[tokio::test]
    async fn test_ingest_reports_drop() {
        let state = state();
        let module = PluginModule::new()
            .process_event(|_event: PluginEvent, _ctx: PluginContext| async move { Ok(None) });
        install(&state, "filter", module).await;

        let resp = router(state)
            .oneshot(post_event(json!({"event": "bot", "distinct_id": "u1"})))
            .await
            .unwrap();
        let body = json_body(resp).await;
        assert_eq!(body["status"], "dropped");
        assert_eq!(body["plugin"], "filter");
    }

    #[tokio::test]
    async fn test_ingest_rejects_malformed_event() {
        let resp = router(state())
            .oneshot(post_event(json!({"properties": {}})))
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
    }
}
