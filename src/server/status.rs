//! Liveness endpoint.

use axum::extract::State;
use axum::http::Uri;
use axum::Json;
use chrono::Utc;

use super::AppState;

/// `GET /status` — confirms the service is up and dispatching.
pub async fn status_handler(
    State(app_state): State<AppState>,
    uri: Uri,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "url": uri.to_string(),
        "time": Utc::now().to_rfc3339(),
        "status": "ok",
        "armedListeners": app_state.core().listeners.armed_count(),
    }))
}

#[cfg(test)]
mod tests {
    use crate::engine::Core;
    use crate::server::{build_router, AppState};
    use crate::store::Store;
    use crate::test_utils::FakeGerrit;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    #[tokio::test]
    async fn status_reports_ok() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let core = Core::new(
            Store::open_in_memory().unwrap(),
            Arc::new(FakeGerrit::new()),
            "admin@example.com".into(),
            tx,
        );
        let router = build_router(AppState::new(core, vec![]));

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["url"], "/status");
        assert!(body["time"].is_string());
    }
}
