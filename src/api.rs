use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::watch;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::engine::StatusSnapshot;
use crate::events::{EngineEvent, EventTx};
use crate::overlay::{overlay_ws, OverlayPlayer};

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub events: EventTx,
    pub status: watch::Receiver<StatusSnapshot>,
    pub player: OverlayPlayer,
}

pub fn build_router(state: AppState, overlay_dir: &str) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/ping", get(ping))
        .route("/api/v1/status", get(status))
        .route("/api/v1/transport/skip", post(api_transport_skip))
        .route("/ws/overlay", get(overlay_ws))
        .nest_service("/overlay", ServeDir::new(overlay_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> &'static str {
    "requestline engine is running. Overlay at /overlay, status at /api/v1/status"
}

async fn ping(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "version": state.version,
        "features": ["status", "transport", "overlay"]
    }))
}

async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.status.borrow().clone())
}

async fn api_transport_skip(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    info!("operator skip");
    state
        .events
        .send(EngineEvent::Skip)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(json!({"ok": true})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::{Collaborators, Engine};
    use crate::events::EventRx;
    use crate::test_support::{FakeLookup, FakeVotes};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> (Router, EventRx) {
        let player = OverlayPlayer::new();
        let deps = Collaborators {
            lookup: Arc::new(FakeLookup::default()),
            votes: Arc::new(FakeVotes::default()),
            player: Arc::new(player.clone()),
        };
        let (engine, rx) = Engine::new(EngineConfig::default(), deps);
        let state = AppState {
            version: "test".into(),
            events: engine.sender(),
            status: engine.subscribe(),
            player,
        };
        (build_router(state, "overlay"), rx)
    }

    async fn body_json(res: axum::response::Response) -> serde_json::Value {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (app, _rx) = app();
        let res = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_serves_the_snapshot() {
        let (app, _rx) = app();
        let res = app
            .oneshot(Request::builder().uri("/api/v1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = body_json(res).await;
        assert_eq!(body["is_playing"], json!(false));
        assert_eq!(body["queue"], json!([]));
        assert_eq!(body["prediction"]["status"], json!("idle"));
    }

    #[tokio::test]
    async fn skip_posts_an_engine_event() {
        let (app, mut rx) = app();
        let res = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/transport/skip")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(matches!(rx.try_recv(), Ok(EngineEvent::Skip)));
    }
}
