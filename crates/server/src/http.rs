//! HTTP Endpoints
//!
//! Health, readiness and metrics, plus the WebSocket voice endpoint.

use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::metrics::metrics_handler;
use crate::state::AppState;
use crate::websocket::ws_handler;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let server = &state.config.server;

    let mut router: Router<AppState> = Router::new()
        // Health check
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        // WebSocket
        .route(&server.ws_path, get(ws_handler))
        .layer(TraceLayer::new_for_http());

    if server.cors_enabled {
        router = router.layer(cors_layer(&server.cors_origins));
    }

    router.with_state(state)
}

/// Any origin unless specific origins are configured
fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    cors.allow_origin(origins)
}

/// Health check
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness check; not ready while every session slot is taken
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.sessions.count();
    let capacity = state.sessions.capacity();
    let (status, code) = if sessions < capacity {
        ("ready", StatusCode::OK)
    } else {
        ("at_capacity", StatusCode::SERVICE_UNAVAILABLE)
    };

    (
        code,
        Json(serde_json::json!({
            "status": status,
            "sessions": sessions,
            "capacity": capacity,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use voice_session_config::Settings;

    #[test]
    fn test_router_creation() {
        let state = AppState::new(Settings::default()).unwrap();
        let _ = create_router(state);
    }

    #[test]
    fn test_router_with_cors_origins() {
        let mut settings = Settings::default();
        settings.server.cors_enabled = true;
        settings.server.cors_origins = vec!["https://example.com".to_string()];
        let state = AppState::new(settings).unwrap();
        let _ = create_router(state);
    }

    #[tokio::test]
    async fn test_readiness_reports_capacity() {
        let mut settings = Settings::default();
        settings.server.max_sessions = 1;
        let state = AppState::new(settings).unwrap();

        let response = readiness_check(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let _entry = state.sessions.register().unwrap();
        let response = readiness_check(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
