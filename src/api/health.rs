use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::error::Result;
use crate::state::AppState;

/// Health response structure
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub sessions: usize,
    pub rooms: usize,
    pub session_expiry_seconds: u64,
    pub timestamp: String,
}

/// Health routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// GET /health - Health check endpoint
async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>> {
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        sessions: state.broker.session_count(),
        rooms: state.broker.room_count().await,
        session_expiry_seconds: state.config.session_expiry_seconds,
        timestamp: Utc::now().to_rfc3339(),
    }))
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn test_health_reports_counts() {
        let state = AppState::new(Config {
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            session_secret: Some("health-key".to_string()),
            session_expiry_seconds: 60,
        })
        .expect("Should build state");

        let response = health_routes()
            .with_state(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["sessions"], 0);
        assert_eq!(json["rooms"], 0);
        assert_eq!(json["session_expiry_seconds"], 60);
    }
}
