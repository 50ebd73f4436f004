pub mod health;

use axum::Router;

use crate::state::AppState;
use crate::ws::ws_routes;

/// Create the broker router: signaling socket plus health
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::health_routes())
        .merge(ws_routes())
        .with_state(state)
}
