use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::RelayConfig;
use crate::relay::{attendance, websocket, RelayState};

pub fn build_router(state: RelayState) -> Router {
    Router::new()
        // Attendance
        .route(
            "/api/v1/meetings/:meeting_id/attendance",
            get(attendance::list_attendance).post(attendance::join),
        )
        .route(
            "/api/v1/meetings/:meeting_id/attendance/:user_id",
            axum::routing::put(attendance::update_status).delete(attendance::leave),
        )
        // Signaling
        .route("/ws", get(websocket::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the relay on an already bound listener until the process exits.
pub async fn serve(listener: TcpListener, state: RelayState) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Relay listening on http://{}", addr);
    }
    axum::serve(listener, build_router(state)).await
}

pub async fn start_relay(config: RelayConfig, state: RelayState) -> std::io::Result<()> {
    let listener = TcpListener::bind(config.bind).await?;
    serve(listener, state.with_departure_grace(config.departure_grace)).await
}
