// HTTP surface of the node: currently just the peer websocket endpoint.

use crate::cluster::Core;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod ws;

pub fn router(core: Arc<Core>) -> Router {
    Router::new()
        .route("/api/nodes/ws", get(ws::node_ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(core)
}
