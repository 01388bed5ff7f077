//! Route wiring for the caronte HTTP/JSON surface (spec.md §6).

mod connections;
mod pcap;
mod rules;
mod setup;
mod streams;

use crate::auth::require_auth;
use crate::state::AppState;
use axum::routing::{get, post, put};
use axum::{middleware, Router};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn build(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/rules", get(rules::list_rules).post(rules::create_rule))
        .route("/api/rules/:id", put(rules::update_rule))
        .route("/api/connections", get(connections::list_connections))
        .route("/api/streams/:connection_id", get(streams::get_stream))
        .route("/api/pcap/sessions", get(pcap::list_sessions))
        .route("/api/pcap/upload", post(pcap::upload))
        .route("/api/pcap/file", post(pcap::process_file))
        .route("/api/pcap/sessions/:id/download", get(pcap::download_session))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/setup", post(setup::setup))
        .merge(api)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive()))
        .with_state(state)
}
