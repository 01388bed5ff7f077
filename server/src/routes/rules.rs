//! `GET /api/rules`, `POST /api/rules`, `PUT /api/rules/{id}` (spec.md §6, §4.1).

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::Json;
use caronte_core::rescan::{self, RescanJob};
use caronte_core::rules::{Rule, RulePatch};
use caronte_core::store::RowId;
use std::sync::Arc;

pub async fn list_rules(State(state): State<Arc<AppState>>) -> Json<Vec<Rule>> {
    Json(state.rules.list_rules())
}

/// Enqueues every connection still on an older database version for re-scan against
/// `version`, so an edited or freshly-added rule eventually applies to history too
/// (spec.md §8 invariant 8, §9's background re-scan design note).
fn enqueue_rescans(state: &AppState, version: u64) {
    for connection_id in rescan::stale_connections(&state.connections, version) {
        state.rescan.enqueue(RescanJob { connection_id, target_version: version });
    }
}

pub async fn create_rule(
    State(state): State<Arc<AppState>>,
    Json(rule): Json<Rule>,
) -> Result<Json<Rule>, ApiError> {
    let id = state.rules.add_rule(rule)?;
    enqueue_rescans(&state, state.rules.current_database().version());
    Ok(Json(state.rules.get_rule(id)?))
}

pub async fn update_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(patch): Json<RulePatch>,
) -> Result<Json<Rule>, ApiError> {
    state.rules.update_rule(RowId(id), patch)?;
    enqueue_rescans(&state, state.rules.current_database().version());
    Ok(Json(state.rules.get_rule(RowId(id))?))
}
