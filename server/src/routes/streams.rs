//! `GET /api/streams/{connection_id}?format=&skip=&limit=` (spec.md §6, §4.7).

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::Json;
use caronte_core::reader::{Payload, Query as ReaderQuery, StreamReader};
use caronte_core::store::RowId;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub format: Option<String>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

pub async fn get_stream(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<u64>,
    Query(query): Query<StreamQuery>,
) -> Result<Json<Vec<Payload>>, ApiError> {
    let default = ReaderQuery::default();
    let reader_query = ReaderQuery {
        format: query.format.unwrap_or(default.format),
        skip: query.skip.unwrap_or(default.skip),
        limit: query.limit.unwrap_or(default.limit),
    };
    let reader = StreamReader::new(&state.connections, &state.streams);
    let payloads = reader.get_connection_payload(RowId(connection_id), reader_query, &state.shutdown)?;
    Ok(Json(payloads))
}
