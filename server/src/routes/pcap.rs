//! `GET /api/pcap/sessions`, `POST /api/pcap/upload`, `POST /api/pcap/file`,
//! `GET /api/pcap/sessions/{id}/download` (spec.md §6, §4.6).

use crate::error::ApiError;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use caronte_core::error::Error;
use caronte_core::model::PcapSession;
use caronte_core::store::{Page, RowId};
use serde::Deserialize;
use std::sync::Arc;

pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<PcapSession>> {
    Json(state.sessions.list_sessions(Page::default()))
}

pub async fn upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<PcapSession>, ApiError> {
    let mut file_name = None;
    let mut file_bytes: Option<Bytes> = None;
    let mut flush_all = true;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::invalid(format!("malformed multipart body: {e}")))?
    {
        match field.name().unwrap_or("") {
            "file" => {
                file_name = field.file_name().map(|s| s.to_string());
                file_bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| Error::invalid(format!("reading uploaded file: {e}")))?,
                );
            }
            "flush_all" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| Error::invalid(format!("reading flush_all: {e}")))?;
                flush_all = text.parse().unwrap_or(true);
            }
            _ => {}
        }
    }

    let bytes = file_bytes.ok_or_else(|| Error::invalid("multipart body missing a `file` field"))?;
    let name = file_name.unwrap_or_else(|| "upload.pcap".to_string());
    let bytes = bytes.to_vec();

    let session_id = state.sessions.ingest_capture(name, bytes.clone(), flush_all)?;
    state.captures.write().expect("captures lock poisoned").insert(session_id.0, bytes);

    Ok(Json(state.sessions.get_session(session_id)?))
}

#[derive(Debug, Deserialize)]
pub struct FileRequest {
    pub file: String,
    #[serde(default = "default_true")]
    pub flush_all: bool,
    #[serde(default)]
    pub delete_original_file: bool,
}

fn default_true() -> bool {
    true
}

pub async fn process_file(
    State(state): State<Arc<AppState>>,
    Json(body): Json<FileRequest>,
) -> Result<Json<PcapSession>, ApiError> {
    let bytes = std::fs::read(&body.file)
        .map_err(|e| Error::invalid(format!("reading {:?}: {e}", body.file)))?;
    let name = std::path::Path::new(&body.file)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| body.file.clone());

    let session_id = state.sessions.ingest_capture(name, bytes.clone(), body.flush_all)?;
    state.captures.write().expect("captures lock poisoned").insert(session_id.0, bytes);

    if body.delete_original_file {
        let _ = std::fs::remove_file(&body.file);
    }

    Ok(Json(state.sessions.get_session(session_id)?))
}

pub async fn download_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Response, ApiError> {
    // Confirm the session exists even if its bytes were evicted, so a missing
    // session and a missing capture are distinguishable by status code.
    let session = state.sessions.get_session(RowId(id))?;
    let captures = state.captures.read().expect("captures lock poisoned");
    let bytes = captures
        .get(&id)
        .cloned()
        .ok_or_else(|| Error::not_found(format!("no stored capture bytes for session {id}")))?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/vnd.tcpdump.pcap".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", session.name),
            ),
        ],
        bytes,
    )
        .into_response())
}
