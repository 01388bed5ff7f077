//! `POST /setup`: bootstraps the single operator config (spec.md §6, §9).

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use caronte_core::error::Error;
use caronte_core::model::Settings;
use caronte_core::store::memory::MemoryStore;
use caronte_core::store::{Page, RowId, Store};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct SetupRequest {
    pub server_address: String,
    pub flag_regex: Option<String>,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub accounts: BTreeMap<String, String>,
}

#[derive(Serialize)]
pub struct SetupResponse {
    pub server_address: String,
    pub auth_required: bool,
}

/// Validates `server_address` as a real IP address rather than the stub
/// always-true validator spec.md §9's open question flags as a bug to fix.
fn validate_server_address(address: &str) -> Result<(), Error> {
    IpAddr::from_str(address)
        .map(|_| ())
        .map_err(|_| Error::invalid(format!("server_address {address:?} is not a valid IP address")))
}

pub async fn setup(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SetupRequest>,
) -> Result<Json<SetupResponse>, ApiError> {
    validate_server_address(&body.server_address)?;
    if let Some(pattern) = &body.flag_regex {
        if pattern.len() < 8 {
            return Err(Error::invalid("flag_regex must be at least 8 characters").into());
        }
        regex::bytes::Regex::new(pattern)
            .map_err(|e| Error::invalid(format!("invalid flag_regex: {e}")))?;
    }
    if body.auth_required && body.accounts.is_empty() {
        return Err(Error::invalid("auth_required is set but accounts is empty").into());
    }

    let settings = Settings {
        id: RowId::ZERO,
        server_address: body.server_address.clone(),
        flag_regex: body.flag_regex.clone(),
        auth_required: body.auth_required,
        accounts: body.accounts.clone(),
    };
    write_settings(&state.settings, settings)?;

    let mut config = state.config.write().expect("config lock poisoned");
    config.server_address = body.server_address.clone();
    config.flag_regex = body.flag_regex.clone();
    config.auth_required = body.auth_required;
    config.accounts = body.accounts.clone();

    Ok(Json(SetupResponse {
        server_address: body.server_address,
        auth_required: body.auth_required,
    }))
}

/// Writes `settings` as the first row of the `settings` collection, replacing
/// whatever row was there before rather than accumulating one row per call.
fn write_settings(store: &MemoryStore<Settings>, settings: Settings) -> Result<(), Error> {
    match store.find(Page::default(), |_| true).into_iter().next() {
        Some(existing) => store.update(existing.id, settings),
        None => store.insert(settings).map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ipv4_and_ipv6() {
        assert!(validate_server_address("10.0.0.1").is_ok());
        assert!(validate_server_address("::1").is_ok());
    }

    #[test]
    fn rejects_hostnames_and_garbage() {
        assert!(validate_server_address("not-an-ip").is_err());
        assert!(validate_server_address("localhost").is_err());
        assert!(validate_server_address("").is_err());
    }

    #[test]
    fn write_settings_keeps_a_single_row_across_repeated_setup_calls() {
        let store: MemoryStore<Settings> = MemoryStore::new();
        let first = Settings {
            id: RowId::ZERO,
            server_address: "10.0.0.1".to_string(),
            flag_regex: None,
            auth_required: false,
            accounts: BTreeMap::new(),
        };
        write_settings(&store, first).unwrap();

        let second = Settings {
            id: RowId::ZERO,
            server_address: "10.0.0.2".to_string(),
            flag_regex: None,
            auth_required: false,
            accounts: BTreeMap::new(),
        };
        write_settings(&store, second).unwrap();

        let rows = store.find(Page::default(), |_| true);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].server_address, "10.0.0.2");
    }
}
