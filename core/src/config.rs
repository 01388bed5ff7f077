//! Immutable runtime configuration, loaded once from a TOML file at startup
//! (spec.md §9).

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

fn default_server_address() -> String {
    "0.0.0.0:3333".to_string()
}
fn default_block_gap_ms() -> i64 {
    5000
}
fn default_idle_flow_s() -> i64 {
    120
}
fn default_max_chunk_bytes() -> usize {
    2 * 1024 * 1024
}
fn default_query_limit() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_server_address")]
    pub server_address: String,
    /// Pattern every session's client-side flag-submission responses are checked
    /// against, for the analyst-facing "flags seen" summary (spec.md §9's
    /// `flag_regex`).
    pub flag_regex: Option<String>,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub accounts: BTreeMap<String, String>,
    #[serde(default = "default_block_gap_ms")]
    pub block_gap_ms: i64,
    #[serde(default = "default_idle_flow_s")]
    pub idle_flow_s: i64,
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,
    #[serde(default = "default_query_limit")]
    pub default_query_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_address: default_server_address(),
            flag_regex: None,
            auth_required: false,
            accounts: BTreeMap::new(),
            block_gap_ms: default_block_gap_ms(),
            idle_flow_s: default_idle_flow_s(),
            max_chunk_bytes: default_max_chunk_bytes(),
            default_query_limit: default_query_limit(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::invalid(format!("reading config {}: {e}", path.display())))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Config> {
        let config: Config =
            toml::from_str(raw).map_err(|e| Error::invalid(format!("parsing config: {e}")))?;
        if config.auth_required && config.accounts.is_empty() {
            return Err(Error::invalid("auth_required is set but accounts is empty"));
        }
        if let Some(pattern) = &config.flag_regex {
            regex::bytes::Regex::new(pattern)
                .map_err(|e| Error::invalid(format!("invalid flag_regex: {e}")))?;
        }
        Ok(config)
    }

    pub fn block_gap(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.block_gap_ms)
    }

    pub fn idle_flow(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_flow_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_fields_are_omitted() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server_address, "0.0.0.0:3333");
        assert_eq!(config.max_chunk_bytes, 2 * 1024 * 1024);
    }

    #[test]
    fn auth_required_without_accounts_is_rejected() {
        let err = Config::parse("auth_required = true\n").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn invalid_flag_regex_is_rejected() {
        let err = Config::parse("flag_regex = \"(unterminated\"\n").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
