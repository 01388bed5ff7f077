//! `GET /api/connections?…` (spec.md §6): filtered, paginated connection listing.

use crate::state::AppState;
use axum::extract::{Query, State};
use axum::Json;
use caronte_core::model::Connection;
use caronte_core::store::{Page, RowId, Store};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct ConnectionQuery {
    pub service_port: Option<u16>,
    #[serde(default)]
    pub matched_rules: Vec<u64>,
    pub client_address: Option<IpAddr>,
    pub client_port: Option<u16>,
    pub min_duration: Option<i64>,
    pub max_duration: Option<i64>,
    pub min_bytes: Option<u64>,
    pub max_bytes: Option<u64>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub closed_after: Option<DateTime<Utc>>,
    pub closed_before: Option<DateTime<Utc>>,
    pub marked: Option<bool>,
    pub hidden: Option<bool>,
    pub from: Option<u64>,
    pub to: Option<u64>,
    pub limit: Option<usize>,
}

fn matches(c: &Connection, q: &ConnectionQuery) -> bool {
    if let Some(port) = q.service_port {
        if c.service_port != port {
            return false;
        }
    }
    if !q.matched_rules.is_empty() {
        let wanted: Vec<RowId> = q.matched_rules.iter().map(|id| RowId(*id)).collect();
        if !wanted.iter().any(|id| c.matched_rule_ids.contains(id)) {
            return false;
        }
    }
    if let Some(addr) = q.client_address {
        if c.ip_src != addr {
            return false;
        }
    }
    if let Some(port) = q.client_port {
        if c.port_src != port {
            return false;
        }
    }
    let duration = (c.closed_at - c.started_at).num_milliseconds();
    if let Some(min) = q.min_duration {
        if duration < min {
            return false;
        }
    }
    if let Some(max) = q.max_duration {
        if duration > max {
            return false;
        }
    }
    let total_bytes = c.client_bytes + c.server_bytes;
    if let Some(min) = q.min_bytes {
        if total_bytes < min {
            return false;
        }
    }
    if let Some(max) = q.max_bytes {
        if total_bytes > max {
            return false;
        }
    }
    if let Some(after) = q.started_after {
        if c.started_at < after {
            return false;
        }
    }
    if let Some(before) = q.started_before {
        if c.started_at > before {
            return false;
        }
    }
    if let Some(after) = q.closed_after {
        if c.closed_at < after {
            return false;
        }
    }
    if let Some(before) = q.closed_before {
        if c.closed_at > before {
            return false;
        }
    }
    if let Some(marked) = q.marked {
        if c.marked != marked {
            return false;
        }
    }
    if let Some(hidden) = q.hidden {
        if c.hidden != hidden {
            return false;
        }
    }
    true
}

pub async fn list_connections(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConnectionQuery>,
) -> Json<Vec<Connection>> {
    let default_limit = state.config.read().expect("config lock poisoned").default_query_limit;
    let page = Page {
        from: query.from.map(RowId),
        to: query.to.map(RowId),
        limit: Some(query.limit.unwrap_or(default_limit)),
    };
    let results = state.connections.find(page, |c| matches(c, &query));
    Json(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use caronte_core::model::StoredTerminationReason;
    use std::net::Ipv4Addr;

    fn empty_query() -> ConnectionQuery {
        ConnectionQuery {
            service_port: None,
            matched_rules: vec![],
            client_address: None,
            client_port: None,
            min_duration: None,
            max_duration: None,
            min_bytes: None,
            max_bytes: None,
            started_after: None,
            started_before: None,
            closed_after: None,
            closed_before: None,
            marked: None,
            hidden: None,
            from: None,
            to: None,
            limit: None,
        }
    }

    fn sample() -> Connection {
        Connection {
            id: RowId(1),
            session_id: RowId(1),
            ip_src: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            port_src: 1234,
            ip_dst: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            port_dst: 80,
            service_port: 80,
            started_at: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
            closed_at: DateTime::<Utc>::from_timestamp(10, 0).unwrap(),
            termination_reason: StoredTerminationReason::Graceful,
            client_bytes: 10,
            server_bytes: 20,
            client_stream_ids: vec![],
            server_stream_ids: vec![],
            matched_rule_ids: vec![RowId(5)],
            rule_database_version: 1,
            marked: false,
            hidden: false,
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(matches(&sample(), &empty_query()));
    }

    #[test]
    fn service_port_filter_excludes_mismatches() {
        let mut q = empty_query();
        q.service_port = Some(443);
        assert!(!matches(&sample(), &q));
    }

    #[test]
    fn matched_rules_filter_requires_overlap() {
        let mut q = empty_query();
        q.matched_rules = vec![99];
        assert!(!matches(&sample(), &q));
        q.matched_rules = vec![5];
        assert!(matches(&sample(), &q));
    }

    #[test]
    fn hidden_filter_excludes_visible_connections() {
        let mut q = empty_query();
        q.hidden = Some(true);
        assert!(!matches(&sample(), &q));
    }

    #[test]
    fn duration_bounds_are_inclusive() {
        let mut q = empty_query();
        q.min_duration = Some(10_000);
        q.max_duration = Some(10_000);
        assert!(matches(&sample(), &q));
        q.min_duration = Some(10_001);
        assert!(!matches(&sample(), &q));
    }
}
