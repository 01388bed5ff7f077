//! HTTP Basic auth gate for the `/api/*` surface, enabled by `Config::auth_required`
//! (spec.md §9's `accounts[username→password]`).

use crate::state::AppState;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;

pub async fn require_auth<B>(
    State(state): State<Arc<AppState>>,
    req: Request<B>,
    next: Next<B>,
) -> Result<Response, StatusCode> {
    let (auth_required, accounts) = {
        let config = state.config.read().expect("config lock poisoned");
        (config.auth_required, config.accounts.clone())
    };
    if !auth_required {
        return Ok(next.run(req).await);
    }

    let credentials = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .and_then(|encoded| base64::decode(encoded).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .and_then(|text| text.split_once(':').map(|(u, p)| (u.to_string(), p.to_string())));

    match credentials {
        Some((user, pass)) if accounts.get(&user).map(|p| p.as_str()) == Some(pass.as_str()) => {
            Ok(next.run(req).await)
        }
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}
