//! The application-protocol parser family (spec.md §4.7, §9): sniffs a metadata
//! chunk's bytes and, if recognized, returns a typed `Metadata` variant. Unknown
//! content yields no metadata at all, so the Reader skips attaching one.
//!
//! Modeled as a tagged enum discriminated on a `type` field at serialization time --
//! the same shape spec.md §9 calls for dynamic/untagged metadata to take.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Metadata {
    HttpRequest { method: String, url: String, version: String },
    HttpResponse { status: String, body: String },
}

/// Sniffs `bytes` (the concatenated content of one metadata chunk, per spec.md §4.7)
/// and parses it with whichever family member claims it. Returns `None` for content no
/// parser recognizes.
pub fn parse(bytes: &[u8]) -> Option<Metadata> {
    parse_http_request(bytes).or_else(|| parse_http_response(bytes))
}

fn parse_http_request(bytes: &[u8]) -> Option<Metadata> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(bytes) {
        Ok(httparse::Status::Complete(_)) | Ok(httparse::Status::Partial) => {
            let method = req.method?.to_string();
            let url = req.path?.to_string();
            let version = match req.version {
                Some(1) => "HTTP/1.1".to_string(),
                Some(0) => "HTTP/1.0".to_string(),
                _ => "HTTP/1.1".to_string(),
            };
            Some(Metadata::HttpRequest { method, url, version })
        }
        Err(_) => None,
    }
}

fn parse_http_response(bytes: &[u8]) -> Option<Metadata> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(bytes) {
        Ok(httparse::Status::Complete(body_start)) => {
            let code = resp.code?;
            let reason = resp.reason.unwrap_or("");
            let status = format!("{code} {reason}").trim().to_string();
            let body = String::from_utf8_lossy(&bytes[body_start..]).into_owned();
            Some(Metadata::HttpResponse { status, body })
        }
        Ok(httparse::Status::Partial) => {
            let code = resp.code?;
            let reason = resp.reason.unwrap_or("");
            let status = format!("{code} {reason}").trim().to_string();
            Some(Metadata::HttpResponse { status, body: String::new() })
        }
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_an_http_get_request() {
        let request = b"GET /flag HTTP/1.1\r\nHost: x\r\n\r\n";
        match parse(request) {
            Some(Metadata::HttpRequest { method, url, .. }) => {
                assert_eq!(method, "GET");
                assert_eq!(url, "/flag");
            }
            other => panic!("expected an http request, got {other:?}"),
        }
    }

    #[test]
    fn recognizes_an_http_response_with_body() {
        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nCTF{";
        match parse(response) {
            Some(Metadata::HttpResponse { status, body }) => {
                assert_eq!(status, "200 OK");
                assert_eq!(body, "CTF{");
            }
            other => panic!("expected an http response, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_content_yields_no_metadata() {
        assert!(parse(b"\x00\x01\x02garbage").is_none());
    }
}
