//! Pre-authorization gate.
//!
//! Every accelerated request is first replayed (headers only, empty body)
//! against the application backend, which decides whether the caller may
//! proceed and, if so, returns the per-request envelope. Non-200 backend
//! responses are forwarded verbatim: that is how HTTP authentication
//! challenges (401 + `WWW-Authenticate`) reach the user agent.

use std::path::Path;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use serde::Deserialize;
use tracing::{error, warn};

use crate::AppState;

/// User agent sent on every backend subrequest. Some backend routing setups
/// key on it.
pub const BACKEND_USER_AGENT: &str = "gitshuttle";

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Per-request envelope decoded from the backend's 200 response.
///
/// `user_id` and `repo_path` drive the git RPC handlers; the archive fields
/// are only populated for archive requests.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthEnvelope {
    #[serde(rename = "GL_ID", default)]
    pub user_id: String,
    #[serde(rename = "RepoPath", default)]
    pub repo_path: String,
    #[serde(rename = "ArchivePath", default)]
    pub archive_path: String,
    #[serde(rename = "ArchivePrefix", default)]
    pub archive_prefix: String,
    #[serde(rename = "CommitId", default)]
    pub commit_id: String,
}

/// Outcome of the gate.
pub enum PreAuth {
    /// Backend said 200. `www_authenticate` carries header values to copy
    /// onto the final response (negotiate auth returns them even on
    /// success).
    Authorized {
        envelope: AuthEnvelope,
        www_authenticate: Vec<HeaderValue>,
    },
    /// Anything else: the backend's status, headers, and body, forwarded
    /// verbatim.
    Denied(Response),
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

pub async fn pre_authorize(state: &AppState, parts: &Parts) -> PreAuth {
    match auth_request(state, parts).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(error = %err, "pre-authorization request failed");
            PreAuth::Denied(super::fail_500())
        }
    }
}

async fn auth_request(state: &AppState, parts: &Parts) -> Result<PreAuth> {
    let url = format!(
        "{}{}",
        state.config.backend.url.trim_end_matches('/'),
        parts
            .uri
            .path_and_query()
            .map_or("/", |pq| pq.as_str()),
    );

    let mut request = state
        .http_client
        .request(parts.method.clone(), &url)
        .headers(parts.headers.clone());
    // The Host header does not survive the general header copy on every
    // transport (h2 carries it as :authority), so set it explicitly. The
    // backend then sees the same Host a direct request would.
    if let Some(host) = host_value(parts) {
        request = request.header(header::HOST, host);
    }

    let response = request
        .header(header::USER_AGENT, BACKEND_USER_AGENT)
        .send()
        .await
        .context("auth backend request")?;

    if response.status() != StatusCode::OK {
        return Ok(PreAuth::Denied(forward_verbatim(response)));
    }

    let www_authenticate = www_authenticate_values(response.headers());
    let envelope = response
        .json::<AuthEnvelope>()
        .await
        .context("decode auth envelope")?;

    Ok(PreAuth::Authorized {
        envelope,
        www_authenticate,
    })
}

fn host_value(parts: &Parts) -> Option<HeaderValue> {
    parts.headers.get(header::HOST).cloned().or_else(|| {
        parts
            .uri
            .authority()
            .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
    })
}

/// Backend response headers matching `WWW-Authenticate` (the header map's
/// lookup is already case-insensitive per RFC 7230).
fn www_authenticate_values(headers: &HeaderMap) -> Vec<HeaderValue> {
    headers
        .get_all(header::WWW_AUTHENTICATE)
        .iter()
        .cloned()
        .collect()
}

fn forward_verbatim(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let headers = upstream.headers().clone();
    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

// ---------------------------------------------------------------------------
// Repository probe
// ---------------------------------------------------------------------------

/// A path is accepted as a repository iff `<repo_path>/objects` exists.
pub async fn looks_like_repo(repo_path: &str) -> bool {
    match tokio::fs::metadata(Path::new(repo_path).join("objects")).await {
        Ok(_) => true,
        Err(err) => {
            warn!(repo_path, error = %err, "repository objects directory missing");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_decodes_backend_field_names() {
        let body = r#"{
            "GL_ID": "user-42",
            "RepoPath": "/srv/repos/a.git",
            "ArchivePath": "/var/cache/a/master.tar.gz",
            "ArchivePrefix": "a-master",
            "CommitId": "deadbeef"
        }"#;
        let envelope: AuthEnvelope = serde_json::from_str(body).unwrap();
        assert_eq!(envelope.user_id, "user-42");
        assert_eq!(envelope.repo_path, "/srv/repos/a.git");
        assert_eq!(envelope.archive_prefix, "a-master");
        assert_eq!(envelope.commit_id, "deadbeef");
    }

    #[test]
    fn envelope_tolerates_missing_archive_fields() {
        let envelope: AuthEnvelope =
            serde_json::from_str(r#"{"GL_ID":"u1","RepoPath":"/srv/r.git"}"#).unwrap();
        assert_eq!(envelope.user_id, "u1");
        assert!(envelope.archive_path.is_empty());
        assert!(envelope.commit_id.is_empty());
    }

    #[test]
    fn www_authenticate_matching_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "www-authenticate",
            HeaderValue::from_static("Basic realm=\"x\""),
        );
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        let values = www_authenticate_values(&headers);
        assert_eq!(values, vec![HeaderValue::from_static("Basic realm=\"x\"")]);
    }

    #[test]
    fn host_prefers_header_over_authority() {
        let request = axum::http::Request::builder()
            .uri("http://authority.example/x")
            .header(header::HOST, "header.example")
            .body(())
            .unwrap();
        let (parts, ()) = request.into_parts();
        assert_eq!(
            host_value(&parts),
            Some(HeaderValue::from_static("header.example"))
        );
    }

    #[tokio::test]
    async fn looks_like_repo_requires_objects_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("r.git");
        std::fs::create_dir_all(repo.join("refs")).unwrap();
        assert!(!looks_like_repo(repo.to_str().unwrap()).await);

        std::fs::create_dir_all(repo.join("objects")).unwrap();
        assert!(looks_like_repo(repo.to_str().unwrap()).await);
    }
}
