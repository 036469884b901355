//! Main axum router and git request dispatch.
//!
//! Exact routes exist for `/healthz` and `/metrics`; everything else runs
//! through the git service table, which matches on method and path suffix
//! the way the wire protocol expects. Anything the table does not know is a
//! 403 (mandated by the protocol for unknown services).

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::{error, info};

use crate::http::{archive, forbidden, inforefs, not_found, preauth, rpc};
use crate::metrics::Service;
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .fallback(dispatch)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Git service table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceKind {
    InfoRefs,
    UploadPack,
    ReceivePack,
    Archive,
}

struct GitService {
    method: &'static str,
    suffix: &'static str,
    kind: ServiceKind,
}

static GIT_SERVICES: &[GitService] = &[
    GitService { method: "GET", suffix: "/info/refs", kind: ServiceKind::InfoRefs },
    GitService { method: "POST", suffix: "/git-upload-pack", kind: ServiceKind::UploadPack },
    GitService { method: "POST", suffix: "/git-receive-pack", kind: ServiceKind::ReceivePack },
    GitService { method: "GET", suffix: "/repository/archive", kind: ServiceKind::Archive },
    GitService { method: "GET", suffix: "/repository/archive.zip", kind: ServiceKind::Archive },
    GitService { method: "GET", suffix: "/repository/archive.tar", kind: ServiceKind::Archive },
    GitService { method: "GET", suffix: "/repository/archive.tar.gz", kind: ServiceKind::Archive },
    GitService { method: "GET", suffix: "/repository/archive.tgz", kind: ServiceKind::Archive },
    GitService { method: "GET", suffix: "/repository/archive.gz", kind: ServiceKind::Archive },
    GitService { method: "GET", suffix: "/repository/archive.tar.bz2", kind: ServiceKind::Archive },
    GitService { method: "GET", suffix: "/repository/archive.tbz", kind: ServiceKind::Archive },
    GitService { method: "GET", suffix: "/repository/archive.tbz2", kind: ServiceKind::Archive },
    GitService { method: "GET", suffix: "/repository/archive.tb2", kind: ServiceKind::Archive },
    GitService { method: "GET", suffix: "/repository/archive.bz2", kind: ServiceKind::Archive },
];

fn find_service(method: &str, path: &str) -> Option<&'static GitService> {
    GIT_SERVICES
        .iter()
        .find(|service| service.method == method && path.ends_with(service.suffix))
}

fn metric_label(kind: ServiceKind) -> Service {
    match kind {
        ServiceKind::InfoRefs => Service::InfoRefs,
        ServiceKind::UploadPack => Service::UploadPack,
        ServiceKind::ReceivePack => Service::ReceivePack,
        ServiceKind::Archive => Service::Archive,
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

async fn dispatch(State(state): State<Arc<AppState>>, req: Request) -> Response {
    info!(method = %req.method(), uri = %req.uri(), "git request");

    let Some(service) = find_service(req.method().as_str(), req.uri().path()) else {
        return forbidden();
    };
    state.metrics.metrics.count_request(metric_label(service.kind));

    let (parts, body) = req.into_parts();
    let (envelope, www_authenticate) = match preauth::pre_authorize(&state, &parts).await {
        preauth::PreAuth::Authorized { envelope, www_authenticate } => {
            (envelope, www_authenticate)
        }
        preauth::PreAuth::Denied(response) => return response,
    };

    if envelope.repo_path.is_empty() || !preauth::looks_like_repo(&envelope.repo_path).await {
        return not_found();
    }

    let req = Request::from_parts(parts, body);
    let mut response = match service.kind {
        ServiceKind::InfoRefs => inforefs::handle(&state, &envelope, req).await,
        ServiceKind::UploadPack | ServiceKind::ReceivePack => {
            rpc::handle(&state, &envelope, req).await
        }
        ServiceKind::Archive => archive::handle(&state, &envelope, req).await,
    };

    // Negotiate (Kerberos) authentication may hand back WWW-Authenticate
    // alongside a 200, per RFC 4559.
    for value in www_authenticate {
        response.headers_mut().append(header::WWW_AUTHENTICATE, value);
    }
    response
}

// ---------------------------------------------------------------------------
// Ops endpoints
// ---------------------------------------------------------------------------

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    crate::health::health_response(&state).await
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    let mut buf = String::new();
    match prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry) {
        Ok(()) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buf,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "metrics encoding failed");
            super::fail_500()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use tower::ServiceExt;

    #[test]
    fn table_matches_git_endpoints() {
        let s = find_service("GET", "/group/project.git/info/refs").unwrap();
        assert_eq!(s.kind, ServiceKind::InfoRefs);

        let s = find_service("POST", "/group/project.git/git-upload-pack").unwrap();
        assert_eq!(s.kind, ServiceKind::UploadPack);

        let s = find_service("POST", "/group/project.git/git-receive-pack").unwrap();
        assert_eq!(s.kind, ServiceKind::ReceivePack);
    }

    #[test]
    fn table_matches_every_archive_basename() {
        for basename in [
            "archive",
            "archive.zip",
            "archive.tar",
            "archive.tar.gz",
            "archive.tgz",
            "archive.gz",
            "archive.tar.bz2",
            "archive.tbz",
            "archive.tbz2",
            "archive.tb2",
            "archive.bz2",
        ] {
            let path = format!("/group/project/repository/{basename}");
            let s = find_service("GET", &path)
                .unwrap_or_else(|| panic!("no match for {basename}"));
            assert_eq!(s.kind, ServiceKind::Archive);
        }
    }

    #[test]
    fn table_is_method_sensitive() {
        assert!(find_service("POST", "/p.git/info/refs").is_none());
        assert!(find_service("GET", "/p.git/git-upload-pack").is_none());
        assert!(find_service("PUT", "/p/repository/archive").is_none());
    }

    #[test]
    fn table_rejects_lookalike_suffixes() {
        assert!(find_service("GET", "/p/repository/archive.rar").is_none());
        assert!(find_service("GET", "/p/archive.tar.gz").is_none());
        assert!(find_service("GET", "/p.git/info/refs/extra").is_none());
    }

    #[tokio::test]
    async fn unknown_path_is_forbidden() {
        let state = crate::AppState::for_tests();
        let router = create_router(Arc::new(state));

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/group/project.git/somethingelse")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_exposition() {
        let state = crate::AppState::for_tests();
        let router = create_router(Arc::new(state));

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
