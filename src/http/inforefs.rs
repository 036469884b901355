//! Reference advertisement for clone/fetch/push negotiation.
//!
//! `GET …/info/refs?service=git-upload-pack|git-receive-pack` spawns the
//! matching subcommand with `--advertise-refs` and streams its output behind
//! the protocol's service announcement header. Only the smart protocol is
//! served; anything else is a 404.

use std::process::Stdio;
use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::BytesMut;
use tokio::process::ChildStdout;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, instrument, warn};

use crate::git::{git_command, pktline, ProcessGroup};
use crate::http::preauth::AuthEnvelope;
use crate::http::{send_body_chunk, BodySender, PumpOutcome, BODY_CHANNEL_DEPTH};
use crate::AppState;

#[instrument(skip_all, fields(repo = %env.repo_path))]
pub async fn handle(state: &AppState, env: &AuthEnvelope, req: Request) -> Response {
    let service = match query_param(req.uri().query(), "service") {
        Some(service) => service,
        None => return super::not_found(),
    };
    if service != "git-upload-pack" && service != "git-receive-pack" {
        // The 'dumb' protocol variant is not supported.
        return super::not_found();
    }
    let subcommand = service.trim_start_matches("git-").to_string();

    let mut cmd = git_command(
        &env.user_id,
        "git",
        &[
            &subcommand,
            "--stateless-rpc",
            "--advertise-refs",
            &env.repo_path,
        ],
    );
    cmd.stdout(Stdio::piped());
    let mut child = match ProcessGroup::spawn(cmd, "info-refs") {
        Ok(child) => child,
        Err(err) => {
            error!(error = %err, "spawn advertisement subprocess");
            return super::fail_500();
        }
    };
    let Some(stdout) = child.take_stdout() else {
        error!("advertisement subprocess has no stdout pipe");
        child.terminate().await;
        return super::fail_500();
    };

    // Headers are committed now; everything past this point is
    // observability-only.
    let (tx, rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
    let write_timeout = Duration::from_secs(state.config.proxy.response_write_timeout);
    let announced = service.clone();
    tokio::spawn(async move {
        stream_advertisement(announced, stdout, child, tx, write_timeout).await;
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            format!("application/x-{service}-advertisement"),
        )
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap()
}

async fn stream_advertisement(
    service: String,
    mut stdout: ChildStdout,
    mut child: ProcessGroup,
    tx: BodySender,
    write_timeout: Duration,
) {
    let mut head = BytesMut::new();
    pktline::pkt_line(&mut head, format!("# service={service}\n").as_bytes());
    pktline::pkt_flush(&mut head);
    if !send_body_chunk(&tx, head.freeze(), write_timeout).await {
        child.terminate().await;
        return;
    }

    match super::pump_reader(&mut stdout, &tx, write_timeout).await {
        PumpOutcome::Done => match child.wait().await {
            Ok(status) if !status.success() => {
                warn!(%status, "advertisement subprocess exited non-zero");
            }
            Err(err) => warn!(error = %err, "wait for advertisement subprocess"),
            _ => {}
        },
        PumpOutcome::ClientGone => child.terminate().await,
        PumpOutcome::ReadError(err) => {
            warn!(error = %err, "read advertisement output");
            child.terminate().await;
        }
    }
}

/// Minimal query-string lookup; service names never need percent-decoding.
fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_finds_service() {
        assert_eq!(
            query_param(Some("service=git-upload-pack"), "service"),
            Some("git-upload-pack".to_string())
        );
        assert_eq!(
            query_param(Some("a=1&service=git-receive-pack&b=2"), "service"),
            Some("git-receive-pack".to_string())
        );
    }

    #[test]
    fn query_param_missing() {
        assert_eq!(query_param(None, "service"), None);
        assert_eq!(query_param(Some("other=1"), "service"), None);
        assert_eq!(query_param(Some("service"), "service"), Some(String::new()));
    }

    #[test]
    fn advertisement_header_bytes() {
        let mut head = BytesMut::new();
        pktline::pkt_line(&mut head, b"# service=git-upload-pack\n");
        pktline::pkt_flush(&mut head);
        assert_eq!(&head[..], b"001e# service=git-upload-pack\n0000");
    }
}
