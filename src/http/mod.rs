//! HTTP layer for the git acceleration proxy.
//!
//! The router dispatches accelerated git requests (info/refs, upload/receive
//! RPC, archive downloads) through the pre-auth gate to streaming handlers
//! that proxy a locally spawned subprocess.

pub mod archive;
pub mod handler;
pub mod inforefs;
pub mod preauth;
pub mod rpc;

use std::time::Duration;

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::warn;

// ---------------------------------------------------------------------------
// Canned responses
// ---------------------------------------------------------------------------

pub(crate) fn plain_response(status: StatusCode, body: &'static str) -> Response {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .unwrap()
}

pub(crate) fn fail_500() -> Response {
    plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

pub(crate) fn not_found() -> Response {
    plain_response(StatusCode::NOT_FOUND, "Not Found")
}

pub(crate) fn forbidden() -> Response {
    plain_response(StatusCode::FORBIDDEN, "Forbidden")
}

// ---------------------------------------------------------------------------
// Streaming plumbing
// ---------------------------------------------------------------------------

/// Channel half feeding a streaming response body.
pub(crate) type BodySender = mpsc::Sender<Result<Bytes, std::io::Error>>;

pub(crate) const BODY_CHANNEL_DEPTH: usize = 8;
pub(crate) const COPY_BUF: usize = 32 * 1024;

/// Hand one chunk to the response body, honouring the write deadline.
///
/// Returns `false` when the client went away or stalled past the deadline;
/// the caller is responsible for tearing its subprocess pipeline down.
pub(crate) async fn send_body_chunk(tx: &BodySender, chunk: Bytes, timeout: Duration) -> bool {
    use mpsc::error::SendTimeoutError;
    match tx.send_timeout(Ok(chunk), timeout).await {
        Ok(()) => true,
        Err(SendTimeoutError::Timeout(_)) => {
            warn!("response write exceeded deadline; dropping client");
            false
        }
        Err(SendTimeoutError::Closed(_)) => false,
    }
}

pub(crate) enum PumpOutcome {
    /// The reader reached EOF and every byte was delivered.
    Done,
    /// The client disconnected or stalled past the write deadline.
    ClientGone,
    ReadError(std::io::Error),
}

/// Copy `reader` into the response channel until EOF.
pub(crate) async fn pump_reader<R: AsyncRead + Unpin>(
    reader: &mut R,
    tx: &BodySender,
    timeout: Duration,
) -> PumpOutcome {
    let mut buf = BytesMut::with_capacity(COPY_BUF);
    loop {
        match reader.read_buf(&mut buf).await {
            Ok(0) => return PumpOutcome::Done,
            Ok(_) => {
                if !send_body_chunk(tx, buf.split().freeze(), timeout).await {
                    return PumpOutcome::ClientGone;
                }
            }
            Err(err) => return PumpOutcome::ReadError(err),
        }
    }
}
