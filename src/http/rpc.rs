//! Stateless-RPC proxying for `git-upload-pack` and `git-receive-pack`.
//!
//! The client's POST body is streamed into the subprocess's stdin (through a
//! gzip decoder when the client compressed it) and the subprocess's stdout
//! is streamed back. Upload-pack bodies are sniffed for a `deepen` directive
//! first: the tool exits non-zero on a successful shallow clone, and the
//! sniff result is what lets us tell that apart from a real failure.

use std::process::Stdio;
use std::time::Duration;

use async_compression::tokio::bufread::GzipDecoder;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::response::Response;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::io::StreamReader;
use tracing::{error, instrument, warn};

use crate::git::pktline::{scan_deepen, SNIFF_LEN};
use crate::git::{git_command, ProcessGroup};
use crate::http::preauth::AuthEnvelope;
use crate::http::{BodySender, PumpOutcome, BODY_CHANNEL_DEPTH};
use crate::AppState;

#[instrument(skip_all, fields(repo = %env.repo_path, action = tracing::field::Empty))]
pub async fn handle(state: &AppState, env: &AuthEnvelope, req: Request) -> Response {
    let (parts, body) = req.into_parts();

    let action = match parts.uri.path().rsplit('/').next() {
        Some(action @ ("git-upload-pack" | "git-receive-pack")) => action.to_string(),
        _ => {
            error!(path = %parts.uri.path(), "unsupported RPC action");
            return super::fail_500();
        }
    };
    tracing::Span::current().record("action", action.as_str());

    // The client request body may have been gzipped.
    let gzipped = parts
        .headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("gzip"));

    let stream = body
        .into_data_stream()
        .map(|result| result.map_err(std::io::Error::other));
    let reader = StreamReader::new(stream);
    let mut reader: Box<dyn AsyncRead + Send + Unpin> = if gzipped {
        Box::new(GzipDecoder::new(tokio::io::BufReader::new(reader)))
    } else {
        Box::new(reader)
    };

    // Buffer the first bytes of upload-pack bodies to spot shallow clones;
    // the buffer is replayed ahead of the remaining stream so the child sees
    // everything.
    let mut prefix = Vec::with_capacity(SNIFF_LEN);
    let mut shallow = false;
    if action == "git-upload-pack" {
        match (&mut reader).take(SNIFF_LEN as u64).read_to_end(&mut prefix).await {
            Ok(_) => shallow = scan_deepen(&prefix),
            // Non-fatal: carry on without the hint.
            Err(err) => warn!(error = %err, "sniff upload-pack request body"),
        }
    }

    let subcommand = action.trim_start_matches("git-").to_string();
    let mut cmd = git_command(
        &env.user_id,
        "git",
        &[&subcommand, "--stateless-rpc", &env.repo_path],
    );
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    let mut child = match ProcessGroup::spawn(cmd, "git-rpc") {
        Ok(child) => child,
        Err(err) => {
            error!(error = %err, "spawn RPC subprocess");
            return super::fail_500();
        }
    };
    let (Some(stdin), Some(stdout)) = (child.take_stdin(), child.take_stdout()) else {
        error!("RPC subprocess pipes missing");
        child.terminate().await;
        return super::fail_500();
    };

    // Feed the whole request into the child before the response commits;
    // a body error at this stage can still become a clean 500.
    let mut body_reader = std::io::Cursor::new(prefix).chain(reader);
    if let Err(err) = feed_child(&mut body_reader, stdin).await {
        error!(error = %err, "copy request body to RPC subprocess");
        child.terminate().await;
        return super::fail_500();
    }

    let (tx, rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
    let write_timeout = Duration::from_secs(state.config.proxy.response_write_timeout);
    let silence_nonzero = action == "git-upload-pack" && shallow;
    tokio::spawn(async move {
        stream_result(stdout, child, tx, write_timeout, silence_nonzero).await;
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, format!("application/x-{action}-result"))
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap()
}

/// Copy the (possibly rebuilt) request body into the child and close its
/// stdin so it sees end-of-stream.
async fn feed_child<R: AsyncRead + Unpin>(
    reader: &mut R,
    mut stdin: ChildStdin,
) -> std::io::Result<()> {
    tokio::io::copy(reader, &mut stdin).await?;
    stdin.shutdown().await?;
    Ok(())
}

async fn stream_result(
    mut stdout: ChildStdout,
    mut child: ProcessGroup,
    tx: BodySender,
    write_timeout: Duration,
    silence_nonzero: bool,
) {
    match super::pump_reader(&mut stdout, &tx, write_timeout).await {
        PumpOutcome::Done => match child.wait().await {
            // A successful shallow clone makes upload-pack exit non-zero;
            // the sniffed hint keeps that out of the logs.
            Ok(status) if !status.success() && !silence_nonzero => {
                warn!(%status, "RPC subprocess exited non-zero");
            }
            Err(err) => warn!(error = %err, "wait for RPC subprocess"),
            _ => {}
        },
        PumpOutcome::ClientGone => child.terminate().await,
        PumpOutcome::ReadError(err) => {
            warn!(error = %err, "read RPC subprocess output");
            child.terminate().await;
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
    fn subcommand_strips_service_prefix() {
        assert_eq!("git-upload-pack".trim_start_matches("git-"), "upload-pack");
        assert_eq!("git-receive-pack".trim_start_matches("git-"), "receive-pack");
    }

    #[tokio::test]
    async fn gzipped_body_roundtrip_through_decoder() {
        use async_compression::tokio::write::GzipEncoder;

        let mut encoder = GzipEncoder::new(Vec::new());
        encoder.write_all(b"0011deepen 1\n0000").await.unwrap();
        encoder.shutdown().await.unwrap();
        let compressed = encoder.into_inner();

        let mut decoder = GzipDecoder::new(tokio::io::BufReader::new(&compressed[..]));
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"0011deepen 1\n0000");
        assert!(scan_deepen(&out));
    }
}
