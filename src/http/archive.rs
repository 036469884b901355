//! Compressed repository snapshot downloads with an on-disk cache.
//!
//! A snapshot is produced by `git archive` (piped through an external
//! compressor for the compressed tar formats) and teed to both the client
//! and a temp file next to the cache destination. Finalisation is a hard
//! link, so a cached archive only ever becomes visible complete, and two
//! concurrent builders for the same commit race harmlessly: the loser's
//! `link(2)` fails with "exists" and its temp file is discarded.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, SystemTime};

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::BytesMut;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdout;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{debug, error, info, instrument, warn};

use crate::git::{git_command, pipe_stdout_into, ProcessGroup};
use crate::http::preauth::AuthEnvelope;
use crate::http::{send_body_chunk, BodySender, BODY_CHANNEL_DEPTH, COPY_BUF};
use crate::metrics::CacheResult;
use crate::AppState;

// ---------------------------------------------------------------------------
// Formats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
    TarBz2,
}

impl ArchiveFormat {
    /// Value handed to `git archive --format=`.
    fn format_arg(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Tar | ArchiveFormat::TarGz | ArchiveFormat::TarBz2 => "tar",
        }
    }

    /// External compressor the tar stream is piped through, if any.
    fn compressor(self) -> Option<(&'static str, &'static [&'static str])> {
        match self {
            ArchiveFormat::TarGz => Some(("gzip", &["-c", "-n"])),
            ArchiveFormat::TarBz2 => Some(("bzip2", &["-c"])),
            ArchiveFormat::Zip | ArchiveFormat::Tar => None,
        }
    }

    fn content_type(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "application/zip",
            _ => "application/octet-stream",
        }
    }
}

/// Map a request basename to its archive format. A bare `archive` means
/// gzipped tar.
pub fn parse_basename(basename: &str) -> Option<ArchiveFormat> {
    match basename {
        "archive.zip" => Some(ArchiveFormat::Zip),
        "archive.tar" => Some(ArchiveFormat::Tar),
        "archive" | "archive.tar.gz" | "archive.tgz" | "archive.gz" => Some(ArchiveFormat::TarGz),
        "archive.tar.bz2" | "archive.tbz" | "archive.tbz2" | "archive.tb2" | "archive.bz2" => {
            Some(ArchiveFormat::TarBz2)
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

#[instrument(skip_all, fields(repo = %env.repo_path, commit = %env.commit_id))]
pub async fn handle(state: &AppState, env: &AuthEnvelope, req: Request) -> Response {
    let basename = req.uri().path().rsplit('/').next().unwrap_or("");
    let Some(format) = parse_basename(basename) else {
        return super::not_found();
    };

    if env.archive_path.is_empty() || env.commit_id.is_empty() {
        error!("backend envelope is missing archive parameters");
        return super::fail_500();
    }
    let Some(filename) = Path::new(&env.archive_path)
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
    else {
        error!(archive_path = %env.archive_path, "archive path has no basename");
        return super::fail_500();
    };

    // ---- cache hit ----
    if let Some(response) = serve_cached(&env.archive_path, format, &filename, req).await {
        state.metrics.metrics.count_archive_cache(CacheResult::Hit);
        info!(archive_path = %env.archive_path, "serving cached archive");
        return response;
    }
    state.metrics.metrics.count_archive_cache(CacheResult::Miss);

    // ---- cache miss: build, tee, finalize ----
    let cache_dir = match Path::new(&env.archive_path).parent() {
        Some(dir) => dir.to_path_buf(),
        None => {
            error!(archive_path = %env.archive_path, "archive path has no directory");
            return super::fail_500();
        }
    };
    if let Err(err) = tokio::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&cache_dir)
        .await
    {
        error!(error = %err, dir = %cache_dir.display(), "create archive cache directory");
        return super::fail_500();
    }

    // The temp file lives next to the destination so finalisation is a
    // link, not a cross-device copy; dropping it removes the temp name.
    let tmp = match tempfile::Builder::new()
        .prefix(&format!("{filename}."))
        .tempfile_in(&cache_dir)
    {
        Ok(tmp) => tmp,
        Err(err) => {
            error!(error = %err, "create archive temp file");
            return super::fail_500();
        }
    };

    let (pipeline, stdout) = match spawn_pipeline(env, format).await {
        Ok(parts) => parts,
        Err(response) => return *response,
    };

    let cache_file = match tmp.reopen() {
        Ok(file) => tokio::fs::File::from_std(file),
        Err(err) => {
            error!(error = %err, "reopen archive temp file");
            teardown(pipeline).await;
            return super::fail_500();
        }
    };

    let (tx, rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
    let write_timeout = Duration::from_secs(state.config.proxy.response_write_timeout);
    let archive_path = env.archive_path.clone();
    tokio::spawn(async move {
        stream_and_cache(stdout, pipeline, cache_file, tmp, archive_path, tx, write_timeout)
            .await;
    });

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    *response.status_mut() = StatusCode::OK;
    set_archive_headers(response.headers_mut(), format, &filename);
    response
}

// ---------------------------------------------------------------------------
// Cache hit
// ---------------------------------------------------------------------------

/// Serve the cached archive through the range-aware file service, or `None`
/// on a miss. The cache file's mtime is pinned to the epoch at finalize
/// time, so conditional-GET revalidation never interferes with byte-range
/// resumption.
async fn serve_cached(
    archive_path: &str,
    format: ArchiveFormat,
    filename: &str,
    req: Request,
) -> Option<Response> {
    tokio::fs::metadata(archive_path).await.ok()?;

    // Replay the client's headers so Range and If-Range behave as if the
    // file service handled the request directly.
    let mut probe = axum::http::Request::new(Body::empty());
    *probe.headers_mut() = req.headers().clone();

    let served = match ServeFile::new(archive_path).oneshot(probe).await {
        Ok(served) => served,
        Err(_) => return None,
    };
    if served.status() == StatusCode::NOT_FOUND {
        // Deleted between the probe and the open; rebuild it.
        return None;
    }

    let mut response = served.map(Body::new);
    set_archive_headers(response.headers_mut(), format, filename);
    Some(response)
}

/// Identical on cache hit and miss. A `Content-Length` is never set here:
/// the miss path streams with unknown length, and on the hit path the file
/// service supplies its own alongside the range headers.
fn set_archive_headers(headers: &mut HeaderMap, format: ArchiveFormat, filename: &str) {
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(format.content_type()),
    );
    headers.insert(
        HeaderName::from_static("content-transfer-encoding"),
        HeaderValue::from_static("binary"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private"));
}

// ---------------------------------------------------------------------------
// Cache miss
// ---------------------------------------------------------------------------

/// Spawn `git archive` and, for the compressed tar formats, the compressor
/// it feeds. Returns the children in pipeline order plus the final stdout.
async fn spawn_pipeline(
    env: &AuthEnvelope,
    format: ArchiveFormat,
) -> Result<(Vec<ProcessGroup>, ChildStdout), Box<Response>> {
    let git_dir = format!("--git-dir={}", env.repo_path);
    let format_arg = format!("--format={}", format.format_arg());
    let prefix_arg = format!("--prefix={}/", env.archive_prefix);
    let mut archive_cmd = git_command(
        &env.user_id,
        "git",
        &[&git_dir, "archive", &format_arg, &prefix_arg, &env.commit_id],
    );
    archive_cmd.stdout(Stdio::piped());

    let mut producer = match ProcessGroup::spawn(archive_cmd, "git-archive") {
        Ok(child) => child,
        Err(err) => {
            error!(error = %err, "spawn git archive");
            return Err(Box::new(super::fail_500()));
        }
    };

    match format.compressor() {
        None => {
            let Some(stdout) = producer.take_stdout() else {
                error!("git archive has no stdout pipe");
                producer.terminate().await;
                return Err(Box::new(super::fail_500()));
            };
            Ok((vec![producer], stdout))
        }
        Some((program, args)) => {
            let mut compress_cmd = git_command(&env.user_id, program, args);
            compress_cmd.stdout(Stdio::piped());
            if let Err(err) = pipe_stdout_into(&mut producer, &mut compress_cmd) {
                error!(error = %err, "connect archive pipeline");
                producer.terminate().await;
                return Err(Box::new(super::fail_500()));
            }
            let mut consumer = match ProcessGroup::spawn(compress_cmd, "archive-compress") {
                Ok(child) => child,
                Err(err) => {
                    error!(error = %err, program, "spawn archive compressor");
                    producer.terminate().await;
                    return Err(Box::new(super::fail_500()));
                }
            };
            let Some(stdout) = consumer.take_stdout() else {
                error!("archive compressor has no stdout pipe");
                producer.terminate().await;
                consumer.terminate().await;
                return Err(Box::new(super::fail_500()));
            };
            Ok((vec![producer, consumer], stdout))
        }
    }
}

/// Tee the pipeline's output to the temp file and the client, then finalize
/// the cache entry. Any failure discards the temp file (its drop removes
/// the name) and truncates the response.
async fn stream_and_cache(
    mut stdout: ChildStdout,
    mut pipeline: Vec<ProcessGroup>,
    mut cache_file: tokio::fs::File,
    tmp: NamedTempFile,
    archive_path: String,
    tx: BodySender,
    write_timeout: Duration,
) {
    let mut buf = BytesMut::with_capacity(COPY_BUF);
    loop {
        match stdout.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let chunk = buf.split().freeze();
                // Cache first, client second: every byte the client saw is
                // in the temp file.
                if let Err(err) = cache_file.write_all(&chunk).await {
                    error!(error = %err, "write archive temp file");
                    teardown(pipeline).await;
                    return;
                }
                if !send_body_chunk(&tx, chunk, write_timeout).await {
                    teardown(pipeline).await;
                    return;
                }
            }
            Err(err) => {
                error!(error = %err, "read archive pipeline output");
                teardown(pipeline).await;
                return;
            }
        }
    }

    // Wait in pipeline order; a non-zero exit means the bytes are suspect.
    let mut failed = false;
    for child in &mut pipeline {
        match child.wait().await {
            Ok(status) if !status.success() => {
                warn!(%status, "archive subprocess exited non-zero");
                failed = true;
            }
            Err(err) => {
                warn!(error = %err, "wait for archive subprocess");
                failed = true;
            }
            _ => {}
        }
    }
    if failed {
        return;
    }

    if let Err(err) = finalize(cache_file, &tmp, &archive_path).await {
        warn!(error = %err, archive_path, "finalize cached archive");
    } else {
        debug!(archive_path, "archive cached");
    }
}

async fn finalize(
    mut cache_file: tokio::fs::File,
    tmp: &NamedTempFile,
    archive_path: &str,
) -> anyhow::Result<()> {
    cache_file.flush().await?;
    drop(cache_file);
    // Epoch mtime: see `serve_cached`.
    tmp.as_file().set_modified(SystemTime::UNIX_EPOCH)?;
    match tokio::fs::hard_link(tmp.path(), archive_path).await {
        Ok(()) => Ok(()),
        // A concurrent request for the same commit won the race; its bytes
        // are already published.
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn teardown(mut pipeline: Vec<ProcessGroup>) {
    for child in &mut pipeline {
        child.terminate().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_table() {
        assert_eq!(parse_basename("archive.zip"), Some(ArchiveFormat::Zip));
        assert_eq!(parse_basename("archive.tar"), Some(ArchiveFormat::Tar));
        assert_eq!(parse_basename("archive"), Some(ArchiveFormat::TarGz));
        assert_eq!(parse_basename("archive.tar.gz"), Some(ArchiveFormat::TarGz));
        assert_eq!(parse_basename("archive.tgz"), Some(ArchiveFormat::TarGz));
        assert_eq!(parse_basename("archive.gz"), Some(ArchiveFormat::TarGz));
        assert_eq!(parse_basename("archive.tar.bz2"), Some(ArchiveFormat::TarBz2));
        assert_eq!(parse_basename("archive.tbz"), Some(ArchiveFormat::TarBz2));
        assert_eq!(parse_basename("archive.tbz2"), Some(ArchiveFormat::TarBz2));
        assert_eq!(parse_basename("archive.tb2"), Some(ArchiveFormat::TarBz2));
        assert_eq!(parse_basename("archive.bz2"), Some(ArchiveFormat::TarBz2));
        assert_eq!(parse_basename("archive.rar"), None);
        assert_eq!(parse_basename("other"), None);
    }

    #[test]
    fn format_args_and_compressors() {
        assert_eq!(ArchiveFormat::Zip.format_arg(), "zip");
        assert_eq!(ArchiveFormat::TarGz.format_arg(), "tar");
        assert!(ArchiveFormat::Zip.compressor().is_none());
        assert!(ArchiveFormat::Tar.compressor().is_none());
        assert_eq!(
            ArchiveFormat::TarGz.compressor(),
            Some(("gzip", &["-c", "-n"][..]))
        );
        assert_eq!(
            ArchiveFormat::TarBz2.compressor(),
            Some(("bzip2", &["-c"][..]))
        );
    }

    #[test]
    fn headers_match_on_hit_and_miss() {
        let mut hit = HeaderMap::new();
        set_archive_headers(&mut hit, ArchiveFormat::TarGz, "r-main.tar.gz");

        let mut miss = HeaderMap::new();
        set_archive_headers(&mut miss, ArchiveFormat::TarGz, "r-main.tar.gz");

        assert_eq!(hit, miss);
        assert_eq!(
            hit.get(header::CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"r-main.tar.gz\""
        );
        assert_eq!(hit.get(header::CONTENT_TYPE).unwrap(), "application/octet-stream");
        assert_eq!(hit.get("content-transfer-encoding").unwrap(), "binary");
        assert_eq!(hit.get(header::CACHE_CONTROL).unwrap(), "private");
    }

    #[test]
    fn zip_content_type() {
        let mut headers = HeaderMap::new();
        set_archive_headers(&mut headers, ArchiveFormat::Zip, "r.zip");
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "application/zip");
    }

    #[tokio::test]
    async fn finalize_links_and_pins_epoch_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = NamedTempFile::new_in(dir.path()).unwrap();
        let mut file = tokio::fs::File::from_std(tmp.reopen().unwrap());
        file.write_all(b"archive bytes").await.unwrap();

        let target = dir.path().join("r-main.tar.gz");
        finalize(file, &tmp, target.to_str().unwrap()).await.unwrap();

        let meta = std::fs::metadata(&target).unwrap();
        assert_eq!(meta.modified().unwrap(), SystemTime::UNIX_EPOCH);
        assert_eq!(std::fs::read(&target).unwrap(), b"archive bytes");
    }

    #[tokio::test]
    async fn finalize_tolerates_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("r-main.tar.gz");
        std::fs::write(&target, b"winner").unwrap();

        let tmp = NamedTempFile::new_in(dir.path()).unwrap();
        let mut file = tokio::fs::File::from_std(tmp.reopen().unwrap());
        file.write_all(b"loser").await.unwrap();

        finalize(file, &tmp, target.to_str().unwrap()).await.unwrap();
        // The first writer's bytes stay published.
        assert_eq!(std::fs::read(&target).unwrap(), b"winner");
    }

    #[tokio::test]
    async fn temp_file_vanishes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let tmp = NamedTempFile::new_in(dir.path()).unwrap();
            tmp.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
