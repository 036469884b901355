//! Subprocess spawning with process-group lifecycle guarantees.
//!
//! Every child runs in its own process group with a scrubbed environment, so
//! a single signal to the negated group id reaches helpers the tool forks
//! internally (pack compressors and the like), and no proxy configuration
//! leaks into the child. A per-child watcher task ties the group's lifetime
//! to the request: dropping an unwaited [`ProcessGroup`] signals the group.

use std::os::fd::OwnedFd;
use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::sync::DropGuard;
use tracing::warn;

// ---------------------------------------------------------------------------
// Command builder
// ---------------------------------------------------------------------------

/// Build a command for the version-control tool.
///
/// The child joins a fresh process group whose id equals its pid. The
/// environment is replaced, not inherited: only the parent's `PATH` and the
/// caller identity (`GL_ID`) survive. Stderr is wired to the parent's stderr
/// so the tool's diagnostics are not lost.
pub fn git_command(user_id: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.env_clear();
    cmd.env("PATH", std::env::var_os("PATH").unwrap_or_default());
    cmd.env("GL_ID", user_id);
    cmd.process_group(0);
    cmd.stdin(Stdio::null());
    cmd.stderr(Stdio::inherit());
    cmd
}

/// Connect `producer`'s stdout directly to `consumer`'s stdin.
///
/// The parent's copy of the pipe is moved into the consumer, so no bytes are
/// buffered in this process and the descriptor closes as soon as the
/// consumer is spawned.
pub fn pipe_stdout_into(producer: &mut ProcessGroup, consumer: &mut Command) -> Result<()> {
    let stdout = producer
        .take_stdout()
        .context("producer stdout already taken")?;
    let fd: OwnedFd = stdout
        .into_owned_fd()
        .context("convert producer stdout into an owned fd")?;
    consumer.stdin(Stdio::from(fd));
    Ok(())
}

// ---------------------------------------------------------------------------
// Process-group handle
// ---------------------------------------------------------------------------

/// A running child in its own process group.
///
/// Exactly one of [`wait`](Self::wait) or [`terminate`](Self::terminate)
/// should complete the lifecycle; both reap the child. If the handle is
/// dropped before either, the watcher task signals the group and the runtime
/// reaps the orphan in the background.
pub struct ProcessGroup {
    child: Child,
    pgid: i32,
    label: &'static str,
    status: Option<ExitStatus>,
    guard: Option<DropGuard>,
    watcher: tokio::task::JoinHandle<()>,
}

impl ProcessGroup {
    /// Spawn `cmd` and register the cancellation watcher for its group.
    pub fn spawn(mut cmd: Command, label: &'static str) -> Result<Self> {
        let child = cmd.spawn().with_context(|| format!("spawn {label}"))?;
        let pgid = child.id().map_or(0, |pid| pid as i32);

        let token = tokio_util::sync::CancellationToken::new();
        let watcher_token = token.clone();
        let watcher = tokio::spawn(async move {
            watcher_token.cancelled().await;
            signal_group(pgid, label);
        });

        Ok(Self {
            child,
            pgid,
            label,
            status: None,
            guard: Some(token.drop_guard()),
            watcher,
        })
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Wait for the child to exit and reap it.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.status = Some(status);
        self.disarm();
        Ok(status)
    }

    /// Signal the whole group with SIGTERM and reap the child.
    ///
    /// Idempotent: calling it after a normal exit (or twice) is a no-op.
    pub async fn terminate(&mut self) {
        if self.status.is_none() {
            signal_group(self.pgid, self.label);
            match self.child.wait().await {
                Ok(status) => self.status = Some(status),
                Err(err) => warn!(label = self.label, error = %err, "reap after terminate failed"),
            }
        }
        self.disarm();
    }

    // Once the leader is reaped the pgid may be reused, so the watcher must
    // never fire past this point.
    fn disarm(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.disarm();
        }
        self.watcher.abort();
    }
}

fn signal_group(pgid: i32, label: &str) {
    if pgid <= 0 {
        return;
    }
    match signal::kill(Pid::from_raw(-pgid), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(pgid, label, error = %err, "failed to signal process group"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
