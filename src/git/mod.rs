//! Subprocess plumbing for the version-control tool.

pub mod pktline;
pub mod spawn;

pub use spawn::{git_command, pipe_stdout_into, ProcessGroup};
