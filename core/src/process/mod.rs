//! Process channel: one supervised child behind a poll-driven socket interface
//!
//! The child's stdin and stdout share one full-duplex local socket, its
//! stderr gets a second one, and a third private pair exists only to wake a
//! blocked receive. Callers move raw bytes with fixed, caller-owned buffers:
//!
//! - `send` writes to the child's stdin and never raises SIGPIPE
//! - `recv` waits on stdout, stderr and the wake socket at once
//! - `cancel_recv` wakes a `recv` blocked in another thread
//! - `is_alive` reports whether either stream has been seen to close
//! - `close` releases every descriptor and reaps the child if it has exited
//!
//! ## Platform Support
//!
//! - **Linux, FreeBSD**: full support (`MSG_NOSIGNAL`, `SOCK_CLOEXEC`)

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
pub mod unix;

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
pub use unix::*;

/// Outcome of one successful receive call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStatus {
    /// Nothing was copied: the wait timed out, was cancelled, or only
    /// observed closure
    NoData,
    /// Bytes were copied into at least one of the caller's buffers
    Data {
        /// Bytes written to the stdout buffer
        stdout: usize,
        /// Bytes written to the stderr buffer
        stderr: usize,
    },
}

impl RecvStatus {
    pub(crate) fn from_sizes(stdout: usize, stderr: usize) -> Self {
        if stdout == 0 && stderr == 0 {
            RecvStatus::NoData
        } else {
            RecvStatus::Data { stdout, stderr }
        }
    }

    /// Whether any bytes were copied
    pub fn has_data(&self) -> bool {
        matches!(self, RecvStatus::Data { .. })
    }

    /// Bytes copied into the stdout buffer
    pub fn stdout_len(&self) -> usize {
        match self {
            RecvStatus::Data { stdout, .. } => *stdout,
            RecvStatus::NoData => 0,
        }
    }

    /// Bytes copied into the stderr buffer
    pub fn stderr_len(&self) -> usize {
        match self {
            RecvStatus::Data { stderr, .. } => *stderr,
            RecvStatus::NoData => 0,
        }
    }
}
