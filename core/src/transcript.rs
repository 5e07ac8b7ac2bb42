//! Transcript collection: drain a channel's stdout and stderr separately

use crate::adapters::SubprocessChannel;
use crate::process::RecvStatus;
use crate::Result;
use std::time::Instant;
use tracing::debug;

/// Per-call receive buffer size for each stream
pub const CHUNK_SIZE: usize = 4096;

/// Why [`Transcript::collect_into`] stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectEnd {
    /// The child's streams closed and no further data was pending
    Closed,
    /// The deadline passed while the channel was still open
    Deadline,
}

/// Bytes received from a child, kept per stream
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Transcript {
    /// Everything read from the duplex (stdout) channel
    pub stdout: Vec<u8>,
    /// Everything read from the stderr channel
    pub stderr: Vec<u8>,
}

impl Transcript {
    /// Create an empty transcript
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the bytes a receive call reported
    pub fn record(&mut self, status: RecvStatus, stdout_buf: &[u8], stderr_buf: &[u8]) {
        self.stdout
            .extend_from_slice(&stdout_buf[..status.stdout_len()]);
        self.stderr
            .extend_from_slice(&stderr_buf[..status.stderr_len()]);
    }

    /// Receive until the child's streams close or `deadline` passes
    pub fn collect<C>(channel: &C, deadline: Instant) -> Result<Self>
    where
        C: SubprocessChannel + ?Sized,
    {
        let mut transcript = Self::new();
        transcript.collect_into(channel, deadline)?;
        Ok(transcript)
    }

    /// Receive into this transcript until closure or `deadline`
    ///
    /// Once the channel reports closure, receiving continues while data is
    /// still arriving, so output on the other stream is not cut off. The
    /// deadline is only checked between receive calls: a channel configured
    /// to wait forever needs a `cancel_recv` to honour it promptly.
    pub fn collect_into<C>(&mut self, channel: &C, deadline: Instant) -> Result<CollectEnd>
    where
        C: SubprocessChannel + ?Sized,
    {
        let mut stdout_buf = [0u8; CHUNK_SIZE];
        let mut stderr_buf = [0u8; CHUNK_SIZE];
        loop {
            if Instant::now() >= deadline {
                debug!("Transcript of child {} hit its deadline", channel.pid());
                return Ok(CollectEnd::Deadline);
            }
            let status = channel.recv(&mut stdout_buf, &mut stderr_buf)?;
            self.record(status, &stdout_buf, &stderr_buf);
            if !channel.is_alive() && !status.has_data() {
                return Ok(CollectEnd::Closed);
            }
        }
    }

    /// Whether nothing has been recorded on either stream
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}
