//! Channel adapters for abstracting the supervised child
//!
//! This module provides traits and implementations for abstracting the
//! process channel, enabling higher-level consumers (the transcript
//! collector, the CLI) to be tested with scripted mock channels instead of
//! forking real programs.

use crate::config::SpawnOptions;
use crate::process::RecvStatus;
use crate::{CoreError, Result};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Trait for starting supervised children
pub trait ChannelAdapter: Send + Sync {
    /// Spawn a child according to the options
    fn spawn(&self, opts: &SpawnOptions) -> Result<Box<dyn SubprocessChannel>>;
}

/// The capability set of a supervised child's channel
pub trait SubprocessChannel: Send + Sync {
    /// Get the process ID
    fn pid(&self) -> u32;

    /// Write to the child's stdin; returns the number of bytes accepted
    fn send(&self, buf: &[u8]) -> Result<usize>;

    /// Signal end-of-input on the child's stdin, keeping its output open
    fn shutdown_send(&self) -> Result<()>;

    /// Wait for output on the child's stdout/stderr or a cancellation
    fn recv(&self, stdout_buf: &mut [u8], stderr_buf: &mut [u8]) -> Result<RecvStatus>;

    /// Wake a pending (or the next) `recv`
    fn cancel_recv(&self);

    /// Whether neither stream has been observed closing
    fn is_alive(&self) -> bool;

    /// Release the channel and reap the child if it already exited
    fn close(self: Box<Self>);

    /// Write the whole buffer, looping over partial sends
    fn send_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.send(buf)? {
                0 => {
                    return Err(CoreError::IoError(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "child accepted no bytes",
                    )))
                }
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }
}

/// Adapter that forks real programs
#[cfg(any(target_os = "linux", target_os = "freebsd"))]
#[derive(Copy, Clone, Debug, Default)]
pub struct UnixChannelAdapter;

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
impl UnixChannelAdapter {
    /// Create a new Unix channel adapter
    pub fn new() -> Self {
        Self
    }
}

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
impl ChannelAdapter for UnixChannelAdapter {
    fn spawn(&self, opts: &SpawnOptions) -> Result<Box<dyn SubprocessChannel>> {
        debug!("Spawning Unix channel: {} {:?}", opts.program, opts.argv());
        let channel = crate::process::unix::spawn(opts)?;
        Ok(Box::new(channel))
    }
}

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
impl SubprocessChannel for crate::process::unix::ProcessChannel {
    fn pid(&self) -> u32 {
        crate::process::unix::ProcessChannel::pid(self)
    }

    fn send(&self, buf: &[u8]) -> Result<usize> {
        crate::process::unix::ProcessChannel::send(self, buf)
    }

    fn shutdown_send(&self) -> Result<()> {
        crate::process::unix::ProcessChannel::shutdown_send(self)
    }

    fn recv(&self, stdout_buf: &mut [u8], stderr_buf: &mut [u8]) -> Result<RecvStatus> {
        crate::process::unix::ProcessChannel::recv(self, stdout_buf, stderr_buf)
    }

    fn cancel_recv(&self) {
        crate::process::unix::ProcessChannel::cancel_recv(self);
    }

    fn is_alive(&self) -> bool {
        crate::process::unix::ProcessChannel::is_alive(self)
    }

    fn close(self: Box<Self>) {
        crate::process::unix::ProcessChannel::close(*self);
    }
}

/// One scripted step of a [`MockChannel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    /// Bytes the child writes to stdout
    Stdout(Vec<u8>),
    /// Bytes the child writes to stderr
    Stderr(Vec<u8>),
    /// A receive that times out with nothing ready
    Idle,
    /// A receive whose read fails
    Fail(io::ErrorKind),
}

/// Scripted in-memory channel for testing consumers without forking
///
/// Each `recv` consumes one scripted event (chunks larger than the caller's
/// buffer are split across calls). Once the script is exhausted the channel
/// reports orderly closure. In echo mode every sent byte is queued back as
/// stdout, like `cat`, and the channel only closes after `finish` (or
/// `shutdown_send`, which is EOF to `cat`) is called.
#[derive(Debug)]
pub struct MockChannel {
    pid: u32,
    echo: bool,
    script: Mutex<VecDeque<MockEvent>>,
    sent: Mutex<Vec<u8>>,
    finished: AtomicBool,
    input_closed: AtomicBool,
    alive: AtomicBool,
    cancelled: AtomicBool,
    closed: Option<std::sync::Arc<AtomicBool>>,
}

impl MockChannel {
    /// Channel that replays `script` and then closes
    pub fn scripted(events: impl IntoIterator<Item = MockEvent>) -> Self {
        Self::build(false, events.into_iter().collect(), true)
    }

    /// Channel that echoes whatever is sent to it
    pub fn echo() -> Self {
        Self::build(true, VecDeque::new(), false)
    }

    fn build(echo: bool, script: VecDeque<MockEvent>, finished: bool) -> Self {
        Self {
            pid: next_mock_pid(),
            echo,
            script: Mutex::new(script),
            sent: Mutex::new(Vec::new()),
            finished: AtomicBool::new(finished),
            input_closed: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            cancelled: AtomicBool::new(false),
            closed: None,
        }
    }

    /// Set a flag when this channel is closed
    #[must_use]
    pub fn with_close_flag(mut self, flag: std::sync::Arc<AtomicBool>) -> Self {
        self.closed = Some(flag);
        self
    }

    /// Queue another event
    pub fn push(&self, event: MockEvent) {
        lock(&self.script).push_back(event);
    }

    /// Let an echo channel close once its queued output is drained
    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }

    /// Whether `shutdown_send` was called
    pub fn input_closed(&self) -> bool {
        self.input_closed.load(Ordering::Acquire)
    }

    /// Everything sent to the channel so far
    pub fn sent(&self) -> Vec<u8> {
        lock(&self.sent).clone()
    }
}

impl SubprocessChannel for MockChannel {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn send(&self, buf: &[u8]) -> Result<usize> {
        if !self.is_alive() || self.input_closed() {
            return Err(CoreError::IoError(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        lock(&self.sent).extend_from_slice(buf);
        if self.echo && !buf.is_empty() {
            self.push(MockEvent::Stdout(buf.to_vec()));
        }
        Ok(buf.len())
    }

    fn shutdown_send(&self) -> Result<()> {
        self.input_closed.store(true, Ordering::Release);
        if self.echo {
            self.finish();
        }
        Ok(())
    }

    fn recv(&self, stdout_buf: &mut [u8], stderr_buf: &mut [u8]) -> Result<RecvStatus> {
        if self.cancelled.swap(false, Ordering::AcqRel) {
            return Ok(RecvStatus::NoData);
        }
        let mut script = lock(&self.script);
        let Some(event) = script.pop_front() else {
            if self.finished.load(Ordering::Acquire) {
                self.alive.store(false, Ordering::Release);
            }
            return Ok(RecvStatus::NoData);
        };
        match event {
            MockEvent::Stdout(bytes) => {
                let len = copy_chunk(&bytes, stdout_buf);
                if len < bytes.len() {
                    script.push_front(MockEvent::Stdout(bytes[len..].to_vec()));
                }
                Ok(RecvStatus::from_sizes(len, 0))
            }
            MockEvent::Stderr(bytes) => {
                let len = copy_chunk(&bytes, stderr_buf);
                if len < bytes.len() {
                    script.push_front(MockEvent::Stderr(bytes[len..].to_vec()));
                }
                Ok(RecvStatus::from_sizes(0, len))
            }
            MockEvent::Idle => Ok(RecvStatus::NoData),
            MockEvent::Fail(kind) => Err(CoreError::IoError(io::Error::from(kind))),
        }
    }

    fn cancel_recv(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn close(self: Box<Self>) {
        if let Some(flag) = &self.closed {
            flag.store(true, Ordering::Release);
        }
    }
}

/// Adapter that hands out pre-built mock channels and records spawn requests
#[derive(Debug, Default)]
pub struct MockChannelAdapter {
    channels: Mutex<VecDeque<MockChannel>>,
    spawned: Mutex<Vec<SpawnOptions>>,
}

impl MockChannelAdapter {
    /// Create an adapter with no channels queued
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the channel returned by the next `spawn`
    pub fn push_channel(&self, channel: MockChannel) {
        lock(&self.channels).push_back(channel);
    }

    /// Options passed to every `spawn` call so far
    pub fn spawned(&self) -> Vec<SpawnOptions> {
        lock(&self.spawned).clone()
    }
}

impl ChannelAdapter for MockChannelAdapter {
    fn spawn(&self, opts: &SpawnOptions) -> Result<Box<dyn SubprocessChannel>> {
        opts.validate()?;
        lock(&self.spawned).push(opts.clone());
        let channel = lock(&self.channels).pop_front().ok_or_else(|| {
            CoreError::ProcessSpawn(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no mock channel queued for '{}'", opts.program),
            ))
        })?;
        debug!("Handing out mock channel {} for {}", channel.pid, opts.program);
        Ok(Box::new(channel))
    }
}

fn copy_chunk(src: &[u8], dst: &mut [u8]) -> usize {
    let len = src.len().min(dst.len());
    dst[..len].copy_from_slice(&src[..len]);
    len
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn next_mock_pid() -> u32 {
    static NEXT: AtomicU32 = AtomicU32::new(90_000);
    NEXT.fetch_add(1, Ordering::Relaxed)
}
