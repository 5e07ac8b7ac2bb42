//! Tether CLI library
//!
//! Runs one child over a supervised channel: input chunks are forwarded to
//! the child's stdin, its stdout and stderr are relayed to two writers, and
//! an optional watchdog cancels the relay once a runtime limit passes.

pub mod error;

pub use error::{CliError, Result};

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tether_core::config::load_spawn_options_from_toml_path;
use tether_core::transcript::CHUNK_SIZE;
use tether_core::{ChannelAdapter, SpawnOptions, SubprocessChannel};
use tracing::{debug, info, warn};

/// Exit code when the watchdog stopped the run, as timeout(1) uses
pub const EXIT_TIMED_OUT: u8 = 124;

/// How often the input forwarder checks whether the run has ended
const INPUT_POLL: Duration = Duration::from_millis(50);

/// What the user asked to run, before it is turned into spawn options
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// TOML file with a `[process]` table
    pub config: Option<PathBuf>,
    /// Program followed by its arguments; overrides the config's program and args
    pub command: Vec<String>,
    /// Extra `NAME=VALUE` assignments, applied after the config's
    pub env: Vec<String>,
    /// Overrides the config's read timeout
    pub timeout_ms: Option<i32>,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The child's streams closed
    Closed,
    /// The runtime limit passed first
    TimedOut,
}

impl RunOutcome {
    /// Process exit code for this outcome
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Closed => 0,
            RunOutcome::TimedOut => EXIT_TIMED_OUT,
        }
    }
}

/// Merge a config file and command-line values into spawn options
pub fn build_options(request: &RunRequest) -> Result<SpawnOptions> {
    let mut opts = match (&request.config, request.command.first()) {
        (Some(path), _) => load_spawn_options_from_toml_path(path)?,
        (None, Some(program)) => SpawnOptions::new(program.clone()),
        (None, None) => {
            return Err(CliError::InvalidArgument(
                "no program given; pass a command or --config".to_string(),
            ))
        }
    };

    if let Some(program) = request.command.first() {
        opts.program = program.clone();
        opts.args = request.command.clone();
    }
    opts.env.extend(request.env.iter().cloned());
    if let Some(ms) = request.timeout_ms {
        opts.read_timeout_ms = ms;
    }
    opts.validate()?;
    Ok(opts)
}

/// Spawn the child and relay its streams until they close or `max_runtime` passes
///
/// `input`, when given, is forwarded chunk by chunk to the child's stdin
/// from a helper thread, and the child sees EOF once every sender is gone.
/// Without `input` the child's stdin is at EOF from the start. The channel
/// is always closed before returning.
pub fn run<O, E>(
    adapter: &dyn ChannelAdapter,
    opts: &SpawnOptions,
    input: Option<Receiver<Vec<u8>>>,
    max_runtime: Option<Duration>,
    stdout: &mut O,
    stderr: &mut E,
) -> Result<RunOutcome>
where
    O: Write,
    E: Write,
{
    let channel = adapter.spawn(opts)?;
    info!("Started '{}' as pid {}", opts.program, channel.pid());
    if input.is_none() {
        end_input(channel.as_ref());
    }

    let finished = AtomicBool::new(false);
    let timed_out = AtomicBool::new(false);
    let (stop_tx, stop_rx) = mpsc::channel::<()>();

    let outcome = {
        let channel: &dyn SubprocessChannel = channel.as_ref();
        let finished = &finished;
        let timed_out = &timed_out;
        thread::scope(|s| {
            if let Some(input) = input {
                s.spawn(move || forward_input(channel, input, finished));
            }
            if let Some(limit) = max_runtime {
                s.spawn(move || watchdog(channel, limit, stop_rx, timed_out));
            }

            let outcome = relay_output(channel, timed_out, stdout, stderr);
            finished.store(true, Ordering::Release);
            drop(stop_tx);
            outcome
        })
    };

    debug!("Run of '{}' ended: {:?}", opts.program, outcome);
    channel.close();
    outcome
}

fn relay_output<O: Write, E: Write>(
    channel: &dyn SubprocessChannel,
    timed_out: &AtomicBool,
    stdout: &mut O,
    stderr: &mut E,
) -> Result<RunOutcome> {
    let mut out_buf = [0u8; CHUNK_SIZE];
    let mut err_buf = [0u8; CHUNK_SIZE];
    loop {
        let status = channel.recv(&mut out_buf, &mut err_buf)?;
        if status.stdout_len() > 0 {
            stdout.write_all(&out_buf[..status.stdout_len()])?;
            stdout.flush()?;
        }
        if status.stderr_len() > 0 {
            stderr.write_all(&err_buf[..status.stderr_len()])?;
            stderr.flush()?;
        }
        if timed_out.load(Ordering::Acquire) {
            return Ok(RunOutcome::TimedOut);
        }
        if !channel.is_alive() && !status.has_data() {
            return Ok(RunOutcome::Closed);
        }
    }
}

fn forward_input(channel: &dyn SubprocessChannel, input: Receiver<Vec<u8>>, finished: &AtomicBool) {
    loop {
        match input.recv_timeout(INPUT_POLL) {
            Ok(chunk) => {
                if let Err(e) = channel.send_all(&chunk) {
                    debug!("Stopped forwarding input to pid {}: {}", channel.pid(), e);
                    return;
                }
            }
            Err(RecvTimeoutError::Timeout) if finished.load(Ordering::Acquire) => return,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                end_input(channel);
                return;
            }
        }
    }
}

fn end_input(channel: &dyn SubprocessChannel) {
    match channel.shutdown_send() {
        Ok(()) => debug!("Input to pid {} ended", channel.pid()),
        Err(e) => debug!("Could not end input to pid {}: {}", channel.pid(), e),
    }
}

fn watchdog(
    channel: &dyn SubprocessChannel,
    limit: Duration,
    stop: Receiver<()>,
    timed_out: &AtomicBool,
) {
    if let Err(RecvTimeoutError::Timeout) = stop.recv_timeout(limit) {
        warn!("pid {} still running after {:?}; stopping", channel.pid(), limit);
        // Flag first: a receive woken by the cancel must already see it.
        timed_out.store(true, Ordering::Release);
        channel.cancel_recv();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_options_from_command() {
        let request = RunRequest {
            command: vec!["cat".into(), "-u".into()],
            env: vec!["LC_ALL=C".into()],
            timeout_ms: Some(0),
            ..Default::default()
        };
        let opts = build_options(&request).unwrap();
        assert_eq!(opts.program, "cat");
        assert_eq!(opts.argv(), vec!["cat", "-u"]);
        assert_eq!(opts.env, vec!["LC_ALL=C".to_string()]);
        assert_eq!(opts.read_timeout_ms, 0);
    }

    #[test]
    fn test_build_options_requires_program() {
        let err = build_options(&RunRequest::default()).unwrap_err();
        assert_eq!(err.code(), "CLI002");
    }

    #[test]
    fn test_build_options_validates_env() {
        let request = RunRequest {
            command: vec!["cat".into()],
            env: vec!["BROKEN".into()],
            ..Default::default()
        };
        assert_eq!(build_options(&request).unwrap_err().code(), "CLI006");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunOutcome::Closed.exit_code(), 0);
        assert_eq!(RunOutcome::TimedOut.exit_code(), 124);
    }
}
