//! Integration tests for the `run` relay loop
//!
//! Most tests drive `run` through scripted mock channels; the Linux-only
//! ones relay real programs through the Unix adapter.

#![allow(unused_crate_dependencies)]

use cli::{build_options, run, RunOutcome, RunRequest};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_core::adapters::{MockChannel, MockChannelAdapter, MockEvent};
use tether_core::SpawnOptions;

fn relay(
    adapter: &dyn tether_core::ChannelAdapter,
    opts: &SpawnOptions,
    input: Option<mpsc::Receiver<Vec<u8>>>,
    max_runtime: Option<Duration>,
) -> (cli::Result<RunOutcome>, Vec<u8>, Vec<u8>) {
    let (mut out, mut err) = (Vec::new(), Vec::new());
    let outcome = run(adapter, opts, input, max_runtime, &mut out, &mut err);
    (outcome, out, err)
}

#[test]
fn test_scripted_run_relays_streams_separately() {
    let adapter = MockChannelAdapter::new();
    let closed = Arc::new(AtomicBool::new(false));
    adapter.push_channel(
        MockChannel::scripted([
            MockEvent::Stdout(b"hello ".to_vec()),
            MockEvent::Stderr(b"warning: ".to_vec()),
            MockEvent::Idle,
            MockEvent::Stdout(b"world".to_vec()),
            MockEvent::Stderr(b"careful".to_vec()),
        ])
        .with_close_flag(closed.clone()),
    );
    let opts = SpawnOptions::new("greeter").arg("greeter").arg("--loud");

    let (outcome, out, err) = relay(&adapter, &opts, None, None);
    assert_eq!(outcome.unwrap(), RunOutcome::Closed);
    assert_eq!(out, b"hello world".to_vec());
    assert_eq!(err, b"warning: careful".to_vec());
    assert!(closed.load(Ordering::Acquire), "channel was not closed");
    assert_eq!(adapter.spawned(), vec![opts]);
}

#[test]
fn test_watchdog_stops_open_channel() {
    let adapter = MockChannelAdapter::new();
    let closed = Arc::new(AtomicBool::new(false));
    adapter.push_channel(MockChannel::echo().with_close_flag(closed.clone()));

    let (tx, rx) = mpsc::channel();
    tx.send(b"ping ".to_vec()).unwrap();
    tx.send(b"pong".to_vec()).unwrap();

    let started = Instant::now();
    let (outcome, out, err) = relay(
        &adapter,
        &SpawnOptions::new("cat"),
        Some(rx),
        Some(Duration::from_millis(200)),
    );
    assert_eq!(outcome.unwrap(), RunOutcome::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(out, b"ping pong".to_vec());
    assert!(err.is_empty());
    assert!(closed.load(Ordering::Acquire));
    drop(tx);
}

#[test]
fn test_finite_input_ends_run_with_closure() {
    let adapter = MockChannelAdapter::new();
    adapter.push_channel(MockChannel::echo());

    let (tx, rx) = mpsc::channel();
    tx.send(b"only line\n".to_vec()).unwrap();
    drop(tx);

    let (outcome, out, _) = relay(
        &adapter,
        &SpawnOptions::new("cat"),
        Some(rx),
        Some(Duration::from_secs(10)),
    );
    assert_eq!(outcome.unwrap(), RunOutcome::Closed);
    assert_eq!(out, b"only line\n".to_vec());
}

#[test]
fn test_read_failure_is_reported_and_channel_closed() {
    let adapter = MockChannelAdapter::new();
    let closed = Arc::new(AtomicBool::new(false));
    adapter.push_channel(
        MockChannel::scripted([
            MockEvent::Stdout(b"partial".to_vec()),
            MockEvent::Fail(std::io::ErrorKind::ConnectionReset),
        ])
        .with_close_flag(closed.clone()),
    );

    let (outcome, out, _) = relay(&adapter, &SpawnOptions::new("flaky"), None, None);
    assert_eq!(outcome.unwrap_err().code(), "CLI006");
    assert_eq!(out, b"partial".to_vec());
    assert!(closed.load(Ordering::Acquire));
}

#[test]
fn test_spawn_failure_is_a_core_error() {
    let adapter = MockChannelAdapter::new();
    let (outcome, out, err) = relay(&adapter, &SpawnOptions::new("nothing-queued"), None, None);
    let e = outcome.unwrap_err();
    assert_eq!(e.code(), "CLI006");
    assert!(e.to_string().contains("nothing-queued"), "{}", e);
    assert!(out.is_empty() && err.is_empty());
}

#[test]
fn test_build_options_merges_config_and_overrides() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[process]
program = "/bin/sh"
args = ["sh", "-c", "true"]
env = ["FROM_FILE=1"]
read_timeout_ms = 250
"#
    )
    .unwrap();

    let from_file = build_options(&RunRequest {
        config: Some(file.path().to_path_buf()),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(from_file.argv(), vec!["sh", "-c", "true"]);
    assert_eq!(from_file.read_timeout_ms, 250);

    let overridden = build_options(&RunRequest {
        config: Some(file.path().to_path_buf()),
        command: vec!["env".into()],
        env: vec!["FROM_FLAG=2".into()],
        timeout_ms: Some(-1),
    })
    .unwrap();
    assert_eq!(overridden.program, "env");
    assert_eq!(overridden.argv(), vec!["env"]);
    assert_eq!(overridden.env, vec!["FROM_FILE=1".to_string(), "FROM_FLAG=2".to_string()]);
    assert_eq!(overridden.read_timeout_ms, -1);
}

#[test]
fn test_build_options_reports_bad_config() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[process]\nprogram = \"cat\"\nenv = [\"NO_EQUALS\"]").unwrap();

    let err = build_options(&RunRequest {
        config: Some(file.path().to_path_buf()),
        ..Default::default()
    })
    .unwrap_err();
    assert_eq!(err.code(), "CLI006");
    assert!(err.to_string().contains("process.env[0]"), "{}", err);
}

#[cfg(target_os = "linux")]
mod real_processes {
    use super::*;
    use tether_core::adapters::UnixChannelAdapter;

    #[test]
    fn test_run_shell_until_streams_close() {
        let opts = SpawnOptions::new("/bin/sh").args(["sh", "-c", "echo hi; echo oops >&2"]);
        let (outcome, out, err) = relay(&UnixChannelAdapter::new(), &opts, None, None);
        assert_eq!(outcome.unwrap(), RunOutcome::Closed);
        assert_eq!(out, b"hi\n".to_vec());
        assert_eq!(err, b"oops\n".to_vec());
    }

    #[test]
    fn test_run_cat_until_input_ends() {
        let (tx, rx) = mpsc::channel();
        tx.send(b"hello\n".to_vec()).unwrap();
        tx.send(b"world\n".to_vec()).unwrap();
        drop(tx);

        let started = Instant::now();
        let (outcome, out, err) = relay(
            &UnixChannelAdapter::new(),
            &SpawnOptions::new("cat"),
            Some(rx),
            Some(Duration::from_secs(10)),
        );
        assert_eq!(outcome.unwrap(), RunOutcome::Closed);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(out, b"hello\nworld\n".to_vec());
        assert!(err.is_empty());
    }

    #[test]
    fn test_run_without_input_gives_child_eof() {
        let (outcome, out, _) = relay(
            &UnixChannelAdapter::new(),
            &SpawnOptions::new("cat"),
            None,
            Some(Duration::from_secs(10)),
        );
        assert_eq!(outcome.unwrap(), RunOutcome::Closed);
        assert!(out.is_empty());
    }

    #[test]
    fn test_run_cat_with_input_until_watchdog() {
        let (tx, rx) = mpsc::channel();
        tx.send(b"line one\n".to_vec()).unwrap();
        tx.send(b"line two\n".to_vec()).unwrap();

        let (outcome, out, err) = relay(
            &UnixChannelAdapter::new(),
            &SpawnOptions::new("cat"),
            Some(rx),
            Some(Duration::from_millis(500)),
        );
        assert_eq!(outcome.unwrap(), RunOutcome::TimedOut);
        assert_eq!(out, b"line one\nline two\n".to_vec());
        assert!(err.is_empty());
        drop(tx);
    }
}
