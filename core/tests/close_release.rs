//! Close must release every descriptor without waiting on the child
//!
//! Kept in its own test binary: it compares the process-wide descriptor
//! table before and after, so no other test may spawn concurrently.

#![cfg(target_os = "linux")]
#![allow(unused_crate_dependencies)]

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tether_core::{spawn, SpawnOptions};

fn open_fds() -> BTreeSet<i32> {
    std::fs::read_dir("/proc/self/fd")
        .expect("read /proc/self/fd")
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
        .collect()
}

#[test]
fn test_close_is_prompt_and_releases_descriptors() {
    let baseline = open_fds();

    // A child that is still running: close must not wait for it.
    let channel = spawn(&SpawnOptions::new("sleep").arg("sleep").arg("30"))
        .expect("Failed to spawn sleep");
    let pid = Pid::from_raw(channel.pid() as i32);
    assert_eq!(
        open_fds().len(),
        baseline.len() + 4,
        "duplex, stderr and both wake ends should be open"
    );

    let started = Instant::now();
    channel.close();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(open_fds(), baseline);

    // Clean up the orphaned sleep ourselves.
    kill(pid, Signal::SIGKILL).expect("kill sleep");
    waitpid(pid, None).expect("reap sleep");

    // A child that has exited: close reaps it, leaving no zombie behind.
    let channel =
        spawn(&SpawnOptions::new("true").read_timeout_ms(1000)).expect("Failed to spawn true");
    let pid = Pid::from_raw(channel.pid() as i32);
    let (mut out, mut err) = ([0u8; 16], [0u8; 16]);
    let deadline = Instant::now() + Duration::from_secs(5);
    while channel.is_alive() && Instant::now() < deadline {
        channel.recv(&mut out, &mut err).expect("recv");
    }
    assert!(!channel.is_alive());
    // Stream closure precedes exit by a hair; give the child time to finish.
    std::thread::sleep(Duration::from_millis(200));

    channel.close();
    assert_eq!(waitpid(pid, Some(WaitPidFlag::WNOHANG)), Err(Errno::ECHILD));
    assert_eq!(open_fds(), baseline);
}
