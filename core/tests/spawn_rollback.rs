//! A spawn that fails midway must not leak the descriptors it already made
//!
//! Kept in its own test binary: it lowers `RLIMIT_NOFILE` for the whole
//! process and compares the descriptor table before and after.

#![cfg(target_os = "linux")]
#![allow(unused_crate_dependencies)]

use nix::sys::resource::{getrlimit, setrlimit, Resource};
use std::collections::BTreeSet;
use tether_core::{spawn, SpawnOptions};

fn open_fds() -> BTreeSet<i32> {
    std::fs::read_dir("/proc/self/fd")
        .expect("read /proc/self/fd")
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
        .collect()
}

/// Smallest descriptor limit that leaves exactly `free` unused slots below it
fn limit_with_free_slots(open: &BTreeSet<i32>, free: u64) -> u64 {
    (0u64..)
        .find(|&limit| {
            let used = open.iter().filter(|&&fd| (fd as u64) < limit).count() as u64;
            limit - used >= free
        })
        .expect("some limit leaves free slots")
}

#[test]
fn test_channel_setup_failure_releases_partial_pairs() {
    let before = open_fds();
    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).expect("getrlimit");

    // Room for the first socketpair but not for all three.
    let limit = limit_with_free_slots(&before, 3);
    setrlimit(Resource::RLIMIT_NOFILE, limit, hard).expect("lower RLIMIT_NOFILE");
    let result = spawn(&SpawnOptions::new("/bin/true"));
    setrlimit(Resource::RLIMIT_NOFILE, soft, hard).expect("restore RLIMIT_NOFILE");

    let err = match result {
        Ok(channel) => {
            channel.close();
            panic!("spawn should fail with only three descriptors free");
        }
        Err(e) => e,
    };
    assert_eq!(err.code(), "CORE010");
    assert_eq!(err.raw_os_error(), Some(libc::EMFILE));
    assert_eq!(open_fds(), before);
}
