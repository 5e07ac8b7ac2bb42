//! Unix process channel built on socketpairs, fork/exec and poll(2)
//!
//! ## Descriptor layout
//!
//! Three `AF_UNIX`/`SOCK_STREAM` socketpairs are created per child:
//!
//! | pair   | parent keeps        | child gets            |
//! |--------|---------------------|-----------------------|
//! | duplex | read/write end      | fd 0 and fd 1         |
//! | error  | read end            | fd 2                  |
//! | wake   | both ends           | nothing (closed)      |
//!
//! Every descriptor is an [`OwnedFd`] from the moment it exists, so a spawn
//! that fails halfway releases whatever it already acquired on the way out.
//! All pairs are created with `SOCK_CLOEXEC`; the child's std streams are the
//! only channel descriptors that survive `execve`.
//!
//! ## Fork safety
//!
//! Everything the child needs (resolved path, argv and its `/bin/sh`
//! fallback, envp, failure note) is allocated before `fork()`. Between
//! `fork()` and `execve()` the child only calls `close`, `dup2`, `fcntl`,
//! `execve`, `write` and `_exit`, all of which are async-signal-safe, so
//! spawning from a multi-threaded program is sound.
//!
//! ## Liveness
//!
//! `is_alive` turns false the first time a receive reads end-of-stream on the
//! duplex or error socket. It is derived from stream closure, not from the
//! child's exit status: a child that closes its streams and keeps running is
//! reported dead, and one that exits is only reported dead once a receive
//! observes the closure.

// Allow unsafe code for this module since fork/exec requires raw libc calls
#![allow(unsafe_code)]

use crate::config::{SpawnOptions, WaitTimeout};
use crate::process::RecvStatus;
use crate::{CoreError, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{self as sock, AddressFamily, MsgFlags, Shutdown, SockFlag, SockType};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::ffi::{CString, OsStr, OsString};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace, warn};

/// Exit status of a child that could not redirect its streams or exec
/// (`EX_OSERR` from sysexits.h)
pub const EXIT_EXEC_FAILURE: i32 = 71;

/// Readiness bits that mean "a read will not block"
const READABLE: PollFlags = PollFlags::POLLIN
    .union(PollFlags::POLLHUP)
    .union(PollFlags::POLLERR);

/// Search path for bare program names when the child has no `PATH`
const DEFAULT_SEARCH_PATH: &str = "/bin:/usr/bin";

/// Interpreter for executables without a recognised binary format
const FALLBACK_SHELL: &str = "/bin/sh";

/// Wake markers drained per receive; more than this simply wakes the next one too
const WAKE_DRAIN_LEN: usize = 64;

/// A supervised child and the parent ends of its three socket channels
///
/// All operations except [`close`](Self::close) take `&self`: one thread may
/// block in [`recv`](Self::recv) while another calls [`send`](Self::send) and
/// a third calls [`cancel_recv`](Self::cancel_recv). Two concurrent `recv`
/// calls on the same channel are memory-safe but their results interleave
/// arbitrarily.
#[derive(Debug)]
pub struct ProcessChannel {
    pid: Pid,
    timeout: WaitTimeout,
    alive: AtomicBool,
    // Field order is teardown order: descriptors first, then the reap.
    endpoints: Endpoints,
    _reaper: ChildReaper,
}

/// Parent-side descriptors, released in declaration order
#[derive(Debug)]
struct Endpoints {
    wake_rd: OwnedFd,
    wake_wr: OwnedFd,
    err: OwnedFd,
    io: OwnedFd,
}

/// Collects the child's exit status on drop, without ever blocking
#[derive(Debug)]
struct ChildReaper {
    pid: Pid,
}

impl Drop for ChildReaper {
    fn drop(&mut self) {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                debug!("Child {} still running at close; not waiting for it", self.pid);
            }
            Ok(status) => debug!("Reaped child {}: {:?}", self.pid, status),
            Err(Errno::ECHILD) => debug!("Child {} was already reaped", self.pid),
            Err(e) => warn!("Failed to reap child {}: {}", self.pid, e),
        }
    }
}

/// Spawn `opts.program` with its std streams wired to a new [`ProcessChannel`]
///
/// A program path containing `/` or starting with `.` is executed as given;
/// a bare name is searched in `PATH` (taken from the child's environment, so
/// a `PATH=` assignment in `opts.env` is honoured, and `/bin:/usr/bin` when
/// it has none). A file that `execve` rejects with `ENOEXEC`, such as a
/// script without a `#!` line, is run through `/bin/sh` instead.
///
/// ## Errors
///
/// - [`CoreError::ValidationError`] for NUL bytes or malformed env entries
/// - [`CoreError::ChannelSetup`] if a socketpair cannot be created
/// - [`CoreError::ProcessSpawn`] if `fork` fails
///
/// The OS error code is preserved in both of the last two. A program that
/// cannot be executed is *not* an error here: the child exits with
/// [`EXIT_EXEC_FAILURE`] and the first receive observes its streams closing.
///
/// ## Panics
///
/// Panics if `opts.program` is empty.
///
/// ## Example
///
/// ```rust,no_run
/// use tether_core::config::SpawnOptions;
/// use tether_core::process::{spawn, RecvStatus};
///
/// let channel = spawn(&SpawnOptions::new("cat").read_timeout_ms(1000))?;
/// channel.send(b"ping")?;
///
/// let (mut out, mut err) = ([0u8; 64], [0u8; 64]);
/// if let RecvStatus::Data { stdout, .. } = channel.recv(&mut out, &mut err)? {
///     assert_eq!(&out[..stdout], b"ping");
/// }
/// channel.close();
/// # Ok::<(), tether_core::CoreError>(())
/// ```
pub fn spawn(opts: &SpawnOptions) -> Result<ProcessChannel> {
    assert!(!opts.program.is_empty(), "SpawnOptions::program must be set");
    opts.validate()?;

    let image = ExecImage::prepare(opts)?;
    let argv = nul_terminated(&image.argv);
    let envp = nul_terminated(&image.envp);
    let shell_argv = nul_terminated(&image.shell_argv);

    // Earlier pairs are dropped (closed) if a later one fails.
    let (io_parent, io_child) = channel_pair()?;
    let (err_parent, err_child) = channel_pair()?;
    let (wake_rd, wake_wr) = channel_pair()?;

    // SAFETY: the child branch only performs async-signal-safe calls on data
    // prepared above and never returns (it execs or `_exit`s).
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop((io_parent, err_parent, wake_rd, wake_wr));
            exec_child(
                &image,
                &argv,
                &shell_argv,
                &envp,
                io_child.as_raw_fd(),
                err_child.as_raw_fd(),
            )
        }
        Ok(ForkResult::Parent { child }) => {
            drop((io_child, err_child));
            debug!(
                "Spawned child {} running {:?} {:?}",
                child,
                image.path,
                opts.argv()
            );
            Ok(ProcessChannel {
                pid: child,
                timeout: opts.wait_timeout(),
                alive: AtomicBool::new(true),
                endpoints: Endpoints {
                    wake_rd,
                    wake_wr,
                    err: err_parent,
                    io: io_parent,
                },
                _reaper: ChildReaper { pid: child },
            })
        }
        Err(errno) => {
            warn!("Failed to fork for '{}': {}", opts.program, errno);
            Err(CoreError::ProcessSpawn(errno.into()))
        }
    }
}

impl ProcessChannel {
    /// The child's process id
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// The wait policy captured at spawn time
    pub fn wait_timeout(&self) -> WaitTimeout {
        self.timeout
    }

    /// Write bytes to the child's stdin
    ///
    /// Returns how many bytes the socket accepted, which may be fewer than
    /// `buf.len()`. Interrupted writes are retried. Writing after the child
    /// closed its end fails with `EPIPE` instead of raising SIGPIPE.
    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        retry_eintr(|| sock::send(self.endpoints.io.as_raw_fd(), buf, MsgFlags::MSG_NOSIGNAL))
            .map_err(CoreError::from)
    }

    /// Signal end-of-input on the child's stdin
    ///
    /// Half-closes the duplex socket: the child reads EOF once it has
    /// consumed what was already sent, while its stdout direction stays
    /// open. Later sends fail with `EPIPE`.
    pub fn shutdown_send(&self) -> Result<()> {
        sock::shutdown(self.endpoints.io.as_raw_fd(), Shutdown::Write)?;
        debug!("Shut down input of child {}", self.pid);
        Ok(())
    }

    /// Wait for output on stdout or stderr, or for a cancellation
    ///
    /// Each readable stream gets exactly one non-blocking read into its
    /// buffer. A read of zero bytes marks the channel dead and is not an
    /// error. The result is [`RecvStatus::Data`] if anything was copied;
    /// otherwise a read failure is returned as `Err`, and in every remaining
    /// case (timeout, cancellation, closure only) [`RecvStatus::NoData`].
    ///
    /// An empty buffer is never read from, since a zero-length read would be
    /// indistinguishable from the stream closing.
    pub fn recv(&self, stdout_buf: &mut [u8], stderr_buf: &mut [u8]) -> Result<RecvStatus> {
        let [io_ready, err_ready, wake_ready] = self.wait_readable()?;
        trace!(
            "Child {} readiness: stdout={} stderr={} wake={}",
            self.pid,
            io_ready,
            err_ready,
            wake_ready
        );

        let mut failure = None;
        let stdout = if io_ready {
            self.read_stream(&self.endpoints.io, stdout_buf, &mut failure)
        } else {
            0
        };
        let stderr = if err_ready {
            self.read_stream(&self.endpoints.err, stderr_buf, &mut failure)
        } else {
            0
        };
        if wake_ready {
            self.drain_wake();
        }

        match (RecvStatus::from_sizes(stdout, stderr), failure) {
            (RecvStatus::NoData, Some(errno)) => Err(CoreError::from(errno)),
            (status, _) => Ok(status),
        }
    }

    /// Make a pending (or the next) [`recv`](Self::recv) return promptly
    ///
    /// Writes one marker byte to the private wake socket. Several cancels
    /// before the next receive may be absorbed by a single wake-up.
    pub fn cancel_recv(&self) {
        let flags = MsgFlags::MSG_NOSIGNAL | MsgFlags::MSG_DONTWAIT;
        match retry_eintr(|| sock::send(self.endpoints.wake_wr.as_raw_fd(), &[1], flags)) {
            Ok(_) => trace!("Woke receiver of child {}", self.pid),
            // A full wake buffer already guarantees the next wait returns.
            Err(Errno::EAGAIN) => trace!("Wake channel of child {} already full", self.pid),
            Err(e) => warn!("Failed to wake receiver of child {}: {}", self.pid, e),
        }
    }

    /// Whether neither stream has been observed closing yet
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Release every descriptor and reap the child if it has already exited
    ///
    /// Never waits for a running child. A child that exits later is left for
    /// the caller's own reaping (or becomes a zombie until this process exits).
    pub fn close(self) {
        debug!(
            "Closing channel to child {} (alive={})",
            self.pid,
            self.is_alive()
        );
        drop(self);
    }

    fn wait_readable(&self) -> Result<[bool; 3]> {
        let timeout = poll_timeout(self.timeout);
        loop {
            let mut fds = [
                PollFd::new(self.endpoints.io.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.endpoints.err.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.endpoints.wake_rd.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok([false; 3]),
                Ok(_) => {
                    return Ok(fds.map(|fd| fd.revents().is_some_and(|r| r.intersects(READABLE))))
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(CoreError::from(e)),
            }
        }
    }

    fn read_stream(&self, fd: &OwnedFd, buf: &mut [u8], failure: &mut Option<Errno>) -> usize {
        if buf.is_empty() {
            return 0;
        }
        match retry_eintr(|| sock::recv(fd.as_raw_fd(), buf, MsgFlags::MSG_DONTWAIT)) {
            Ok(0) => {
                self.mark_closed();
                0
            }
            Ok(len) => len,
            Err(Errno::EAGAIN) => 0,
            Err(e) => {
                debug!("Read from child {} failed: {}", self.pid, e);
                *failure = Some(e);
                0
            }
        }
    }

    fn drain_wake(&self) {
        let mut discard = [0u8; WAKE_DRAIN_LEN];
        let drained = retry_eintr(|| {
            sock::recv(
                self.endpoints.wake_rd.as_raw_fd(),
                &mut discard,
                MsgFlags::MSG_DONTWAIT,
            )
        });
        trace!("Drained wake channel of child {}: {:?}", self.pid, drained);
    }

    fn mark_closed(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            debug!("Child {} closed its streams", self.pid);
        }
    }
}

fn poll_timeout(timeout: WaitTimeout) -> PollTimeout {
    match timeout {
        WaitTimeout::Poll => PollTimeout::ZERO,
        WaitTimeout::Forever => PollTimeout::NONE,
        WaitTimeout::Bounded(d) => {
            let ms = i32::try_from(d.as_millis()).unwrap_or(i32::MAX);
            PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
        }
    }
}

fn channel_pair() -> Result<(OwnedFd, OwnedFd)> {
    sock::socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(|errno| {
        warn!("Failed to create channel socketpair: {}", errno);
        CoreError::ChannelSetup(errno.into())
    })
}

fn retry_eintr<T>(mut op: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match op() {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// Everything `execve` needs, allocated before forking
#[derive(Debug)]
struct ExecImage {
    path: CString,
    argv: Vec<CString>,
    /// `sh <path> <args[1..]>`, tried when the image is not executable
    shell_argv: Vec<CString>,
    envp: Vec<CString>,
    failure_note: Vec<u8>,
}

impl ExecImage {
    fn prepare(opts: &SpawnOptions) -> Result<Self> {
        let env = merged_environment(&opts.env);
        let path = resolve_program(&opts.program, &env);

        let argv = opts
            .argv()
            .into_iter()
            .map(|arg| c_string(arg.as_bytes().to_vec(), "args"))
            .collect::<Result<Vec<_>>>()?;
        let path = c_string(path.into_os_string().into_vec(), "program")?;
        let shell_argv = [c_string(FALLBACK_SHELL.into(), "program")?, path.clone()]
            .into_iter()
            .chain(argv.iter().skip(1).cloned())
            .collect();
        let envp = env
            .into_iter()
            .map(|(name, value)| {
                let mut entry = name.into_vec();
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                c_string(entry, "env")
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            path,
            argv,
            shell_argv,
            envp,
            failure_note: format!("tether: cannot execute '{}'\n", opts.program).into_bytes(),
        })
    }
}

fn c_string(bytes: Vec<u8>, field: &str) -> Result<CString> {
    CString::new(bytes)
        .map_err(|_| CoreError::ValidationError(format!("{}: contains a NUL byte", field)))
}

fn nul_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// The inherited environment with `NAME=VALUE` assignments applied on top
fn merged_environment(assignments: &[String]) -> Vec<(OsString, OsString)> {
    let mut env: Vec<(OsString, OsString)> = std::env::vars_os().collect();
    for (name, value) in assignments.iter().filter_map(|a| a.split_once('=')) {
        env.retain(|(key, _)| key.as_os_str() != OsStr::new(name));
        env.push((name.into(), value.into()));
    }
    env
}

/// Direct path, or the first executable match in the child's `PATH`
///
/// An unmatched bare name is returned unchanged; exec then fails in the child.
fn resolve_program(program: &str, env: &[(OsString, OsString)]) -> PathBuf {
    if program.contains('/') || program.starts_with('.') {
        return PathBuf::from(program);
    }
    let search_path = env
        .iter()
        .find(|(key, _)| key.as_os_str() == OsStr::new("PATH"))
        .map_or(OsStr::new(DEFAULT_SEARCH_PATH), |(_, paths)| paths.as_os_str());
    std::env::split_paths(search_path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .unwrap_or_else(|| PathBuf::from(program))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Child side of the fork: wire up std streams and replace the image
fn exec_child(
    image: &ExecImage,
    argv: &[*const libc::c_char],
    shell_argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
    io_fd: RawFd,
    err_fd: RawFd,
) -> ! {
    if redirect(io_fd, libc::STDIN_FILENO)
        && redirect(io_fd, libc::STDOUT_FILENO)
        && redirect(err_fd, libc::STDERR_FILENO)
    {
        // SAFETY: all arrays are NUL-terminated and outlive the calls.
        unsafe {
            libc::execve(image.path.as_ptr(), argv.as_ptr(), envp.as_ptr());
            if Errno::last() == Errno::ENOEXEC {
                libc::execve(shell_argv[0], shell_argv.as_ptr(), envp.as_ptr());
            }
        }
    }
    // SAFETY: write(2) and _exit(2) are async-signal-safe; the note was
    // allocated before fork.
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            image.failure_note.as_ptr().cast(),
            image.failure_note.len(),
        );
        libc::_exit(EXIT_EXEC_FAILURE)
    }
}

/// Make `target` refer to `fd` with close-on-exec cleared
fn redirect(fd: RawFd, target: RawFd) -> bool {
    loop {
        // SAFETY: plain descriptor syscalls on integers we own in the child.
        let res = unsafe {
            if fd == target {
                libc::fcntl(fd, libc::F_SETFD, 0)
            } else {
                libc::dup2(fd, target)
            }
        };
        if res != -1 {
            return true;
        }
        if Errno::last() != Errno::EINTR {
            return false;
        }
    }
}
