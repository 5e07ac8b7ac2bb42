//! Spawn options and their TOML configuration form
//!
//! A child is described by a [`SpawnOptions`] value, either built in code
//! with the builder methods or loaded from a TOML file with a `[process]`
//! table:
//!
//! ```toml
//! [process]
//! program = "cat"
//! args = ["cat", "-u"]
//! env = ["LC_ALL=C"]
//! read_timeout_ms = 500
//! ```
//!
//! Validation returns field-path error messages (`process.env[1]: ...`).

use crate::{CoreError, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default read-wait: block until data, closure, or cancellation
pub const DEFAULT_READ_TIMEOUT_MS: i32 = -1;

fn default_read_timeout_ms() -> i32 {
    DEFAULT_READ_TIMEOUT_MS
}

/// Everything needed to start one supervised child
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpawnOptions {
    /// Path (contains `/` or starts with `.`) or bare name looked up in `PATH`
    pub program: String,
    /// Full argument vector; `args[0]` is conventionally the program name.
    /// Empty means `[program]`.
    #[serde(default)]
    pub args: Vec<String>,
    /// `NAME=VALUE` assignments applied on top of the inherited environment
    #[serde(default)]
    pub env: Vec<String>,
    /// 0 polls, negative waits forever, positive bounds each receive in ms
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: i32,
}

impl SpawnOptions {
    /// Options for `program` with argv `[program]`, no extra environment,
    /// and an unbounded read wait
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
        }
    }

    /// Append one argument to argv
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments to argv
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add a `NAME=VALUE` environment assignment
    #[must_use]
    pub fn env(mut self, assignment: impl Into<String>) -> Self {
        self.env.push(assignment.into());
        self
    }

    /// Set the per-receive wait in milliseconds
    #[must_use]
    pub fn read_timeout_ms(mut self, ms: i32) -> Self {
        self.read_timeout_ms = ms;
        self
    }

    /// The argv the child will see
    pub fn argv(&self) -> Vec<&str> {
        if self.args.is_empty() {
            vec![self.program.as_str()]
        } else {
            self.args.iter().map(String::as_str).collect()
        }
    }

    /// The parsed wait policy
    pub fn wait_timeout(&self) -> WaitTimeout {
        WaitTimeout::from_millis(self.read_timeout_ms)
    }

    /// Check the options can be handed to exec
    pub fn validate(&self) -> Result<()> {
        if self.program.is_empty() {
            return Err(CoreError::ValidationError(
                "program: cannot be empty".to_string(),
            ));
        }
        if self.program.contains('\0') {
            return Err(CoreError::ValidationError(
                "program: contains a NUL byte".to_string(),
            ));
        }
        for (i, arg) in self.args.iter().enumerate() {
            if arg.contains('\0') {
                return Err(CoreError::ValidationError(format!(
                    "args[{}]: contains a NUL byte",
                    i
                )));
            }
        }
        for (i, assignment) in self.env.iter().enumerate() {
            if assignment.contains('\0') {
                return Err(CoreError::ValidationError(format!(
                    "env[{}]: contains a NUL byte",
                    i
                )));
            }
            match assignment.split_once('=') {
                Some((name, _)) if !name.is_empty() => {}
                Some(_) => {
                    return Err(CoreError::ValidationError(format!(
                        "env[{}]: variable name cannot be empty",
                        i
                    )))
                }
                None => {
                    return Err(CoreError::ValidationError(format!(
                        "env[{}]: expected NAME=VALUE, got '{}'",
                        i, assignment
                    )))
                }
            }
        }
        Ok(())
    }
}

/// How long a receive may wait for readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeout {
    /// Check readiness and return immediately
    Poll,
    /// Wait until something is readable or the wait is cancelled
    Forever,
    /// Wait at most this long
    Bounded(Duration),
}

impl WaitTimeout {
    /// Interpret the raw millisecond setting: 0 polls, negative waits forever
    pub fn from_millis(ms: i32) -> Self {
        match ms {
            0 => WaitTimeout::Poll,
            ms if ms < 0 => WaitTimeout::Forever,
            ms => WaitTimeout::Bounded(Duration::from_millis(ms.unsigned_abs().into())),
        }
    }
}

impl From<i32> for WaitTimeout {
    fn from(ms: i32) -> Self {
        WaitTimeout::from_millis(ms)
    }
}

/// Top-level TOML structure for a process configuration file
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessFile {
    /// The child to supervise
    pub process: SpawnOptions,
}

/// Load spawn options from a TOML file path
pub fn load_spawn_options_from_toml_path(path: impl AsRef<Path>) -> Result<SpawnOptions> {
    let data = fs::read_to_string(&path).map_err(|e| {
        CoreError::ConfigurationError(format!("Failed to read config {:?}: {}", path.as_ref(), e))
    })?;
    load_spawn_options_from_toml_str(&data)
}

/// Load spawn options from a TOML string
pub fn load_spawn_options_from_toml_str(input: &str) -> Result<SpawnOptions> {
    let file: ProcessFile = toml::from_str(input)
        .map_err(|e| CoreError::ConfigurationError(format!("TOML parse error: {}", e)))?;
    file.process
        .validate()
        .map_err(|e| match e {
            CoreError::ValidationError(msg) => {
                CoreError::ValidationError(format!("process.{}", msg))
            }
            other => other,
        })?;
    Ok(file.process)
}
