//! Core functionality for the Tether project
//!
//! This crate supervises a single child process through a synchronous,
//! poll-driven socket interface: one duplex channel bound to the child's
//! stdin and stdout, one channel for its stderr, and a private wake channel
//! that lets another thread interrupt a blocked receive.

pub mod adapters;
pub mod config;
pub mod error;
pub mod process;
pub mod transcript;


pub use adapters::{ChannelAdapter, SubprocessChannel};
pub use config::{SpawnOptions, WaitTimeout};
pub use error::{CoreError, Result};
pub use process::RecvStatus;
#[cfg(any(target_os = "linux", target_os = "freebsd"))]
pub use process::{spawn, ProcessChannel};
pub use transcript::Transcript;

/// Core utilities and helper functions
pub mod utils {
    use tracing::debug;

    /// Initialize tracing for the application
    ///
    /// `RUST_LOG` takes precedence over `level`. Output goes to stderr so it
    /// never mixes with relayed child stdout.
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| crate::CoreError::InitializationError(e.to_string()))?;

        debug!("Tracing initialized with level: {}", level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_only_once() {
        // The first install wins; any later one reports an initialization error.
        let _ = utils::init_tracing("debug");
        let second = utils::init_tracing("debug");
        assert_eq!(second.unwrap_err().code(), "CORE003");
    }
}
