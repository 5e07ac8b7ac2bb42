//! Core error types and utilities

use thiserror::Error;

/// Core-specific error types
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Initialization error: {0}")]
    InitializationError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// A socketpair for one of the child's channels could not be created
    #[error("Channel setup failed: {0}")]
    ChannelSetup(#[source] std::io::Error),

    /// The child process could not be created
    #[error("Process spawn failed: {0}")]
    ProcessSpawn(#[source] std::io::Error),
}

impl CoreError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::ConfigurationError(_) => "CORE001",
            CoreError::ValidationError(_) => "CORE002",
            CoreError::InitializationError(_) => "CORE003",
            CoreError::IoError(_) => "CORE005",
            CoreError::ChannelSetup(_) => "CORE010",
            CoreError::ProcessSpawn(_) => "CORE011",
        }
    }

    /// The OS error number behind this error, if it came from a syscall
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            CoreError::IoError(e) | CoreError::ChannelSetup(e) | CoreError::ProcessSpawn(e) => {
                e.raw_os_error()
            }
            _ => None,
        }
    }
}

#[cfg(unix)]
impl From<nix::Error> for CoreError {
    fn from(errno: nix::Error) -> Self {
        CoreError::IoError(errno.into())
    }
}

/// Core-specific result type
pub type Result<T> = std::result::Result<T, CoreError>;
