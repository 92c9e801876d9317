//! Unified error types for sertee

use thiserror::Error;

/// Main error type for sertee operations
#[derive(Error, Debug)]
pub enum SerteeError {
    /// Missing or malformed command-line configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Opening the source character device failed
    #[error("failed to open source device '{path}': {source}")]
    SourceOpen {
        path: String,
        #[source]
        source: nix::Error,
    },

    /// Creating or registering with the readiness multiplexer failed
    #[error("multiplexer error: {0}")]
    Multiplexer(#[from] nix::Error),

    /// Registering a synthetic device with the CUSE framework failed
    #[error("failed to register device '{device}': {source}")]
    Registration {
        device: String,
        #[source]
        source: std::io::Error,
    },

    /// Catch-all I/O error not already covered above
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for sertee operations
pub type Result<T> = std::result::Result<T, SerteeError>;

impl SerteeError {
    /// The process exit code spec.md §6 assigns to this error.
    ///
    /// Source-open failures propagate the platform errno; everything else
    /// that aborts bootstrap before a device is registered is a plain
    /// nonzero configuration/registration failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            SerteeError::SourceOpen { source, .. } => *source as i32,
            _ => 1,
        }
    }
}
