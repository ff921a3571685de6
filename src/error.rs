//! WolfRepl Error Types

use thiserror::Error;

use crate::site::Eid;
use crate::wire::Lsn;

/// Result type alias for WolfRepl operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfRepl error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Site registry errors
    #[error("Site already exists: {0}")]
    SiteExists(String),

    #[error("Site not found: {0}")]
    SiteNotFound(String),

    // Send path errors
    #[error("Site unavailable: {0}")]
    Unavailable(String),

    #[error("Timed out waiting for outbound queue to drain")]
    Timeout,

    #[error("Durability not confirmed for LSN {lsn} within ack timeout")]
    PermTimeout { lsn: Lsn },

    // Network errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Address resolution failed for {0}")]
    Resolution(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Build an `Unavailable` error for a site
    pub fn unavailable(eid: Eid) -> Self {
        Error::Unavailable(format!("no ready connection to site {}", eid))
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout
                | Error::PermTimeout { .. }
                | Error::Unavailable(_)
                | Error::ConnectionFailed { .. }
                | Error::Resolution(_)
        )
    }
}
