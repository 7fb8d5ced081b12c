//! Custom error types for the application.
//!
//! This module defines the primary error type, `PispecError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures the host can
//! encounter: configuration problems, serial I/O errors, and protocol-level
//! issues with the instrument.
//!
//! Note that almost nothing in this crate treats an error as fatal. Connect
//! failures are retried with backoff, short read timeouts become failed trace
//! records, and undecodable response fragments are dropped. Errors surface to
//! the operator through the status attached to each record and the link's
//! connected/disconnected state, not through aborted runs.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, PispecError>;

#[derive(Error, Debug)]
pub enum PispecError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device link is not connected")]
    LinkDisconnected,

    #[error("Transport error: {0}")]
    Transport(String),

    /// Reserved for responses that are well-formed UTF-8 but violate the
    /// command grammar. The firmware does not currently produce a frame the
    /// host can positively identify as malformed, so nothing constructs this
    /// yet; malformed responses surface as read timeouts instead.
    #[error("Malformed instrument response: {0}")]
    ProtocolViolation(String),

    #[error("Parameter string parse error: {0}")]
    ParameterParse(String),

    #[error("Persistence error: {0}")]
    Persist(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PispecError::Transport("port vanished".to_string());
        assert_eq!(err.to_string(), "Transport error: port vanished");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let err: PispecError = io.into();
        assert!(err.to_string().contains("slow"));
    }
}
