// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types shared across the proxy.
//!
//! Errors are grouped by where they originate so callers can decide between
//! absorbing (per-frame codec errors), tearing down one participant
//! (backend failures) or closing the client connection (policy errors).

use thiserror::Error;

/// Main error type for proxy operations.
#[derive(Debug, Error)]
pub enum ScribeError {
    /// Configuration or parameter validation error.
    ///
    /// Examples:
    /// - Unknown provider name in `PROVIDERS_PRIORITY`
    /// - Invalid decoder sample rate
    /// - No provider with credentials available at startup
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Policy rejection on the downstream boundary.
    ///
    /// Examples:
    /// - Requested provider not configured
    /// - No output sink selected on `/transcribe`
    /// - Tag exceeds the length limit
    #[error("Policy error: {0}")]
    Policy(String),

    /// Protocol-level error: malformed JSON, unexpected message shape,
    /// or a provider-returned API error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Network-related error (sockets, WebSocket handshake, aborts).
    #[error("Network error: {0}")]
    Network(String),

    /// Codec-specific error (decoder init, per-frame decode, concealment).
    #[error("Codec error: {0}")]
    Codec(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results using `ScribeError`.
pub type Result<T> = std::result::Result<T, ScribeError>;

impl From<ScribeError> for String {
    fn from(err: ScribeError) -> Self {
        err.to_string()
    }
}

impl From<String> for ScribeError {
    fn from(s: String) -> Self {
        Self::Protocol(s)
    }
}

impl From<&str> for ScribeError {
    fn from(s: &str) -> Self {
        Self::Protocol(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScribeError::Configuration("unknown provider 'whisper'".to_string());
        assert_eq!(err.to_string(), "Configuration error: unknown provider 'whisper'");

        let err = ScribeError::Network("upstream socket closed".to_string());
        assert_eq!(err.to_string(), "Network error: upstream socket closed");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: ScribeError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
        assert!(err.to_string().contains("reset by peer"));
    }
}
