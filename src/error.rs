//! Blufi error types.
//!
//! # Error Classification
//!
//! | Variant | Class | Caller action |
//! |---------|-------|---------------|
//! | `Connection` | transport-level | may retry `connect` |
//! | `MalformedFrame`, `ChecksumMismatch` | corrupt data | frame dropped, command times out |
//! | `NegotiationIncomplete`, `SecurityRequired` | sequencing misuse | fix call order, never retried |
//! | `CommandTimeout` | no response | pending entry already removed |
//! | `SessionClosed` | teardown | reconnect |
//! | `InvalidArgument` | caller input | fix the argument |
//!
//! The `Crypto` variant preserves the full error chain via `#[source]`.

use std::time::Duration;

use thiserror::Error;

use crate::security::CryptoError;

/// Blufi protocol errors.
#[derive(Error, Debug)]
pub enum BlufiError {
    /// Transport-level failure or no active connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Frame could not be parsed (truncated, bad flags, broken fragment train).
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Frame checksum did not match its contents.
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried by the frame.
        expected: u32,
        /// Checksum computed over the received bytes.
        actual: u32,
    },

    /// Encryption or decryption attempted before key negotiation finished.
    #[error("Security negotiation has not completed")]
    NegotiationIncomplete,

    /// Operation carries secrets and the session is not in the Ready state.
    #[error("Operation '{operation}' requires a negotiated secure session")]
    SecurityRequired {
        /// Name of the refused operation.
        operation: &'static str,
    },

    /// No response arrived within the command deadline.
    #[error("Command '{command}' timed out after {timeout:?}")]
    CommandTimeout {
        /// Name of the command that timed out.
        command: &'static str,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// The session was torn down while the command was pending.
    #[error("Session closed")]
    SessionClosed,

    /// Key negotiation was rejected or produced an unusable reply.
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The device answered with an error report.
    #[error("Device reported error code {code}")]
    DeviceError {
        /// Device error code.
        code: u8,
    },

    /// Caller supplied an argument the device cannot accept.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Protocol-level error (unexpected reply, sequence space exhausted).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// Cryptographic operation failed.
    #[error("Crypto error: {0}")]
    Crypto(#[source] CryptoError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Blufi operations
pub type Result<T> = std::result::Result<T, BlufiError>;

impl BlufiError {
    /// Whether the caller may reasonably retry the same call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BlufiError::Connection(_) | BlufiError::CommandTimeout { .. })
    }
}

impl From<CryptoError> for BlufiError {
    fn from(err: CryptoError) -> Self {
        BlufiError::Crypto(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BlufiError::SecurityRequired {
            operation: "configure_sta",
        };
        assert!(err.to_string().contains("configure_sta"));

        let err = BlufiError::ChecksumMismatch {
            expected: 0xdead_beef,
            actual: 0,
        };
        assert!(err.to_string().contains("0xdeadbeef"));
    }

    #[test]
    fn test_retryable() {
        assert!(BlufiError::Connection("lost".to_string()).is_retryable());
        assert!(!BlufiError::SessionClosed.is_retryable());
        assert!(!BlufiError::NegotiationIncomplete.is_retryable());
    }
}
