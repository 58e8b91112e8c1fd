//! Error types for channel and notification I/O operations.
//!
//! Argument and state validation errors are returned synchronously and never
//! leave a notification object behind. Failures that happen after an object is
//! registered (transport disconnect, server exceptions) reach the caller through
//! the object's completion handle instead.

use thiserror::Error;

use crate::transport::SendError;

/// Which access right an operation required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read access (reads and subscriptions).
    Read,
    /// Write access (writes with or without completion).
    Write,
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::Write => write!(f, "write"),
        }
    }
}

/// Errors reported by the channel access client core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CaError {
    /// Channel is not connected to a server.
    #[error("channel not connected")]
    NotConnected,

    /// Data type code is unknown, or compound where a plain type is required.
    #[error("invalid DBR type {dbr_type}")]
    InvalidType {
        /// The rejected type code.
        dbr_type: u16,
    },

    /// The server has not granted the required access right.
    #[error("{access} access denied")]
    AccessDenied {
        /// The right that was missing.
        access: Access,
    },

    /// Element count is zero where forbidden, or exceeds the native or wire limit.
    #[error("element count {requested} out of range (native count {native})")]
    CountOutOfRange {
        /// Count requested by the caller.
        requested: u32,
        /// Native element count of the channel.
        native: u32,
    },

    /// Encoded payload does not fit the 16-bit wire size field.
    #[error("payload of {size} bytes exceeds the wire size field")]
    ValueTooLarge {
        /// Computed payload size in bytes.
        size: usize,
    },

    /// A string lacks a terminator within its slot, or a name is too long.
    #[error("string too long")]
    StringTooLong,

    /// The caller's value buffer holds fewer bytes than `count` elements need.
    #[error("value buffer too short: need {needed} bytes, have {have}")]
    ValueTooShort {
        /// Bytes required by type and count.
        needed: usize,
        /// Bytes supplied.
        have: usize,
    },

    /// The peer's protocol revision lacks a required feature.
    #[error("{feature} not supported by peer (protocol minor version {minor_version})")]
    UnsupportedByPeer {
        /// Name of the missing feature.
        feature: &'static str,
        /// Minor version negotiated with the peer.
        minor_version: u16,
    },

    /// Storage or id space could not be allocated.
    #[error("allocation failure")]
    AllocationFailure,

    /// The transport refused the request.
    #[error("transport rejected request: {0}")]
    TransportRejected(#[from] SendError),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),

    /// The channel handle refers to a destroyed channel.
    #[error("bad channel handle")]
    BadChannel,

    /// The channel disconnected while the operation was outstanding.
    #[error("channel disconnected from {host}")]
    Disconnected {
        /// Host the channel was last connected to.
        host: String,
    },

    /// The server reported an exception for the operation.
    #[error("server exception {status}: {context}")]
    Remote {
        /// Status code sent by the server.
        status: u32,
        /// Context string sent by the server.
        context: String,
    },

    /// The operation was destroyed before it completed.
    #[error("operation cancelled")]
    Cancelled,
}

/// Result type for channel access operations.
pub type CaResult<T> = Result<T, CaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(CaError::NotConnected.to_string(), "channel not connected");
        assert_eq!(
            CaError::AccessDenied {
                access: Access::Write
            }
            .to_string(),
            "write access denied"
        );
        assert_eq!(
            CaError::CountOutOfRange {
                requested: 12,
                native: 10
            }
            .to_string(),
            "element count 12 out of range (native count 10)"
        );
    }

    #[test]
    fn test_send_error_converts() {
        let err: CaError = SendError::WouldBlock.into();
        assert_eq!(err, CaError::TransportRejected(SendError::WouldBlock));
    }
}
