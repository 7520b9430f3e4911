//! Error taxonomy for the device layer.
//!
//! Every fallible operation in the workspace returns [`SdrError`]. Each
//! variant belongs to exactly one [`ErrorKind`] category, which is what
//! callers should branch on:
//!
//! | Kind | Meaning | Handle usable afterwards? |
//! |------|---------|---------------------------|
//! | `Unsupported` | the bound board/backend lacks the operation | yes |
//! | `InvalidState` | call made outside its legal lifecycle state | yes |
//! | `InvalidArgument` | parameter out of range or malformed | yes |
//! | `Timeout` | a bounded wait expired (includes would-block) | yes, retry allowed |
//! | `Transport` | I/O failure reported by the transport backend | yes, channel may need reset |
//! | `ResourceExhausted` | pool/queue capacity exceeded; init is atomic | yes |
//! | `NotFound` | no device matched an identifier | n/a |
//! | `Closed` | the handle was used after `close` | no (caller contract violation) |
//!
//! No error is ever retried automatically by the dispatch layer.

use crate::types::Channel;
use sdr_pool::PoolError;
use thiserror::Error;

/// Result type alias for device-layer operations.
pub type Result<T> = std::result::Result<T, SdrError>;

/// Category of an [`SdrError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unsupported,
    InvalidState,
    InvalidArgument,
    Timeout,
    Transport,
    ResourceExhausted,
    NotFound,
    Closed,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transport => "transport",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Closed => "closed",
        };
        write!(f, "{}", label)
    }
}

/// Errors returned by transport backends, board drivers and the device handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdrError {
    /// The bound board or backend does not implement the operation.
    #[error("Operation '{operation}' is not supported by {provider}")]
    Unsupported {
        operation: &'static str,
        provider: String,
    },

    /// The operation is illegal in the current lifecycle state.
    #[error("Invalid state for '{operation}': {message}")]
    InvalidState {
        operation: &'static str,
        message: String,
    },

    /// A parameter was out of range or malformed.
    #[error("Invalid argument for '{operation}': {message}")]
    InvalidArgument {
        operation: &'static str,
        message: String,
    },

    /// A bounded wait expired.
    #[error("Operation '{operation}' timed out after {timeout_ms} ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// A non-blocking submission found no free transfer slot.
    #[error("Operation '{operation}' would block")]
    WouldBlock { operation: &'static str },

    /// The transport reported an I/O failure.
    #[error("Transport error during '{operation}': {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    /// A buffer pool or descriptor could not be allocated.
    #[error("Resource exhausted: {message}")]
    ResourceExhausted { message: String },

    /// The per-channel scheduled retune queue is full.
    #[error("Retune queue for {channel} is full ({depth} entries pending)")]
    QueueFull { channel: Channel, depth: usize },

    /// No attached device matched the requested identity.
    #[error("No device matches '{identifier}'")]
    NotFound { identifier: String },

    /// The handle was used after `close`.
    #[error("Device handle has been closed")]
    Closed,
}

impl SdrError {
    pub fn unsupported(operation: &'static str, provider: impl Into<String>) -> Self {
        Self::Unsupported {
            operation,
            provider: provider.into(),
        }
    }

    pub fn invalid_state(operation: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidState {
            operation,
            message: message.into(),
        }
    }

    pub fn invalid_argument(operation: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            operation,
            message: message.into(),
        }
    }

    pub fn transport(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Transport {
            operation,
            message: message.into(),
        }
    }

    pub fn timeout(operation: &'static str, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SdrError::Unsupported { .. } => ErrorKind::Unsupported,
            SdrError::InvalidState { .. } => ErrorKind::InvalidState,
            SdrError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            SdrError::Timeout { .. } | SdrError::WouldBlock { .. } => ErrorKind::Timeout,
            SdrError::Transport { .. } => ErrorKind::Transport,
            SdrError::ResourceExhausted { .. } | SdrError::QueueFull { .. } => {
                ErrorKind::ResourceExhausted
            }
            SdrError::NotFound { .. } => ErrorKind::NotFound,
            SdrError::Closed => ErrorKind::Closed,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        self.kind() == ErrorKind::Unsupported
    }

    pub fn is_invalid_state(&self) -> bool {
        self.kind() == ErrorKind::InvalidState
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    pub fn is_closed(&self) -> bool {
        self.kind() == ErrorKind::Closed
    }
}

impl From<PoolError> for SdrError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::InvalidGeometry { .. } => SdrError::InvalidArgument {
                operation: "buffer_pool",
                message: err.to_string(),
            },
            PoolError::TooLarge { .. } | PoolError::AllocationFailed { .. } => {
                SdrError::ResourceExhausted {
                    message: err.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            SdrError::unsupported("set_smb_mode", "sim-rev2").kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(
            SdrError::WouldBlock { operation: "submit" }.kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            SdrError::QueueFull {
                channel: Channel::RX0,
                depth: 16
            }
            .kind(),
            ErrorKind::ResourceExhausted
        );
        assert!(SdrError::Closed.is_closed());
    }

    #[test]
    fn test_error_display() {
        let err = SdrError::timeout("sync_rx", Duration::from_millis(250));
        assert_eq!(err.to_string(), "Operation 'sync_rx' timed out after 250 ms");

        let err = SdrError::unsupported("expansion_attach", "sim-rev2");
        assert!(err.to_string().contains("sim-rev2"));
    }

    #[test]
    fn test_pool_error_conversion() {
        let err: SdrError = PoolError::TooLarge {
            pool_size: 1,
            buffer_len: 2,
            max_bytes: 1,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

        let err: SdrError = PoolError::InvalidGeometry {
            pool_size: 0,
            buffer_len: 2,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
