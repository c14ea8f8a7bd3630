//! Error taxonomy for the client.
//!
//! Synchronous failures (allocation, queue full, bad arguments) come straight
//! back from the call. Asynchronous failures (driver timeout, driver-reported
//! errors, protocol violations) travel the same path as successes: the
//! pending handle for the registration id and the resource listener.

use thiserror::Error;

use crate::types::RegistrationId;

/// Error codes the driver attaches to `OperationFailed` responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorCode {
    Generic,
    InvalidChannel,
    UnknownSubscription,
    UnknownPublication,
    UnknownCounter,
    MalformedCommand,
    ResourceExhausted,
    /// Code not known to this client version.
    Unknown(i32),
}

impl From<i32> for DriverErrorCode {
    fn from(code: i32) -> Self {
        match code {
            0 => Self::Generic,
            1 => Self::InvalidChannel,
            2 => Self::UnknownSubscription,
            3 => Self::UnknownPublication,
            5 => Self::UnknownCounter,
            7 => Self::MalformedCommand,
            10 => Self::ResourceExhausted,
            other => Self::Unknown(other),
        }
    }
}

impl From<DriverErrorCode> for i32 {
    fn from(code: DriverErrorCode) -> Self {
        match code {
            DriverErrorCode::Generic => 0,
            DriverErrorCode::InvalidChannel => 1,
            DriverErrorCode::UnknownSubscription => 2,
            DriverErrorCode::UnknownPublication => 3,
            DriverErrorCode::UnknownCounter => 5,
            DriverErrorCode::MalformedCommand => 7,
            DriverErrorCode::ResourceExhausted => 10,
            DriverErrorCode::Unknown(other) => other,
        }
    }
}

/// Errors surfaced by the client API and delivered for pending operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Local memory for a handle could not be obtained.
    #[error("allocation failed ({code}): {message}")]
    Allocation { code: i32, message: String },

    /// The command channel is at capacity. Back off and retry.
    #[error("command queue full")]
    QueueFull,

    /// No driver heartbeat within the configured timeout.
    #[error("driver has been inactive for {age_ms} ms")]
    DriverTimeout { age_ms: i64 },

    /// Malformed or unexpected driver response for a registration.
    #[error("protocol error for registration {registration_id}: {reason}")]
    Protocol {
        registration_id: RegistrationId,
        reason: String,
    },

    /// The driver rejected the operation.
    #[error("driver error {code:?} for registration {registration_id}: {message}")]
    Driver {
        registration_id: RegistrationId,
        code: DriverErrorCode,
        message: String,
    },

    /// The client context has been closed.
    #[error("client is closed")]
    Closed,

    /// Gave up waiting on a pending handle.
    #[error("timed out waiting for registration {0}")]
    Timeout(RegistrationId),

    /// Rejected locally before anything was submitted.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `invoke` called on a client that runs its own conductor thread.
    #[error("client is not in conductor invoker mode")]
    NotInvoker,
}

impl ClientError {
    /// Whether retrying the same call later can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::QueueFull)
    }

    /// Builds an [`ClientError::Allocation`] from an OS errno.
    #[must_use]
    pub fn allocation(errno: rustix::io::Errno, context: &str) -> Self {
        Self::Allocation {
            code: errno.raw_os_error(),
            message: format!("{context}: {errno}"),
        }
    }
}
