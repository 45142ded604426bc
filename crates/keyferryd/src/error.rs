use crate::capabilities::CapabilityError;
use crate::registry::StoreError;
use keyferry_proto::frame::FrameError;
use keyferry_proto::pairing::{error_code, PairWireError};
use keyferry_proto::types::deny_reason;
use std::fmt;
use thiserror::Error;

/// Why a policy gate refused an inject request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Arming is required and no arm window is open.
    NotArmed,
    /// Approval is required and the device has no open approval window.
    NeedsApproval,
    /// The foreground target is not permitted by the target policy.
    TargetNotAllowed,
}

impl DenyReason {
    /// Wire string carried in a `denied` reply.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotArmed => deny_reason::NOT_ARMED,
            Self::NeedsApproval => deny_reason::NEEDS_APPROVAL,
            Self::TargetNotAllowed => deny_reason::TARGET_NOT_ALLOWED,
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures of the pairing handshake.
#[derive(Error, Debug)]
pub enum PairingError {
    /// No token is active, or it was already used.
    #[error("pairing not active")]
    NotActive,
    /// The active token's TTL has elapsed.
    #[error("pairing token expired")]
    Expired,
    /// The presented token does not match.
    #[error("pairing unauthorized")]
    Unauthorized,
    /// The client sent something other than the expected step.
    #[error("unexpected pairing message: {0}")]
    UnexpectedMessage(&'static str),
    /// The client's proposed device id or key is unusable.
    #[error("invalid registration: {0}")]
    InvalidRegistration(&'static str),
    /// A pairing message could not be decoded, sealed or opened.
    #[error("pairing wire error: {0}")]
    Wire(#[from] PairWireError),
}

impl PairingError {
    /// Code sent to the client in an `error` message.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotActive => error_code::NOT_ACTIVE,
            Self::Expired => error_code::EXPIRED,
            Self::Unauthorized => error_code::UNAUTHORIZED,
            Self::UnexpectedMessage(_) | Self::InvalidRegistration(_) | Self::Wire(_) => {
                error_code::PROTOCOL
            }
        }
    }
}

/// Errors that can occur while serving a connection.
#[derive(Error, Debug)]
pub enum AgentError {
    /// The frame could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),
    /// Authentication failed or the device is unknown.
    #[error("crypto failure")]
    CryptoFailure,
    /// The decrypted payload is not a valid envelope or control body.
    #[error("invalid payload: {0}")]
    InvalidPayload(&'static str),
    /// The envelope timestamp or nonce failed the replay check.
    #[error("replay detected")]
    ReplayDetected,
    /// The origin exceeded its request budget.
    #[error("rate limited")]
    RateLimited,
    /// A policy gate refused the request.
    #[error("policy denied: {0}")]
    PolicyDenied(DenyReason),
    /// The device store could not be read or written.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    /// No device has been paired yet.
    #[error("no device paired")]
    NotPaired,
    /// Pairing handshake failure.
    #[error("pairing failed: {0}")]
    Pairing(#[from] PairingError),
    /// A desktop capability failed.
    #[error("capability error: {0}")]
    Capability(#[from] CapabilityError),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A deadline elapsed.
    #[error("timed out during {0}")]
    Timeout(&'static str),
    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,
}

impl From<StoreError> for AgentError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotPaired => Self::NotPaired,
            StoreError::Unavailable(msg) => Self::StorageUnavailable(msg),
        }
    }
}

impl AgentError {
    /// Short label for metrics and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol",
            Self::CryptoFailure => "crypto_failure",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::ReplayDetected => "replay",
            Self::RateLimited => "rate_limited",
            Self::PolicyDenied(_) => "denied",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::NotPaired => "not_paired",
            Self::Pairing(_) => "pairing",
            Self::Capability(_) => "capability",
            Self::Io(_) => "io",
            Self::Timeout(_) => "timeout",
            Self::ConnectionClosed => "closed",
        }
    }
}
