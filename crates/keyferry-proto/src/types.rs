//! Core type definitions and protocol constants for keyferry.

use std::fmt;

/// Wire version carried in the first byte of every message frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic word that opens a connection preamble line.
pub const PREAMBLE_MAGIC: &str = "KEYFERRY/1";

/// Preamble route for the pairing handshake.
pub const ROUTE_PAIR: &str = "/pair";

/// Preamble route for authenticated messages.
pub const ROUTE_MSG: &str = "/msg";

/// Length of the AEAD nonce carried in each frame (XChaCha20-Poly1305).
pub const NONCE_LEN: usize = 24;

/// Length of the Poly1305 authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Length of a per-device symmetric key.
pub const KEY_LEN: usize = 32;

/// Length of the random replay nonce inside the plaintext envelope.
pub const REPLAY_NONCE_LEN: usize = 16;

/// Length of a one-time pairing token.
pub const PAIRING_TOKEN_LEN: usize = 16;

/// Maximum encoded device id length (bounded by the `u16` length field).
pub const MAX_DEVICE_ID_LEN: usize = u16::MAX as usize;

/// A per-device random AEAD nonce.
pub type Nonce = [u8; NONCE_LEN];

/// Message kinds carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    /// Deliver a secret to the focused control.
    Inject = 1,
    /// Open the two-party approval window for the sending device.
    Approve = 2,
    /// Open the process-wide arm window.
    Arm = 3,
    /// Close the arm window.
    Disarm = 4,
}

impl MsgType {
    /// All message types in wire order.
    pub const ALL: [Self; 4] = [Self::Inject, Self::Approve, Self::Arm, Self::Disarm];

    /// Returns the wire byte for this message type.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a wire byte, returning `None` for unknown values.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Inject),
            2 => Some(Self::Approve),
            3 => Some(Self::Arm),
            4 => Some(Self::Disarm),
            _ => None,
        }
    }

    /// Short lowercase label, used for metrics and logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Inject => "inject",
            Self::Approve => "approve",
            Self::Arm => "arm",
            Self::Disarm => "disarm",
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Machine-readable reason codes sent with policy denials.
pub mod deny_reason {
    /// The arm window is closed or expired.
    pub const NOT_ARMED: &str = "not_armed";
    /// The device has no valid approval window.
    pub const NEEDS_APPROVAL: &str = "needs_approval";
    /// The foreground target is not allowed by policy.
    pub const TARGET_NOT_ALLOWED: &str = "target_not_allowed";
}

/// Reply status strings written back on the `/msg` route.
pub mod reply_status {
    /// The message was accepted and acted upon.
    pub const OK: &str = "ok";
    /// Injection was blocked but the secret was placed on the clipboard.
    pub const CLIPBOARD: &str = "clipboard";
    /// An authenticated message was refused by policy.
    pub const DENIED: &str = "denied";
    /// The origin exceeded its rate limit.
    pub const RATE_LIMITED: &str = "rate_limited";
    /// Generic rejection; never says why.
    pub const REJECTED: &str = "rejected";
}
