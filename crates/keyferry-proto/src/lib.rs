//! Wire protocol shared by the keyferry agent and its companion client.
//!
//! This crate provides:
//! - Binary frame encoding and decoding ([`frame`])
//! - The plaintext envelope inside every message ([`envelope`])
//! - AEAD, ML-KEM and key derivation helpers ([`crypto`])
//! - Pairing handshake messages ([`pairing`])
//! - Length-prefixed and line-based stream helpers ([`stream`])
//! - Base58 token encoding ([`base58`])
//! - Protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod base58;
pub mod crypto;
pub mod envelope;
pub mod frame;
pub mod pairing;
pub mod stream;
pub mod types;

pub use crypto::{CryptoError, DeviceKey};
pub use frame::{Frame, FrameError};
pub use types::MsgType;
