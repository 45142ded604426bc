//! The plaintext carried inside every message ciphertext.
//!
//! ```text
//! [0:8]   unix timestamp in milliseconds (u64, big-endian)
//! [8:24]  random replay nonce
//! [24..]  payload (UTF-8 secret or JSON control body)
//! ```

use crate::crypto::{self, CryptoError};
use crate::frame::{self, FrameError};
use crate::types::{MsgType, KEY_LEN, REPLAY_NONCE_LEN};
use thiserror::Error;
use zeroize::Zeroizing;

/// Bytes before the payload.
pub const ENVELOPE_HEADER_LEN: usize = 8 + REPLAY_NONCE_LEN;

/// Errors building or parsing an envelope.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The decrypted plaintext is shorter than the envelope header.
    #[error("envelope too short: {0} bytes")]
    TooShort(usize),
    /// The outer frame could not be encoded.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    /// Sealing failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// A decrypted message body. The payload is wiped on drop.
#[derive(Debug)]
pub struct Envelope {
    /// Sender clock at sealing time, Unix milliseconds.
    pub timestamp_ms: u64,
    /// Random per-message nonce used for replay detection.
    pub replay_nonce: [u8; REPLAY_NONCE_LEN],
    /// Application payload.
    pub payload: Zeroizing<Vec<u8>>,
}

impl Envelope {
    /// Splits a decrypted plaintext into its fields.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::TooShort`] if the header is incomplete.
    pub fn parse(plaintext: &[u8]) -> Result<Self, EnvelopeError> {
        if plaintext.len() < ENVELOPE_HEADER_LEN {
            return Err(EnvelopeError::TooShort(plaintext.len()));
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&plaintext[..8]);
        let mut replay_nonce = [0u8; REPLAY_NONCE_LEN];
        replay_nonce.copy_from_slice(&plaintext[8..ENVELOPE_HEADER_LEN]);
        Ok(Self {
            timestamp_ms: u64::from_be_bytes(ts),
            replay_nonce,
            payload: Zeroizing::new(plaintext[ENVELOPE_HEADER_LEN..].to_vec()),
        })
    }
}

/// Serializes an envelope.
#[must_use]
pub fn encode(
    timestamp_ms: u64,
    replay_nonce: &[u8; REPLAY_NONCE_LEN],
    payload: &[u8],
) -> Zeroizing<Vec<u8>> {
    let mut v = Zeroizing::new(Vec::with_capacity(ENVELOPE_HEADER_LEN + payload.len()));
    v.extend_from_slice(&timestamp_ms.to_be_bytes());
    v.extend_from_slice(replay_nonce);
    v.extend_from_slice(payload);
    v
}

/// Builds a complete wire frame: envelope → AEAD under `key` with the frame
/// header as AAD → frame encoding.
///
/// A fresh replay nonce and AEAD nonce are drawn for every call.
///
/// # Errors
///
/// Returns [`EnvelopeError`] if the device id is invalid or sealing fails.
///
/// # Examples
///
/// ```
/// use keyferry_proto::{envelope, frame, crypto, MsgType};
/// let key = [1u8; 32];
/// let bytes = envelope::seal_message(&key, "phone", MsgType::Inject, b"pw", 1_000).unwrap();
/// let f = frame::decode(&bytes).unwrap();
/// let pt = crypto::open(&key, &f.nonce, &f.ciphertext, &f.aad()).unwrap();
/// let env = envelope::Envelope::parse(&pt).unwrap();
/// assert_eq!(env.timestamp_ms, 1_000);
/// assert_eq!(&env.payload[..], b"pw");
/// ```
pub fn seal_message(
    key: &[u8; KEY_LEN],
    device_id: &str,
    msg_type: MsgType,
    payload: &[u8],
    timestamp_ms: u64,
) -> Result<Vec<u8>, EnvelopeError> {
    let replay_nonce = crypto::random_bytes::<REPLAY_NONCE_LEN>();
    seal_message_with_nonce(key, device_id, msg_type, payload, timestamp_ms, &replay_nonce)
}

/// Like [`seal_message`] but with a caller-chosen replay nonce.
///
/// # Errors
///
/// Returns [`EnvelopeError`] if the device id is invalid or sealing fails.
pub fn seal_message_with_nonce(
    key: &[u8; KEY_LEN],
    device_id: &str,
    msg_type: MsgType,
    payload: &[u8],
    timestamp_ms: u64,
    replay_nonce: &[u8; REPLAY_NONCE_LEN],
) -> Result<Vec<u8>, EnvelopeError> {
    let plaintext = encode(timestamp_ms, replay_nonce, payload);
    let nonce = crypto::random_nonce();
    let aad = frame::aad(msg_type, device_id);
    let ciphertext = crypto::seal(key, &nonce, &plaintext, &aad)?;
    Ok(frame::encode(device_id, msg_type, &nonce, &ciphertext)?)
}
