//! keyferry binary message frame serialization and parsing.
//!
//! ```text
//! [0]       version       (= 1)
//! [1]       msg_type      (1=Inject, 2=Approve, 3=Arm, 4=Disarm)
//! [2:4]     device_id_len (u16, big-endian)
//! [4:4+n]   device_id     (UTF-8)
//! [4+n:+24] nonce         (XChaCha20-Poly1305 nonce)
//! [...]     ciphertext    (remaining bytes, tag included)
//! ```
//!
//! The fixed fields (`version`, `msg_type`, `device_id`) double as the AEAD
//! associated data, see [`aad`].

use crate::types::{MsgType, Nonce, MAX_DEVICE_ID_LEN, NONCE_LEN, PROTOCOL_VERSION, TAG_LEN};
use thiserror::Error;

/// Bytes before the device id: version, type and the id length.
pub const HEADER_LEN: usize = 4;

/// Smallest well-formed frame: one-byte device id and an empty plaintext.
pub const MIN_FRAME_LEN: usize = HEADER_LEN + 1 + NONCE_LEN + TAG_LEN;

/// A parsed message frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Wire version; always [`PROTOCOL_VERSION`] for decoded frames.
    pub version: u8,
    /// Message kind.
    pub msg_type: MsgType,
    /// Sending device identity.
    pub device_id: String,
    /// AEAD nonce.
    pub nonce: Nonce,
    /// Sealed envelope including the authentication tag.
    pub ciphertext: Vec<u8>,
}

/// Errors that can occur during frame encoding and parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The input is shorter than the fixed header.
    #[error("frame too short: expected at least {expected}, got {actual}")]
    FrameTooShort {
        /// Minimum expected byte count.
        expected: usize,
        /// Actual byte count received.
        actual: usize,
    },
    /// The version byte is not one this build speaks.
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),
    /// The message type byte is not recognised.
    #[error("invalid message type {0}")]
    InvalidMsgType(u8),
    /// Declared lengths disagree with the bytes actually present.
    #[error("length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch {
        /// Byte count implied by the length fields.
        declared: usize,
        /// Byte count received.
        actual: usize,
    },
    /// Device id is empty, too long, or not UTF-8.
    #[error("invalid device id")]
    InvalidDeviceId,
}

/// Builds the associated data bound into every message ciphertext:
/// `version || msg_type || device_id`.
///
/// # Examples
///
/// ```
/// use keyferry_proto::frame::aad;
/// use keyferry_proto::MsgType;
/// assert_eq!(aad(MsgType::Arm, "dev"), vec![1, 3, b'd', b'e', b'v']);
/// ```
#[must_use]
pub fn aad(msg_type: MsgType, device_id: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(2 + device_id.len());
    v.push(PROTOCOL_VERSION);
    v.push(msg_type.as_u8());
    v.extend_from_slice(device_id.as_bytes());
    v
}

/// Serializes a frame from its parts.
///
/// # Errors
///
/// Returns [`FrameError::InvalidDeviceId`] if the id is empty or longer than
/// 65535 bytes.
///
/// # Examples
///
/// ```
/// use keyferry_proto::frame::{decode, encode};
/// use keyferry_proto::MsgType;
/// let bytes = encode("phone", MsgType::Inject, &[7u8; 24], &[0u8; 16]).unwrap();
/// let frame = decode(&bytes).unwrap();
/// assert_eq!(frame.device_id, "phone");
/// ```
pub fn encode(
    device_id: &str,
    msg_type: MsgType,
    nonce: &Nonce,
    ciphertext: &[u8],
) -> Result<Vec<u8>, FrameError> {
    if device_id.is_empty() || device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(FrameError::InvalidDeviceId);
    }
    let id_len = u16::try_from(device_id.len()).map_err(|_| FrameError::InvalidDeviceId)?;
    let mut v = Vec::with_capacity(HEADER_LEN + device_id.len() + NONCE_LEN + ciphertext.len());
    v.push(PROTOCOL_VERSION);
    v.push(msg_type.as_u8());
    v.extend_from_slice(&id_len.to_be_bytes());
    v.extend_from_slice(device_id.as_bytes());
    v.extend_from_slice(nonce);
    v.extend_from_slice(ciphertext);
    Ok(v)
}

/// Serializes a frame from a raw message type byte.
///
/// # Errors
///
/// Returns [`FrameError::InvalidMsgType`] for an unknown type byte, otherwise
/// the same errors as [`encode`].
pub fn encode_raw(
    device_id: &str,
    msg_type: u8,
    nonce: &Nonce,
    ciphertext: &[u8],
) -> Result<Vec<u8>, FrameError> {
    let msg_type = MsgType::from_u8(msg_type).ok_or(FrameError::InvalidMsgType(msg_type))?;
    encode(device_id, msg_type, nonce, ciphertext)
}

/// Parses exactly one frame from `data`.
///
/// Length fields are checked against `data.len()` before any slice is
/// copied, so a hostile `device_id_len` can never drive an allocation.
///
/// # Errors
///
/// Returns [`FrameError`] if the data is truncated, carries an unknown
/// version or type, or its declared lengths do not fit.
pub fn decode(data: &[u8]) -> Result<Frame, FrameError> {
    if data.len() < HEADER_LEN {
        return Err(FrameError::FrameTooShort {
            expected: MIN_FRAME_LEN,
            actual: data.len(),
        });
    }
    let version = data[0];
    if version != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }
    let msg_type = MsgType::from_u8(data[1]).ok_or(FrameError::InvalidMsgType(data[1]))?;
    let id_len = usize::from(u16::from_be_bytes([data[2], data[3]]));
    if id_len == 0 {
        return Err(FrameError::InvalidDeviceId);
    }

    let declared = HEADER_LEN + id_len + NONCE_LEN + TAG_LEN;
    if data.len() < declared {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: data.len(),
        });
    }

    let id_end = HEADER_LEN + id_len;
    let device_id = std::str::from_utf8(&data[HEADER_LEN..id_end])
        .map_err(|_| FrameError::InvalidDeviceId)?
        .to_owned();
    let nonce_end = id_end + NONCE_LEN;
    let nonce: Nonce = data[id_end..nonce_end]
        .try_into()
        .map_err(|_| FrameError::LengthMismatch {
            declared,
            actual: data.len(),
        })?;

    Ok(Frame {
        version,
        msg_type,
        device_id,
        nonce,
        ciphertext: data[nonce_end..].to_vec(),
    })
}

impl Frame {
    /// Creates a frame at the current protocol version.
    #[must_use]
    pub fn new(msg_type: MsgType, device_id: &str, nonce: Nonce, ciphertext: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            msg_type,
            device_id: device_id.to_owned(),
            nonce,
            ciphertext,
        }
    }

    /// Serializes this frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidDeviceId`] if the id is empty or too long.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode(&self.device_id, self.msg_type, &self.nonce, &self.ciphertext)
    }

    /// Associated data for this frame's ciphertext.
    #[must_use]
    pub fn aad(&self) -> Vec<u8> {
        aad(self.msg_type, &self.device_id)
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_msg_type() -> impl Strategy<Value = MsgType> {
        prop::sample::select(MsgType::ALL.to_vec())
    }

    fn arb_device_id() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_\\-\u{00e9}\u{4e2d}]{1,64}"
    }

    fn arb_nonce() -> impl Strategy<Value = Nonce> {
        prop::collection::vec(any::<u8>(), NONCE_LEN).prop_map(|v| {
            let mut arr = [0u8; NONCE_LEN];
            arr.copy_from_slice(&v);
            arr
        })
    }

    fn arb_ciphertext() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), TAG_LEN..512)
    }

    proptest! {
        #[test]
        fn encode_decode_roundtrip(
            t in arb_msg_type(),
            id in arb_device_id(),
            nonce in arb_nonce(),
            ct in arb_ciphertext()
        ) {
            let frame = Frame::new(t, &id, nonce, ct);
            let bytes = frame.encode().unwrap();
            prop_assert_eq!(decode(&bytes).unwrap(), frame);
        }

        #[test]
        fn decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode(&data);
        }

        #[test]
        fn overstated_device_id_len_always_fails(
            id in arb_device_id(),
            extra in 1u16..1024,
            ct in arb_ciphertext()
        ) {
            let mut bytes = encode(&id, MsgType::Inject, &[0; NONCE_LEN], &ct).unwrap();
            let available = bytes.len() - HEADER_LEN - NONCE_LEN - TAG_LEN;
            let declared = u16::try_from(available).unwrap().saturating_add(extra);
            bytes[2..4].copy_from_slice(&declared.to_be_bytes());
            let rejected = matches!(
                decode(&bytes),
                Err(FrameError::LengthMismatch { .. })
            );
            prop_assert!(rejected);
        }
    }
}
