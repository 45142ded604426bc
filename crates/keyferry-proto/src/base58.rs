//! Base58 encoding for pairing tokens and token ids.
//!
//! Tokens travel through QR codes and are occasionally typed by hand, so the
//! ambiguity-free Base58 alphabet is used instead of hex or base64.

use crate::types::PAIRING_TOKEN_LEN;
use thiserror::Error;

pub use bs58::decode::Error as DecodeError;

/// Errors that can occur when decoding a Base58-encoded pairing token.
///
/// # Examples
///
/// ```
/// use keyferry_proto::base58;
/// let short = base58::encode(&[1u8; 8]);
/// assert!(base58::decode_token(&short).is_err());
/// ```
#[derive(Debug, Error)]
pub enum TokenDecodeError {
    /// The input is not valid Base58.
    #[error("invalid base58: {0}")]
    Base58(#[from] DecodeError),
    /// The decoded bytes are not exactly one token long.
    #[error("token must be exactly {PAIRING_TOKEN_LEN} bytes, got {0}")]
    WrongLength(usize),
}

/// Encodes raw bytes to a Base58 string.
#[must_use]
pub fn encode(bytes: &[u8]) -> String {
    bs58::encode(bytes).into_string()
}

/// Decodes a Base58 string to raw bytes.
///
/// # Errors
///
/// Returns `DecodeError` if the input is not valid Base58.
pub fn decode(s: &str) -> Result<Vec<u8>, DecodeError> {
    bs58::decode(s).into_vec()
}

/// Decodes a Base58 string to a 16-byte pairing token.
///
/// # Errors
///
/// Returns [`TokenDecodeError`] if the input is not valid Base58
/// or does not decode to exactly 16 bytes.
///
/// # Examples
///
/// ```
/// let token = [0x42u8; 16];
/// let encoded = keyferry_proto::base58::encode(&token);
/// let decoded = keyferry_proto::base58::decode_token(&encoded).unwrap();
/// assert_eq!(*decoded, token);
/// ```
pub fn decode_token(
    s: &str,
) -> Result<zeroize::Zeroizing<[u8; PAIRING_TOKEN_LEN]>, TokenDecodeError> {
    let bytes = zeroize::Zeroizing::new(decode(s.trim())?);
    let len = bytes.len();
    let mut token = zeroize::Zeroizing::new([0u8; PAIRING_TOKEN_LEN]);
    if len != PAIRING_TOKEN_LEN {
        return Err(TokenDecodeError::WrongLength(len));
    }
    token.copy_from_slice(&bytes);
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let data = [0xABu8; 32];
        let encoded = encode(&data);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn decode_token_wrong_length() {
        let long = encode(&[1u8; 32]);
        let err = decode_token(&long).unwrap_err();
        assert!(matches!(err, TokenDecodeError::WrongLength(32)));
    }

    #[test]
    fn decode_token_empty_string() {
        let err = decode_token("").unwrap_err();
        assert!(matches!(err, TokenDecodeError::WrongLength(0)));
    }

    #[test]
    fn decode_token_rejects_non_alphabet() {
        // '0' and 'l' are not in the Base58 alphabet
        assert!(matches!(
            decode_token("0l0l0l"),
            Err(TokenDecodeError::Base58(_))
        ));
    }
}
