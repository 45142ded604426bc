//! Pairing handshake wire messages.
//!
//! The plaintext half of the handshake is newline-delimited JSON tagged with
//! `op`. The sealed half is length-prefixed binary:
//!
//! ```text
//! register: [kem_ciphertext (1088)][nonce (24)][aead ciphertext]
//! ack:      [nonce (24)][aead ciphertext]
//! ```
//!
//! Both sealed payloads are JSON [`PairMessage`] values encrypted under the
//! key from [`crate::crypto::derive_pairing_key`].

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use crate::crypto::{self, CryptoError, KEM_CIPHERTEXT_LEN};
use crate::types::{Nonce, KEY_LEN, NONCE_LEN, PROTOCOL_VERSION, TAG_LEN};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

/// AAD bound to the client's sealed registration.
pub const REGISTER_AAD: &[u8] = b"keyferry-pair-v1/register";
/// AAD bound to the agent's sealed acknowledgement.
pub const ACK_AAD: &[u8] = b"keyferry-pair-v1/ack";
/// Longest accepted JSON control line, including the newline.
pub const MAX_LINE_LEN: usize = 8 * 1024;

/// Machine-readable codes carried by [`PairMessage::Error`].
pub mod error_code {
    /// No pairing token is active (never issued, or already used).
    pub const NOT_ACTIVE: &str = "not_active";
    /// The token's TTL elapsed.
    pub const EXPIRED: &str = "expired";
    /// The presented token does not match.
    pub const UNAUTHORIZED: &str = "unauthorized";
    /// The device store could not be written.
    pub const STORAGE_UNAVAILABLE: &str = "storage_unavailable";
    /// The peer spoke an unexpected message or version.
    pub const PROTOCOL: &str = "protocol";
}

/// Errors in the pairing wire layer.
#[derive(Debug, Error)]
pub enum PairWireError {
    /// A JSON message could not be parsed or produced.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// Sealing or opening failed.
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
    /// A sealed blob is shorter than its fixed prefix.
    #[error("sealed blob too short: {0} bytes")]
    Truncated(usize),
    /// The peer uses a protocol version this build does not speak.
    #[error("unsupported pairing version {0}")]
    UnsupportedVersion(u8),
}

/// Every message exchanged during pairing.
///
/// Secret-bearing fields are wiped when the value is dropped, so callers
/// borrow rather than move out of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PairMessage {
    /// Client opens the handshake with the Base58 pairing token.
    Hello {
        /// Protocol version.
        v: u8,
        /// Base58 token.
        token: String,
    },
    /// Agent answers with its ephemeral KEM public key.
    ServerHello {
        /// Protocol version.
        v: u8,
        /// Base64 ML-KEM-768 encapsulation key.
        kem_pk: String,
        /// Hex fingerprint of `kem_pk`.
        fingerprint: String,
        /// Short id of the consumed token.
        token_id: String,
    },
    /// Client registration, sent sealed.
    Register {
        /// Protocol version.
        v: u8,
        /// Requested device id; the agent picks one when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        /// Proposed 32-byte device key, hex.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_key_hex: Option<String>,
    },
    /// Agent acknowledgement, sent sealed.
    Ok {
        /// Protocol version.
        v: u8,
        /// Device id the agent registered.
        device_id: String,
        /// Present only when the agent generated the key.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_key_hex: Option<String>,
    },
    /// Failure at any step; the sender closes the connection afterwards.
    Error {
        /// Protocol version.
        v: u8,
        /// One of [`error_code`].
        code: String,
    },
}

impl Drop for PairMessage {
    fn drop(&mut self) {
        match self {
            Self::Hello { token, .. } => token.zeroize(),
            Self::Register {
                device_key_hex: Some(k),
                ..
            }
            | Self::Ok {
                device_key_hex: Some(k),
                ..
            } => k.zeroize(),
            _ => {}
        }
    }
}

impl PairMessage {
    /// Builds a `hello`.
    #[must_use]
    pub fn hello(token: &str) -> Self {
        Self::Hello {
            v: PROTOCOL_VERSION,
            token: token.to_string(),
        }
    }

    /// Builds a `server_hello` for an encoded KEM public key.
    #[must_use]
    pub fn server_hello(kem_public_key: &[u8], token_id: &str) -> Self {
        Self::ServerHello {
            v: PROTOCOL_VERSION,
            kem_pk: BASE64.encode(kem_public_key),
            fingerprint: crypto::fingerprint(kem_public_key),
            token_id: token_id.to_string(),
        }
    }

    /// Builds an `error` with one of the [`error_code`] values.
    #[must_use]
    pub fn error(code: &str) -> Self {
        Self::Error {
            v: PROTOCOL_VERSION,
            code: code.to_string(),
        }
    }

    /// Protocol version carried by any variant.
    #[must_use]
    pub const fn version(&self) -> u8 {
        match self {
            Self::Hello { v, .. }
            | Self::ServerHello { v, .. }
            | Self::Register { v, .. }
            | Self::Ok { v, .. }
            | Self::Error { v, .. } => *v,
        }
    }

    /// `op` tag as it appears on the wire.
    #[must_use]
    pub const fn op(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::ServerHello { .. } => "server_hello",
            Self::Register { .. } => "register",
            Self::Ok { .. } => "ok",
            Self::Error { .. } => "error",
        }
    }

    /// Serializes to one newline-terminated JSON line.
    ///
    /// # Errors
    ///
    /// Returns [`PairWireError::Json`] if serialization fails.
    pub fn to_line(&self) -> Result<Vec<u8>, PairWireError> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }

    /// Parses one JSON line (trailing whitespace allowed) and checks the
    /// version.
    ///
    /// # Errors
    ///
    /// Returns [`PairWireError`] on malformed JSON or a foreign version.
    pub fn from_line(line: &[u8]) -> Result<Self, PairWireError> {
        let msg: Self = serde_json::from_slice(line.trim_ascii_end())?;
        if msg.version() != PROTOCOL_VERSION {
            return Err(PairWireError::UnsupportedVersion(msg.version()));
        }
        Ok(msg)
    }
}

/// Decodes the base64 `kem_pk` of a `server_hello` and checks it against
/// the advertised fingerprint.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKeyMaterial`] if the key is not base64 or
/// does not match `fingerprint`.
pub fn decode_kem_public_key(kem_pk: &str, fingerprint: &str) -> Result<Vec<u8>, CryptoError> {
    let pk = BASE64
        .decode(kem_pk)
        .map_err(|_| CryptoError::InvalidKeyMaterial)?;
    if !crypto::ct_eq(crypto::fingerprint(&pk).as_bytes(), fingerprint.as_bytes()) {
        return Err(CryptoError::InvalidKeyMaterial);
    }
    Ok(pk)
}

/// Client registration blob as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBlob {
    /// ML-KEM ciphertext to the agent's ephemeral key.
    pub kem_ciphertext: Vec<u8>,
    /// AEAD nonce.
    pub nonce: Nonce,
    /// Sealed [`PairMessage::Register`].
    pub ciphertext: Vec<u8>,
}

impl RegisterBlob {
    /// Concatenates the three parts.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(self.kem_ciphertext.len() + NONCE_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.kem_ciphertext);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Splits a received blob.
    ///
    /// # Errors
    ///
    /// Returns [`PairWireError::Truncated`] if the blob cannot hold a KEM
    /// ciphertext, a nonce and an AEAD tag.
    pub fn decode(data: &[u8]) -> Result<Self, PairWireError> {
        if data.len() < KEM_CIPHERTEXT_LEN + NONCE_LEN + TAG_LEN {
            return Err(PairWireError::Truncated(data.len()));
        }
        let (kem_ciphertext, rest) = data.split_at(KEM_CIPHERTEXT_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let mut n = [0u8; NONCE_LEN];
        n.copy_from_slice(nonce);
        Ok(Self {
            kem_ciphertext: kem_ciphertext.to_vec(),
            nonce: n,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// Seals a message as `[nonce][ciphertext]`.
///
/// # Errors
///
/// Returns [`PairWireError`] if serialization or encryption fails.
pub fn seal_message(
    key: &[u8; KEY_LEN],
    aad: &[u8],
    msg: &PairMessage,
) -> Result<Vec<u8>, PairWireError> {
    let plaintext = Zeroizing::new(serde_json::to_vec(msg)?);
    let nonce = crypto::random_nonce();
    let ct = crypto::seal(key, &nonce, &plaintext, aad)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Opens `nonce || ciphertext` sealed by [`seal_message`].
///
/// # Errors
///
/// Returns [`PairWireError`] if the blob is truncated, fails authentication,
/// or does not hold a message of the current version.
pub fn open_message(
    key: &[u8; KEY_LEN],
    aad: &[u8],
    sealed: &[u8],
) -> Result<PairMessage, PairWireError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(PairWireError::Truncated(sealed.len()));
    }
    let (nonce, ct) = sealed.split_at(NONCE_LEN);
    let mut n = [0u8; NONCE_LEN];
    n.copy_from_slice(nonce);
    open_parts(key, aad, &n, ct)
}

/// Opens a sealed message whose nonce travelled separately.
///
/// # Errors
///
/// Returns [`PairWireError`] if authentication or parsing fails.
pub fn open_parts(
    key: &[u8; KEY_LEN],
    aad: &[u8],
    nonce: &Nonce,
    ciphertext: &[u8],
) -> Result<PairMessage, PairWireError> {
    let pt = crypto::open(key, nonce, ciphertext, aad)?;
    PairMessage::from_line(&pt)
}
