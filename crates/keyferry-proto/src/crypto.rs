//! Cryptographic primitives for keyferry.
//!
//! - Message AEAD: XChaCha20-Poly1305 keyed by the per-device key, with the
//!   frame header as associated data.
//! - Pairing KEM: ML-KEM-768, one ephemeral keypair per pairing event.
//! - Pairing key: HKDF-SHA256 over the KEM shared secret, salted with the
//!   one-time pairing token.
//!
//! Every secret returned from this module is wrapped so it is wiped on drop.

use crate::base58;
use crate::types::{Nonce, KEY_LEN, NONCE_LEN, PAIRING_TOKEN_LEN};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{EncodedSizeUser, KemCore, MlKem768};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// ML-KEM-768 encapsulation (public) key length.
pub const KEM_PUBLIC_KEY_LEN: usize = 1184;
/// ML-KEM-768 ciphertext length.
pub const KEM_CIPHERTEXT_LEN: usize = 1088;
/// ML-KEM-768 shared secret length.
pub const KEM_SHARED_SECRET_LEN: usize = 32;

/// HKDF info string binding the derived key to the pairing protocol version.
const PAIRING_KDF_INFO: &[u8] = b"keyferry-pair-v1";

type DecapsulationKey = <MlKem768 as KemCore>::DecapsulationKey;
type EncapsulationKey = <MlKem768 as KemCore>::EncapsulationKey;

/// Errors from cryptographic operations.
///
/// `CryptoFailure` carries no detail: a wrong key, a tampered
/// ciphertext and a tampered AAD are indistinguishable to the caller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD authentication or KEM decapsulation failed.
    #[error("crypto failure")]
    CryptoFailure,
    /// A key or KEM ciphertext has the wrong encoded length.
    #[error("invalid key material")]
    InvalidKeyMaterial,
}

/// A 32-byte per-device symmetric key. Wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DeviceKey([u8; KEY_LEN]);

impl DeviceKey {
    /// Wraps raw key bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Generates a fresh random key from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        let key = Self(bytes);
        bytes.zeroize();
        key
    }

    /// Parses a 64-character hex string.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] if the string is not
    /// exactly 32 bytes of hex.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let mut bytes = [0u8; KEY_LEN];
        let result = hex::decode_to_slice(s.trim(), &mut bytes);
        let key = Self(bytes);
        bytes.zeroize();
        result.map_err(|_| CryptoError::InvalidKeyMaterial)?;
        Ok(key)
    }

    /// Hex encoding of the key, wiped on drop.
    #[must_use]
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.0))
    }

    /// Borrows the raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeviceKey(<redacted>)")
    }
}

/// Serialized as a 64-character hex string.
impl Serialize for DeviceKey {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for DeviceKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let hex = Zeroizing::new(String::deserialize(d)?);
        Self::from_hex(&hex).map_err(de::Error::custom)
    }
}

/// Returns a fresh random AEAD nonce.
#[must_use]
pub fn random_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Returns `N` random bytes from the OS RNG.
#[must_use]
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// Encrypts `plaintext` with XChaCha20-Poly1305.
///
/// # Errors
///
/// Returns [`CryptoError::CryptoFailure`] if the cipher rejects the input.
pub fn seal(
    key: &[u8; KEY_LEN],
    nonce: &Nonce,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::CryptoFailure)
}

/// Decrypts and authenticates `ciphertext` with XChaCha20-Poly1305.
///
/// # Errors
///
/// Returns [`CryptoError::CryptoFailure`] on any authentication failure.
///
/// # Examples
///
/// ```
/// use keyferry_proto::crypto;
/// let key = [7u8; 32];
/// let nonce = crypto::random_nonce();
/// let ct = crypto::seal(&key, &nonce, b"hunter2", b"aad").unwrap();
/// let pt = crypto::open(&key, &nonce, &ct, b"aad").unwrap();
/// assert_eq!(&pt[..], b"hunter2");
/// assert!(crypto::open(&key, &nonce, &ct, b"other").is_err());
/// ```
pub fn open(
    key: &[u8; KEY_LEN],
    nonce: &Nonce,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::CryptoFailure)
}

// ── Pairing KEM ─────────────────────────────────────────────────────────────

/// An ephemeral ML-KEM-768 keypair held by the agent for one pairing.
pub struct KemKeypair {
    secret: DecapsulationKey,
    public: Vec<u8>,
}

impl KemKeypair {
    /// Generates a fresh keypair.
    #[must_use]
    pub fn generate() -> Self {
        let (secret, public) = MlKem768::generate(&mut OsRng);
        Self {
            secret,
            public: public.as_bytes().as_slice().to_vec(),
        }
    }

    /// Encoded public (encapsulation) key.
    #[must_use]
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// Recovers the shared secret from a KEM ciphertext.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] if the ciphertext has the
    /// wrong length and [`CryptoError::CryptoFailure`] if decapsulation fails.
    pub fn decapsulate(
        &self,
        kem_ciphertext: &[u8],
    ) -> Result<Zeroizing<[u8; KEM_SHARED_SECRET_LEN]>, CryptoError> {
        let ct = ml_kem::Ciphertext::<MlKem768>::try_from(kem_ciphertext)
            .map_err(|_| CryptoError::InvalidKeyMaterial)?;
        let ss = self
            .secret
            .decapsulate(&ct)
            .map_err(|_| CryptoError::CryptoFailure)?;
        let mut out = Zeroizing::new([0u8; KEM_SHARED_SECRET_LEN]);
        out.copy_from_slice(ss.as_slice());
        Ok(out)
    }
}

impl fmt::Debug for KemKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KemKeypair")
            .field("fingerprint", &fingerprint(&self.public))
            .finish_non_exhaustive()
    }
}

/// Encapsulates a fresh shared secret to an encoded ML-KEM-768 public key.
///
/// Returns `(kem_ciphertext, shared_secret)`.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKeyMaterial`] if `public_key` has the wrong
/// length.
pub fn encapsulate(
    public_key: &[u8],
) -> Result<(Vec<u8>, Zeroizing<[u8; KEM_SHARED_SECRET_LEN]>), CryptoError> {
    let encoded = ml_kem::Encoded::<EncapsulationKey>::try_from(public_key)
        .map_err(|_| CryptoError::InvalidKeyMaterial)?;
    let ek = EncapsulationKey::from_bytes(&encoded);
    let (ct, ss) = ek
        .encapsulate(&mut OsRng)
        .map_err(|_| CryptoError::CryptoFailure)?;
    let mut out = Zeroizing::new([0u8; KEM_SHARED_SECRET_LEN]);
    out.copy_from_slice(ss.as_slice());
    Ok((ct.as_slice().to_vec(), out))
}

/// Derives the pairing AEAD key from the KEM shared secret and the pairing
/// token, so the key proves possession of both.
#[must_use]
pub fn derive_pairing_key(
    shared_secret: &[u8; KEM_SHARED_SECRET_LEN],
    token: &[u8; PAIRING_TOKEN_LEN],
) -> Zeroizing<[u8; KEY_LEN]> {
    let hk = Hkdf::<Sha256>::new(Some(token.as_slice()), shared_secret.as_slice());
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    // 32 bytes is far below the HKDF-SHA256 output limit of 255 * 32.
    if hk.expand(PAIRING_KDF_INFO, &mut okm[..]).is_err() {
        okm.zeroize();
    }
    okm
}

/// Short hex fingerprint of a KEM public key for out-of-band comparison.
#[must_use]
pub fn fingerprint(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..16])
}

/// Short printable id derived from a pairing token. Safe to log and display.
///
/// # Examples
///
/// ```
/// let id = keyferry_proto::crypto::token_id(&[1u8; 16]);
/// assert_eq!(id, keyferry_proto::crypto::token_id(&[1u8; 16]));
/// assert_ne!(id, keyferry_proto::crypto::token_id(&[2u8; 16]));
/// ```
#[must_use]
pub fn token_id(token: &[u8; PAIRING_TOKEN_LEN]) -> String {
    let digest = Sha256::digest(token);
    base58::encode(&digest[..6])
}

/// Compares two byte strings without an early exit.
///
/// Lengths are public; contents are folded with XOR into one accumulator so
/// timing does not depend on where the first difference is.
#[must_use]
#[inline(never)]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    std::hint::black_box(acc) == 0
}

/// Returns the current Unix time in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch.
#[must_use]
pub fn unix_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
