//! One-time pairing tokens and the agent side of the pairing handshake.

use crate::error::{AgentError, PairingError};
use crate::metrics::counters;
use crate::registry::DeviceRecord;
use crate::server::AgentState;
use keyferry_proto::crypto::{self, KemKeypair};
use keyferry_proto::pairing::{
    self as wire, error_code, PairMessage, RegisterBlob, ACK_AAD, MAX_LINE_LEN, REGISTER_AAD,
};
use keyferry_proto::stream::{read_frame, read_line, write_frame, MAX_FRAME_SIZE};
use keyferry_proto::types::{KEY_LEN, PAIRING_TOKEN_LEN, PROTOCOL_VERSION};
use keyferry_proto::{base58, DeviceKey};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Longest device id accepted from a client at pairing time.
pub const MAX_PAIRED_DEVICE_ID_LEN: usize = 128;

/// A token handed to the operator for display.
#[derive(Clone)]
pub struct IssuedToken {
    /// Base58 token to embed in the pairing URI or QR code.
    pub token: Zeroizing<String>,
    /// Short id safe to log.
    pub token_id: String,
    /// Expiry, Unix milliseconds.
    pub expires_at_ms: u64,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("token_id", &self.token_id)
            .field("expires_at_ms", &self.expires_at_ms)
            .finish_non_exhaustive()
    }
}

struct TokenSlot {
    bytes: Zeroizing<[u8; PAIRING_TOKEN_LEN]>,
    token_id: String,
    expires_at_ms: u64,
    consumed: bool,
}

impl TokenSlot {
    fn is_live(&self, now_ms: u64) -> bool {
        !self.consumed && now_ms < self.expires_at_ms
    }
}

/// The process-wide pairing token.
///
/// States: empty, active until expiry, then consumed or expired. Issuing while
/// a token is live returns that token; issuing afterwards replaces it.
#[derive(Default)]
pub struct PairingTokens {
    slot: Mutex<Option<TokenSlot>>,
}

impl PairingTokens {
    /// Creates an empty token slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a token valid for `ttl_ms`, or returns the live one.
    pub fn issue(&self, now_ms: u64, ttl_ms: u64) -> IssuedToken {
        let mut slot = self.lock();
        if let Some(live) = slot.as_ref().filter(|s| s.is_live(now_ms)) {
            return IssuedToken {
                token: Zeroizing::new(base58::encode(live.bytes.as_slice())),
                token_id: live.token_id.clone(),
                expires_at_ms: live.expires_at_ms,
            };
        }

        let bytes = Zeroizing::new(crypto::random_bytes::<PAIRING_TOKEN_LEN>());
        let token_id = crypto::token_id(&bytes);
        let expires_at_ms = now_ms.saturating_add(ttl_ms);
        let issued = IssuedToken {
            token: Zeroizing::new(base58::encode(bytes.as_slice())),
            token_id: token_id.clone(),
            expires_at_ms,
        };
        *slot = Some(TokenSlot {
            bytes,
            token_id,
            expires_at_ms,
            consumed: false,
        });
        info!(token_id = %issued.token_id, expires_at_ms, "pairing token issued");
        issued
    }

    /// Consumes the live token if `presented` matches it.
    ///
    /// A mismatch leaves the token live.
    ///
    /// # Errors
    ///
    /// Returns [`PairingError::NotActive`] if no token was issued or it was
    /// already consumed, [`PairingError::Expired`] after its TTL, and
    /// [`PairingError::Unauthorized`] on a mismatch.
    pub fn consume(
        &self,
        presented: &[u8],
        now_ms: u64,
    ) -> Result<(Zeroizing<[u8; PAIRING_TOKEN_LEN]>, String), PairingError> {
        let mut slot = self.lock();
        let Some(active) = slot.as_mut() else {
            return Err(PairingError::NotActive);
        };
        if active.consumed {
            return Err(PairingError::NotActive);
        }
        if now_ms >= active.expires_at_ms {
            return Err(PairingError::Expired);
        }
        if !crypto::ct_eq(active.bytes.as_slice(), presented) {
            return Err(PairingError::Unauthorized);
        }
        active.consumed = true;
        Ok((active.bytes.clone(), active.token_id.clone()))
    }

    /// Id of the live token, if any.
    #[must_use]
    pub fn active_id(&self, now_ms: u64) -> Option<String> {
        self.lock()
            .as_ref()
            .filter(|s| s.is_live(now_ms))
            .map(|s| s.token_id.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<TokenSlot>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn step<T, F>(deadline: Duration, what: &'static str, fut: F) -> Result<T, AgentError>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| AgentError::Timeout(what))?
        .map_err(AgentError::Io)
}

/// Runs the agent side of the pairing handshake on an already-routed stream.
///
/// Returns the registered device id.
///
/// # Errors
///
/// Returns [`AgentError`] on any handshake failure. The client is sent an
/// `error` message where the channel still allows it.
pub async fn handle_pairing<S>(
    stream: S,
    peer: SocketAddr,
    state: &AgentState,
) -> Result<String, AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = run_handshake(BufReader::new(stream), peer, state).await;
    let status = match &result {
        Ok(_) => "paired",
        Err(AgentError::Pairing(e)) => e.code(),
        Err(e) => e.label(),
    };
    counters::pairings_total(status);
    result
}

async fn run_handshake<S>(
    mut stream: BufReader<S>,
    peer: SocketAddr,
    state: &AgentState,
) -> Result<String, AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = state.config.pair_timeout;

    let line = step(deadline, "pairing hello", read_line(&mut stream, MAX_LINE_LEN))
        .await?
        .ok_or(AgentError::ConnectionClosed)?;
    let hello = match PairMessage::from_line(&line) {
        Ok(msg) => msg,
        Err(e) => return reject_plain(&mut stream, deadline, e.into()).await,
    };
    let PairMessage::Hello { token, .. } = &hello else {
        let e = PairingError::UnexpectedMessage(hello.op());
        return reject_plain(&mut stream, deadline, e).await;
    };

    let presented = match base58::decode_token(token) {
        Ok(t) => t,
        Err(_) => return reject_plain(&mut stream, deadline, PairingError::Unauthorized).await,
    };
    let (token_bytes, token_id) = match state.pairing.consume(presented.as_slice(), state.clock.now_ms()) {
        Ok(t) => t,
        Err(e) => {
            warn!(peer = %peer, error = %e, "pairing attempt refused");
            return reject_plain(&mut stream, deadline, e).await;
        }
    };
    info!(peer = %peer, token_id = %token_id, "pairing token consumed");

    let kem = KemKeypair::generate();
    let server_hello = PairMessage::server_hello(kem.public_key(), &token_id);
    let line = server_hello.to_line().map_err(PairingError::from)?;
    step(deadline, "server hello", stream.write_all(&line)).await?;
    step(deadline, "server hello", stream.flush()).await?;

    let blob = step(deadline, "registration", read_frame(&mut stream, MAX_FRAME_SIZE))
        .await?
        .ok_or(AgentError::ConnectionClosed)?;
    let blob = RegisterBlob::decode(&blob).map_err(PairingError::from)?;
    let shared = kem
        .decapsulate(&blob.kem_ciphertext)
        .map_err(|_| AgentError::CryptoFailure)?;
    let key = crypto::derive_pairing_key(&shared, &token_bytes);
    let register = wire::open_parts(&key, REGISTER_AAD, &blob.nonce, &blob.ciphertext).map_err(
        |e| match e {
            wire::PairWireError::Crypto(_) => AgentError::CryptoFailure,
            other => PairingError::from(other).into(),
        },
    )?;

    let (device_id, device_key, generated) = match choose_registration(&register, state) {
        Ok(choice) => choice,
        Err(e) => return reject_sealed(&mut stream, deadline, &key, e.code(), e.into()).await,
    };

    let record = DeviceRecord {
        device_id: device_id.clone(),
        key: device_key.clone(),
        created_at_ms: state.clock.now_ms(),
    };
    let registry = state.registry.clone();
    let persisted = tokio::task::spawn_blocking(move || registry.upsert(record))
        .await
        .map_err(|e| AgentError::StorageUnavailable(e.to_string()))?;
    if let Err(e) = persisted {
        warn!(peer = %peer, device_id = %device_id, error = %e, "device store write failed");
        return reject_sealed(
            &mut stream,
            deadline,
            &key,
            error_code::STORAGE_UNAVAILABLE,
            e.into(),
        )
        .await;
    }

    state.health.set_paired_devices(state.registry.len());

    let ack = PairMessage::Ok {
        v: PROTOCOL_VERSION,
        device_id: device_id.clone(),
        device_key_hex: generated.then(|| device_key.to_hex().to_string()),
    };
    let sealed = wire::seal_message(&key, ACK_AAD, &ack).map_err(PairingError::from)?;
    step(deadline, "pairing ack", write_frame(&mut stream, &sealed)).await?;

    info!(peer = %peer, device_id = %device_id, key_generated = generated, "device paired");
    Ok(device_id)
}

/// Picks the device id and key for a registration.
///
/// The key flag is `true` when the agent generated the key and must return it.
fn choose_registration(
    register: &PairMessage,
    state: &AgentState,
) -> Result<(String, DeviceKey, bool), PairingError> {
    let PairMessage::Register {
        device_id,
        device_key_hex,
        ..
    } = register
    else {
        return Err(PairingError::UnexpectedMessage(register.op()));
    };

    let device_id = match device_id {
        Some(id) => {
            validate_device_id(id)?;
            id.clone()
        }
        None => format!("dev-{}", hex::encode(crypto::random_bytes::<6>())),
    };

    let exists = state.registry.contains(&device_id);
    if state.config.rotate_on_repair && exists {
        debug!(device_id = %device_id, "rotating key for re-paired device");
        return Ok((device_id, DeviceKey::generate(), true));
    }
    match device_key_hex {
        Some(hex) => {
            let key = DeviceKey::from_hex(hex)
                .map_err(|_| PairingError::InvalidRegistration("device key must be 32 bytes hex"))?;
            if key.as_bytes() == &[0u8; KEY_LEN] {
                return Err(PairingError::InvalidRegistration("device key is all zeros"));
            }
            Ok((device_id, key, false))
        }
        None => Ok((device_id, DeviceKey::generate(), true)),
    }
}

fn validate_device_id(id: &str) -> Result<(), PairingError> {
    if id.is_empty() || id.len() > MAX_PAIRED_DEVICE_ID_LEN {
        return Err(PairingError::InvalidRegistration("device id length"));
    }
    if id.chars().any(char::is_control) {
        return Err(PairingError::InvalidRegistration("device id has control characters"));
    }
    Ok(())
}

async fn reject_plain<S, T>(
    stream: &mut BufReader<S>,
    deadline: Duration,
    err: PairingError,
) -> Result<T, AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Ok(line) = PairMessage::error(err.code()).to_line() {
        let _ = tokio::time::timeout(deadline, async {
            stream.write_all(&line).await?;
            stream.flush().await
        })
        .await;
    }
    Err(err.into())
}

async fn reject_sealed<S, T>(
    stream: &mut BufReader<S>,
    deadline: Duration,
    key: &[u8; KEY_LEN],
    code: &str,
    err: AgentError,
) -> Result<T, AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Ok(sealed) = wire::seal_message(key, ACK_AAD, &PairMessage::error(code)) {
        let _ = tokio::time::timeout(deadline, write_frame(stream, &sealed)).await;
    }
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_is_idempotent_while_live() {
        let tokens = PairingTokens::new();
        let a = tokens.issue(0, 1_000);
        let b = tokens.issue(500, 1_000);
        assert_eq!(*a.token, *b.token);
        assert_eq!(a.expires_at_ms, b.expires_at_ms);
    }

    #[test]
    fn issue_replaces_expired_token() {
        let tokens = PairingTokens::new();
        let a = tokens.issue(0, 1_000);
        let b = tokens.issue(1_000, 1_000);
        assert_ne!(*a.token, *b.token);
        assert_eq!(b.expires_at_ms, 2_000);
    }

    #[test]
    fn consume_is_single_use() {
        let tokens = PairingTokens::new();
        let issued = tokens.issue(0, 1_000);
        let raw = base58::decode_token(&issued.token).unwrap();
        let (bytes, id) = tokens.consume(raw.as_slice(), 10).unwrap();
        assert_eq!(*bytes, *raw);
        assert_eq!(id, issued.token_id);
        assert!(matches!(
            tokens.consume(raw.as_slice(), 11),
            Err(PairingError::NotActive)
        ));
    }

    #[test]
    fn issue_after_consume_replaces_token() {
        let tokens = PairingTokens::new();
        let a = tokens.issue(0, 1_000);
        let raw = base58::decode_token(&a.token).unwrap();
        tokens.consume(raw.as_slice(), 1).unwrap();
        let b = tokens.issue(2, 1_000);
        assert_ne!(*a.token, *b.token);
    }

    #[test]
    fn consume_without_issue_is_not_active() {
        let tokens = PairingTokens::new();
        assert!(matches!(
            tokens.consume(&[0u8; PAIRING_TOKEN_LEN], 0),
            Err(PairingError::NotActive)
        ));
    }

    #[test]
    fn expired_token_reports_expired() {
        let tokens = PairingTokens::new();
        let issued = tokens.issue(0, 1_000);
        let raw = base58::decode_token(&issued.token).unwrap();
        assert!(matches!(
            tokens.consume(raw.as_slice(), 1_000),
            Err(PairingError::Expired)
        ));
        assert!(tokens.active_id(1_000).is_none());
    }

    #[test]
    fn wrong_token_is_unauthorized_and_keeps_token_live() {
        let tokens = PairingTokens::new();
        let issued = tokens.issue(0, 1_000);
        assert!(matches!(
            tokens.consume(&[0xEE; PAIRING_TOKEN_LEN], 1),
            Err(PairingError::Unauthorized)
        ));
        assert_eq!(tokens.active_id(2), Some(issued.token_id));
    }

    #[test]
    fn device_id_validation() {
        assert!(validate_device_id("phone-1").is_ok());
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id(&"x".repeat(MAX_PAIRED_DEVICE_ID_LEN + 1)).is_err());
        assert!(validate_device_id("bad\nid").is_err());
    }
}
