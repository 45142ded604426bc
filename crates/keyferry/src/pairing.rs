//! Companion side of the pairing handshake.

use crate::error::ClientError;
use keyferry_proto::crypto;
use keyferry_proto::pairing::{
    self as wire, error_code, PairMessage, RegisterBlob, ACK_AAD, MAX_LINE_LEN, REGISTER_AAD,
};
use keyferry_proto::stream::{read_frame, read_line, write_frame, MAX_FRAME_SIZE};
use keyferry_proto::types::{NONCE_LEN, PROTOCOL_VERSION};
use keyferry_proto::{base58, DeviceKey};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};
use zeroize::Zeroizing;

const URI_PREFIX: &str = "keyferry://pair?";

/// Contents of a `keyferry://pair?host=..&port=..&token=..&id=..` URI.
#[derive(Clone, PartialEq, Eq)]
pub struct PairingUri {
    /// Agent host.
    pub host: String,
    /// Agent port.
    pub port: u16,
    /// Base58 pairing token.
    pub token: Zeroizing<String>,
    /// Token id, for comparison with the agent's `server_hello`.
    pub token_id: Option<String>,
}

impl std::fmt::Debug for PairingUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingUri")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("token_id", &self.token_id)
            .finish_non_exhaustive()
    }
}

impl PairingUri {
    /// Parses a pairing URI.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidUri`] if the scheme is wrong or `host`,
    /// `port` or `token` is missing or malformed.
    pub fn parse(uri: &str) -> Result<Self, ClientError> {
        let query = uri
            .trim()
            .strip_prefix(URI_PREFIX)
            .ok_or_else(|| ClientError::InvalidUri(format!("expected {URI_PREFIX}...")))?;

        let (mut host, mut port, mut token, mut token_id) = (None, None, None, None);
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| ClientError::InvalidUri(format!("malformed parameter {pair:?}")))?;
            match k {
                "host" => host = Some(v.to_string()),
                "port" => {
                    port = Some(v.parse::<u16>().map_err(|_| {
                        ClientError::InvalidUri(format!("invalid port {v:?}"))
                    })?);
                }
                "token" => token = Some(Zeroizing::new(v.to_string())),
                "id" => token_id = Some(v.to_string()),
                _ => debug!(key = k, "ignoring unknown pairing uri parameter"),
            }
        }

        let host = host
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ClientError::InvalidUri("missing host".into()))?;
        let port = port.ok_or_else(|| ClientError::InvalidUri("missing port".into()))?;
        let token = token.ok_or_else(|| ClientError::InvalidUri("missing token".into()))?;
        base58::decode_token(&token)
            .map_err(|e| ClientError::InvalidUri(format!("token: {e}")))?;

        Ok(Self {
            host,
            port,
            token,
            token_id,
        })
    }

    /// `host:port` suitable for `TcpStream::connect`.
    #[must_use]
    pub fn agent_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// What the companion asks the agent to register.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    /// Requested device id; the agent assigns one when `None`.
    pub device_id: Option<String>,
    /// Proposed key; the agent generates one when `None`.
    pub device_key: Option<DeviceKey>,
}

/// Result of a completed handshake.
#[derive(Debug, Clone)]
pub struct Paired {
    /// Device id the agent registered.
    pub device_id: String,
    /// Key to seal every later message with.
    pub key: DeviceKey,
    /// Fingerprint of the agent's ephemeral KEM key.
    pub fingerprint: String,
}

async fn step<T, E, F>(deadline: Duration, what: &'static str, fut: F) -> Result<T, ClientError>
where
    F: Future<Output = Result<T, E>>,
    ClientError: From<E>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result.map_err(ClientError::from),
        Err(_) => Err(ClientError::Timeout(what)),
    }
}

/// Runs the handshake over a stream already routed to `/pair`.
///
/// # Errors
///
/// Returns [`ClientError::PairingRefused`] with the agent's code if it
/// refuses, and other variants for transport, crypto or timeout failures.
pub async fn pair<S>(
    stream: S,
    token: &str,
    registration: Registration,
    deadline: Duration,
) -> Result<Paired, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let token_bytes = base58::decode_token(token)
        .map_err(|e| ClientError::InvalidUri(format!("token: {e}")))?;
    let mut stream = BufReader::new(stream);

    let hello = PairMessage::hello(token).to_line()?;
    step(deadline, "hello", stream.write_all(&hello)).await?;
    step(deadline, "hello", stream.flush()).await?;

    let line = step(deadline, "server hello", read_line(&mut stream, MAX_LINE_LEN))
        .await?
        .ok_or(ClientError::ConnectionClosed)?;
    let server_hello = PairMessage::from_line(&line)?;
    let (kem_pk, fingerprint) = match &server_hello {
        PairMessage::ServerHello {
            kem_pk,
            fingerprint,
            token_id,
            ..
        } => {
            debug!(token_id = %token_id, "agent accepted pairing token");
            (
                wire::decode_kem_public_key(kem_pk, fingerprint)?,
                fingerprint.clone(),
            )
        }
        PairMessage::Error { code, .. } => return Err(ClientError::PairingRefused(code.clone())),
        other => return Err(ClientError::UnexpectedMessage(other.op())),
    };

    let (kem_ciphertext, shared) = crypto::encapsulate(&kem_pk)?;
    let key = crypto::derive_pairing_key(&shared, &token_bytes);

    let register = PairMessage::Register {
        v: PROTOCOL_VERSION,
        device_id: registration.device_id.clone(),
        device_key_hex: registration
            .device_key
            .as_ref()
            .map(|k| k.to_hex().to_string()),
    };
    let sealed = wire::seal_message(&key, REGISTER_AAD, &register)?;
    drop(register);
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let mut n = [0u8; NONCE_LEN];
    n.copy_from_slice(nonce);
    let blob = RegisterBlob {
        kem_ciphertext,
        nonce: n,
        ciphertext: ciphertext.to_vec(),
    };
    step(deadline, "registration", write_frame(&mut stream, &blob.encode())).await?;

    let ack = step(deadline, "pairing ack", read_frame(&mut stream, MAX_FRAME_SIZE))
        .await?
        .ok_or(ClientError::ConnectionClosed)?;
    let ack = wire::open_message(&key, ACK_AAD, &ack)?;
    match &ack {
        PairMessage::Ok {
            device_id,
            device_key_hex,
            ..
        } => {
            let key = match (device_key_hex, registration.device_key) {
                (Some(hex), _) => DeviceKey::from_hex(hex)?,
                (None, Some(proposed)) => proposed,
                (None, None) => return Err(ClientError::MissingKey),
            };
            info!(device_id = %device_id, fingerprint = %fingerprint, "paired with agent");
            Ok(Paired {
                device_id: device_id.clone(),
                key,
                fingerprint,
            })
        }
        PairMessage::Error { code, .. } => Err(ClientError::PairingRefused(code.clone())),
        other => Err(ClientError::UnexpectedMessage(other.op())),
    }
}

/// Whether a refusal means the operator must issue a new token.
#[must_use]
pub fn needs_new_token(err: &ClientError) -> bool {
    matches!(
        err,
        ClientError::PairingRefused(code)
            if code == error_code::NOT_ACTIVE || code == error_code::EXPIRED
    )
}
