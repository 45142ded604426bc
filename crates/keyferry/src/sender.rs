//! Sends sealed messages to a paired agent over `/msg`.

use crate::credentials::Credentials;
use crate::error::ClientError;
use keyferry_proto::crypto::unix_now_ms;
use keyferry_proto::envelope::seal_message;
use keyferry_proto::stream::{read_line, write_frame};
use keyferry_proto::types::{reply_status, MsgType, PREAMBLE_MAGIC, ROUTE_MSG, ROUTE_PAIR};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

const MAX_REPLY_LEN: usize = 1024;

/// One reply line from the agent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentReply {
    /// `ok`, `clipboard`, `denied`, `rate_limited` or `rejected`.
    pub status: String,
    /// Machine-readable detail, when present.
    #[serde(default)]
    pub reason: Option<String>,
}

impl AgentReply {
    /// The request took effect as asked.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == reply_status::OK
    }

    /// The agent took the request but degraded it.
    #[must_use]
    pub fn is_clipboard(&self) -> bool {
        self.status == reply_status::CLIPBOARD
    }
}

impl std::fmt::Display for AgentReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{} ({reason})", self.status),
            None => f.write_str(&self.status),
        }
    }
}

/// Body of an arm or approve message.
#[derive(Debug, Serialize)]
struct ControlBody {
    ttl_ms: u64,
}

/// Control payload for `Arm` and `Approve`. Empty means the agent default.
#[must_use]
pub fn control_payload(ttl: Option<Duration>) -> Vec<u8> {
    ttl.map(|t| {
        let ttl_ms = u64::try_from(t.as_millis()).unwrap_or(u64::MAX);
        serde_json::to_vec(&ControlBody { ttl_ms }).unwrap_or_default()
    })
    .unwrap_or_default()
}

/// Opens a TCP connection and writes the preamble for `route`.
///
/// # Errors
///
/// Returns an error if the connection or preamble write does not complete
/// within `deadline`.
pub async fn connect(addr: &str, route: &str, deadline: Duration) -> Result<TcpStream, ClientError> {
    let mut stream = tokio::time::timeout(deadline, TcpStream::connect(addr))
        .await
        .map_err(|_| ClientError::Timeout("connect"))??;
    stream.set_nodelay(true)?;
    let preamble = format!("{PREAMBLE_MAGIC} {route}\n");
    tokio::time::timeout(deadline, stream.write_all(preamble.as_bytes()))
        .await
        .map_err(|_| ClientError::Timeout("preamble"))??;
    debug!(addr, route, "connected to agent");
    Ok(stream)
}

/// Opens a connection routed to the pairing handler.
///
/// # Errors
///
/// See [`connect`].
pub async fn connect_pair(addr: &str, deadline: Duration) -> Result<TcpStream, ClientError> {
    connect(addr, ROUTE_PAIR, deadline).await
}

/// A `/msg` session with one agent. Frames are answered in order, so a
/// session may carry several messages.
pub struct Sender<S> {
    stream: BufReader<S>,
    credentials: Credentials,
    deadline: Duration,
}

impl Sender<TcpStream> {
    /// Connects to the agent named in `credentials`.
    ///
    /// # Errors
    ///
    /// See [`connect`].
    pub async fn connect(credentials: Credentials, deadline: Duration) -> Result<Self, ClientError> {
        let stream = connect(&credentials.agent, ROUTE_MSG, deadline).await?;
        Ok(Self::new(stream, credentials, deadline))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Sender<S> {
    /// Wraps a stream that is already routed to `/msg`.
    pub fn new(stream: S, credentials: Credentials, deadline: Duration) -> Self {
        Self {
            stream: BufReader::new(stream),
            credentials,
            deadline,
        }
    }

    /// Seals `payload` as `msg_type`, sends it and waits for the reply.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionClosed`] if the agent drops the
    /// connection instead of replying, which it does for malformed frames.
    pub async fn send(&mut self, msg_type: MsgType, payload: &[u8]) -> Result<AgentReply, ClientError> {
        let frame = seal_message(
            self.credentials.key.as_bytes(),
            &self.credentials.device_id,
            msg_type,
            payload,
            unix_now_ms(),
        )?;
        self.send_raw(&frame).await
    }

    /// Sends an already-encoded frame and waits for the reply.
    ///
    /// # Errors
    ///
    /// See [`Sender::send`].
    pub async fn send_raw(&mut self, frame: &[u8]) -> Result<AgentReply, ClientError> {
        tokio::time::timeout(self.deadline, write_frame(&mut self.stream, frame))
            .await
            .map_err(|_| ClientError::Timeout("frame write"))??;
        let line = tokio::time::timeout(self.deadline, read_line(&mut self.stream, MAX_REPLY_LEN))
            .await
            .map_err(|_| ClientError::Timeout("reply"))??
            .ok_or(ClientError::ConnectionClosed)?;
        serde_json::from_slice(&line).map_err(|e| ClientError::InvalidReply(e.to_string()))
    }

    /// Credentials this session seals with.
    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }
}
