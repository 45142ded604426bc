use keyferry_proto::envelope::EnvelopeError;
use keyferry_proto::pairing::PairWireError;
use keyferry_proto::CryptoError;
use thiserror::Error;

/// Errors raised by the companion client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Key agreement or AEAD failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    /// A pairing message could not be encoded, decoded or opened.
    #[error("pairing wire error: {0}")]
    Wire(#[from] PairWireError),
    /// A message frame could not be sealed.
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
    /// The agent answered the handshake with an error code.
    #[error("agent refused pairing: {0}")]
    PairingRefused(String),
    /// The agent sent a message out of order.
    #[error("unexpected {0} message from agent")]
    UnexpectedMessage(&'static str),
    /// The agent did not return a usable key.
    #[error("agent returned no device key")]
    MissingKey,
    /// The reply line was not valid JSON.
    #[error("invalid reply: {0}")]
    InvalidReply(String),
    /// A pairing URI could not be parsed.
    #[error("invalid pairing uri: {0}")]
    InvalidUri(String),
    /// The credentials file is missing, unreadable or unsafe.
    #[error("credentials: {0}")]
    Credentials(String),
    /// A deadline elapsed.
    #[error("timed out during {0}")]
    Timeout(&'static str),
    /// The agent closed the connection.
    #[error("connection closed by agent")]
    ConnectionClosed,
}
