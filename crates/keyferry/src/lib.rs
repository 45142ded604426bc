//! keyferry companion: pairs with a desktop agent and sends it secrets.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI parsing.
pub mod config;
/// Stored pairing result.
pub mod credentials;
/// Error types for client operations.
pub mod error;
pub mod pairing;
pub mod sender;

pub use credentials::Credentials;
pub use error::ClientError;
