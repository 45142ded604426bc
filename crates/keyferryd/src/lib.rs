//! keyferry desktop agent: receives secrets from paired phones over the LAN
//! and types them into the focused control.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Injector, clipboard and focus adapters.
pub mod capabilities;
/// Injectable time source.
pub mod clock;
/// CLI argument parsing and agent configuration.
pub mod config;
mod connection;
/// Frame handling and reply mapping.
pub mod dispatcher;
/// Error types for agent operations.
pub mod error;
/// Arm, approval and target gates.
pub mod gates;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Pairing tokens and the agent side of the pairing handshake.
pub mod pairing;
mod ratelimit;
/// Paired device keys.
pub mod registry;
mod replay;
/// Preamble detection for new connections.
pub mod router;
/// Accept loop and shared agent state.
pub mod server;
/// Device store backends.
pub mod store;

pub use server::{run, run_with_shutdown, AgentState};
