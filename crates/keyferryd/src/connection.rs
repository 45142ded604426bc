use crate::dispatcher::{dispatch, Reply};
use crate::error::AgentError;
use crate::metrics::{counters, gauges};
use crate::pairing::handle_pairing;
use crate::router::{self, Replayed, Route, PREAMBLE_BUDGET};
use crate::server::AgentState;
use keyferry_proto::stream::{read_frame, MAX_FRAME_SIZE};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Keeps the active-connection gauge honest on every exit path.
struct ActiveConnection;

impl ActiveConnection {
    fn enter() -> Self {
        gauges::inc_connections_active();
        Self
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        gauges::dec_connections_active();
    }
}

/// Serves one accepted connection until the peer hangs up, a timeout fires,
/// or a frame fails in a way that has no reply.
///
/// # Errors
///
/// Returns the error that ended the connection. A clean EOF or idle timeout
/// between frames is `Ok`.
pub async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    state: &AgentState,
) -> Result<(), AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let _active = ActiveConnection::enter();

    let routed = router::detect(&mut stream, PREAMBLE_BUDGET, state.config.preamble_timeout).await?;
    let label = match (routed.route, routed.explicit) {
        (Route::Msg, false) => "legacy",
        (route, _) => route.as_str(),
    };
    counters::connections_total(label);
    debug!(peer = %peer, route = label, "connection routed");

    let stream = Replayed::new(routed.replay, stream);
    match routed.route {
        Route::Pair => {
            if !state.rate_limiter.check(peer.ip(), state.clock.now_ms()) {
                warn!(peer = %peer, "pairing attempt rate limited");
                counters::pairings_total("rate_limited");
                return Err(AgentError::RateLimited);
            }
            handle_pairing(stream, peer, state).await.map(|_| ())
        }
        Route::Msg => message_loop(BufReader::new(stream), peer, state).await,
    }
}

async fn message_loop<S>(
    mut stream: BufReader<S>,
    peer: SocketAddr,
    state: &AgentState,
) -> Result<(), AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = &state.config;
    loop {
        match timeout(config.idle_timeout, stream.fill_buf()).await {
            Err(_) => {
                debug!(peer = %peer, "connection idle, closing");
                return Ok(());
            }
            Ok(buffered) => {
                if buffered?.is_empty() {
                    return Ok(());
                }
            }
        }

        let raw = timeout(config.read_timeout, read_frame(&mut stream, MAX_FRAME_SIZE))
            .await
            .map_err(|_| AgentError::Timeout("frame read"))??
            .ok_or(AgentError::ConnectionClosed)?;

        let reply = match dispatch(state, peer.ip(), &raw).await {
            Ok(reply) => reply,
            Err(e) => match Reply::for_error(&e) {
                Some(reply) => {
                    debug!(peer = %peer, error = %e, status = reply.status, "frame refused");
                    reply
                }
                None => {
                    warn!(peer = %peer, error = %e, "closing connection");
                    return Err(e);
                }
            },
        };

        let line = reply.to_line();
        timeout(config.write_timeout, async {
            stream.write_all(&line).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| AgentError::Timeout("reply write"))??;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{CapabilityError, Capabilities, Injector};
    use crate::clock::ManualClock;
    use crate::config::AgentConfig;
    use crate::registry::{DeviceRecord, DeviceRegistry};
    use crate::store::MemoryStore;
    use keyferry_proto::envelope::seal_message;
    use keyferry_proto::stream::write_frame;
    use keyferry_proto::types::MsgType;
    use keyferry_proto::DeviceKey;
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncReadExt;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Vec<u8>>>);

    impl Injector for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn inject(&self, secret: &[u8]) -> Result<(), CapabilityError> {
            self.0.lock().unwrap().push(secret.to_vec());
            Ok(())
        }
    }

    fn state(key: &DeviceKey) -> (Arc<AgentState>, Arc<Recorder>) {
        let registry = DeviceRegistry::load(Arc::new(MemoryStore::new())).unwrap();
        registry
            .upsert(DeviceRecord {
                device_id: "phone".into(),
                key: key.clone(),
                created_at_ms: 0,
            })
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        let capabilities = Capabilities {
            injector: recorder.clone(),
            clipboard: None,
            focus: None,
        };
        let config = AgentConfig {
            require_arm: false,
            ..AgentConfig::default()
        };
        let clock = Arc::new(ManualClock::new(1_000_000));
        let state = AgentState::new(config, Arc::new(registry), capabilities, clock);
        (Arc::new(state), recorder)
    }

    async fn read_reply(client: &mut tokio::io::DuplexStream) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            client.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        String::from_utf8(line).unwrap()
    }

    #[tokio::test]
    async fn legacy_connection_is_served_without_preamble() {
        let key = DeviceKey::generate();
        let (state, recorder) = state(&key);
        let (mut client, server) = tokio::io::duplex(4096);
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let task = tokio::spawn(async move { handle_connection(server, peer, &state).await });

        let frame = seal_message(key.as_bytes(), "phone", MsgType::Inject, b"hunter2", 1_000_000).unwrap();
        write_frame(&mut client, &frame).await.unwrap();
        assert_eq!(read_reply(&mut client).await, r#"{"status":"ok"}"#);
        drop(client);

        task.await.unwrap().unwrap();
        assert_eq!(recorder.0.lock().unwrap().as_slice(), &[b"hunter2".to_vec()]);
    }

    #[tokio::test]
    async fn rejected_frame_keeps_connection_open() {
        let key = DeviceKey::generate();
        let (state, recorder) = state(&key);
        let (mut client, server) = tokio::io::duplex(4096);
        let peer: SocketAddr = "127.0.0.1:5001".parse().unwrap();
        let task = tokio::spawn(async move { handle_connection(server, peer, &state).await });

        client.write_all(b"KEYFERRY/1 /msg\n").await.unwrap();
        let wrong = DeviceKey::generate();
        let bad = seal_message(wrong.as_bytes(), "phone", MsgType::Inject, b"x", 1_000_000).unwrap();
        write_frame(&mut client, &bad).await.unwrap();
        assert_eq!(read_reply(&mut client).await, r#"{"status":"rejected"}"#);

        let good = seal_message(key.as_bytes(), "phone", MsgType::Inject, b"y", 1_000_000).unwrap();
        write_frame(&mut client, &good).await.unwrap();
        assert_eq!(read_reply(&mut client).await, r#"{"status":"ok"}"#);
        drop(client);

        task.await.unwrap().unwrap();
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_frame_closes_connection() {
        let key = DeviceKey::generate();
        let (state, _recorder) = state(&key);
        let (mut client, server) = tokio::io::duplex(4096);
        let peer: SocketAddr = "127.0.0.1:5002".parse().unwrap();
        let task = tokio::spawn(async move { handle_connection(server, peer, &state).await });

        client.write_all(b"KEYFERRY/1 /msg\n").await.unwrap();
        write_frame(&mut client, &[9, 9, 9]).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, AgentError::Protocol(_)));
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
