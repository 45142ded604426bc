//! Connection preamble detection.
//!
//! A new connection may open with `"KEYFERRY/1 <route>\n"`. When it does, the
//! line is consumed and the route chosen. When it does not (absent, malformed,
//! unknown route, budget or deadline exhausted, early EOF) the connection is
//! treated as legacy `/msg` and every byte read so far is handed back so the
//! message handler sees the stream from its first byte.

use keyferry_proto::types::{PREAMBLE_MAGIC, ROUTE_MSG, ROUTE_PAIR};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Maximum bytes inspected while looking for a preamble.
pub const PREAMBLE_BUDGET: usize = 64;

/// Which handler serves a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Pairing handshake.
    Pair,
    /// Encrypted message frames.
    Msg,
}

impl Route {
    /// Path as written in the preamble.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pair => ROUTE_PAIR,
            Self::Msg => ROUTE_MSG,
        }
    }
}

/// Outcome of preamble detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routed {
    /// Chosen handler.
    pub route: Route,
    /// Whether an explicit preamble was present.
    pub explicit: bool,
    /// Bytes already read that belong to the handler, in order.
    pub replay: Vec<u8>,
}

impl Routed {
    fn legacy(replay: Vec<u8>) -> Self {
        Self {
            route: Route::Msg,
            explicit: false,
            replay,
        }
    }
}

enum Scan {
    NeedMore,
    Legacy,
    Found { route: Route, consumed: usize },
}

fn magic_prefix() -> Vec<u8> {
    let mut m = PREAMBLE_MAGIC.as_bytes().to_vec();
    m.push(b' ');
    m
}

fn scan(buf: &[u8], magic: &[u8]) -> Scan {
    let n = buf.len().min(magic.len());
    if buf[..n] != magic[..n] {
        return Scan::Legacy;
    }
    let Some(nl) = buf.iter().position(|&b| b == b'\n') else {
        return Scan::NeedMore;
    };
    if nl < magic.len() {
        return Scan::Legacy;
    }
    let route = match &buf[magic.len()..nl] {
        r if r == ROUTE_PAIR.as_bytes() => Route::Pair,
        r if r == ROUTE_MSG.as_bytes() => Route::Msg,
        _ => return Scan::Legacy,
    };
    Scan::Found {
        route,
        consumed: nl + 1,
    }
}

/// Reads up to `budget` bytes looking for a preamble, for at most `deadline`.
///
/// # Errors
///
/// Returns an I/O error only if the underlying read fails; every other
/// outcome is a [`Routed`].
pub async fn detect<R>(reader: &mut R, budget: usize, deadline: Duration) -> io::Result<Routed>
where
    R: AsyncRead + Unpin,
{
    let magic = magic_prefix();
    let mut buf = Vec::with_capacity(budget);
    let sleep = tokio::time::sleep(deadline);
    tokio::pin!(sleep);

    loop {
        match scan(&buf, &magic) {
            Scan::Legacy => return Ok(Routed::legacy(buf)),
            Scan::Found { route, consumed } => {
                return Ok(Routed {
                    route,
                    explicit: true,
                    replay: buf.split_off(consumed),
                })
            }
            Scan::NeedMore => {}
        }
        if buf.len() >= budget {
            return Ok(Routed::legacy(buf));
        }

        let mut chunk = [0u8; PREAMBLE_BUDGET];
        let want = (budget - buf.len()).min(chunk.len());
        tokio::select! {
            read = reader.read(&mut chunk[..want]) => {
                let n = read?;
                if n == 0 {
                    return Ok(Routed::legacy(buf));
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            () = &mut sleep => return Ok(Routed::legacy(buf)),
        }
    }
}

/// A stream that yields `prefix` before reading from `inner`. Writes go
/// straight to `inner`.
pub struct Replayed<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> Replayed<S> {
    /// Wraps `inner`, replaying `prefix` first.
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Replayed<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let n = (this.prefix.len() - this.pos).min(buf.remaining());
            buf.put_slice(&this.prefix[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Replayed<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const LONG: Duration = Duration::from_secs(5);

    async fn route_bytes(input: &[u8]) -> Routed {
        let mut r = input;
        detect(&mut r, PREAMBLE_BUDGET, LONG).await.unwrap()
    }

    #[tokio::test]
    async fn pair_preamble_is_consumed() {
        let routed = route_bytes(b"KEYFERRY/1 /pair\n{\"op\":\"hello\"").await;
        assert_eq!(routed.route, Route::Pair);
        assert!(routed.explicit);
        assert_eq!(routed.replay, b"{\"op\":\"hello\"");
    }

    #[tokio::test]
    async fn msg_preamble_is_consumed() {
        let routed = route_bytes(b"KEYFERRY/1 /msg\n\x00\x00\x00\x05").await;
        assert_eq!(routed.route, Route::Msg);
        assert!(routed.explicit);
        assert_eq!(routed.replay, b"\x00\x00\x00\x05");
    }

    #[tokio::test]
    async fn legacy_bytes_are_replayed_in_full() {
        let input = b"\x00\x00\x00\x30\x01\x01\x00\x05phone";
        let routed = route_bytes(input).await;
        assert_eq!(routed.route, Route::Msg);
        assert!(!routed.explicit);
        assert_eq!(routed.replay, input);
    }

    #[tokio::test]
    async fn unknown_route_falls_back_with_all_bytes() {
        let input = b"KEYFERRY/1 /admin\nrest";
        let routed = route_bytes(input).await;
        assert_eq!(routed.route, Route::Msg);
        assert!(!routed.explicit);
        assert_eq!(routed.replay, input);
    }

    #[tokio::test]
    async fn budget_exhaustion_falls_back() {
        let mut input = b"KEYFERRY/1 /".to_vec();
        input.extend(std::iter::repeat(b'x').take(100));
        let routed = route_bytes(&input).await;
        assert!(!routed.explicit);
        assert_eq!(routed.replay, &input[..PREAMBLE_BUDGET]);
    }

    #[tokio::test]
    async fn early_eof_returns_partial_bytes() {
        let routed = route_bytes(b"KEYFER").await;
        assert!(!routed.explicit);
        assert_eq!(routed.replay, b"KEYFER");
    }

    #[tokio::test]
    async fn deadline_returns_partial_bytes() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"KEYFERRY/1").await.unwrap();
        let routed = detect(&mut server, PREAMBLE_BUDGET, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!routed.explicit);
        assert_eq!(routed.replay, b"KEYFERRY/1");
        drop(client);
    }

    #[tokio::test]
    async fn split_preamble_is_reassembled() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let task = tokio::spawn(async move {
            detect(&mut server, PREAMBLE_BUDGET, LONG).await.unwrap()
        });
        client.write_all(b"KEYFERRY/1 /pa").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.write_all(b"ir\n").await.unwrap();
        let routed = task.await.unwrap();
        assert_eq!(routed.route, Route::Pair);
        assert!(routed.replay.is_empty());
    }

    #[tokio::test]
    async fn replayed_yields_prefix_then_inner() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b" world").await.unwrap();
        drop(client);
        let mut stream = Replayed::new(b"hello".to_vec(), server);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn replayed_writes_pass_through() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut stream = Replayed::new(b"ignored".to_vec(), server);
        stream.write_all(b"reply\n").await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply\n");
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        fn rebuild(input: &[u8]) -> (Routed, Vec<u8>) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let mut rest = input;
            let routed = rt
                .block_on(detect(&mut rest, PREAMBLE_BUDGET, LONG))
                .unwrap();
            let mut seen = Vec::new();
            if routed.explicit {
                let line = format!("{PREAMBLE_MAGIC} {}\n", routed.route.as_str());
                seen.extend_from_slice(line.as_bytes());
            }
            seen.extend_from_slice(&routed.replay);
            seen.extend_from_slice(rest);
            (routed, seen)
        }

        proptest! {
            #[test]
            fn no_bytes_are_lost(input in proptest::collection::vec(any::<u8>(), 0..256)) {
                let (_, seen) = rebuild(&input);
                prop_assert_eq!(seen, input);
            }

            #[test]
            fn preamble_is_stripped_before_any_body(
                pair in any::<bool>(),
                body in proptest::collection::vec(any::<u8>(), 0..128),
            ) {
                let route = if pair { ROUTE_PAIR } else { ROUTE_MSG };
                let mut input = format!("{PREAMBLE_MAGIC} {route}\n").into_bytes();
                input.extend_from_slice(&body);
                let (routed, seen) = rebuild(&input);
                prop_assert!(routed.explicit);
                prop_assert_eq!(routed.route == Route::Pair, pair);
                prop_assert_eq!(seen, input);
            }
        }
    }
}
