//! Unidirectional byte relay between two live connections.
//!
//! A [`Connection`] is split into a [`Source`] (read half) and a [`Sink`]
//! (write half) that share one close signal. A relay direction owns one
//! source and one sink; when it stops it closes both endpoints, which also
//! stops whichever relay owns the opposite halves. The underlying stream is
//! released when its last half is dropped, so it is closed exactly once.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Size of the per-direction copy buffer.
pub const RELAY_BUFFER_SIZE: usize = 8_192;

/// A bidirectional stream with an explicit, idempotent close signal.
pub struct Connection<S> {
    stream: S,
    closed: CancellationToken,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            closed: CancellationToken::new(),
        }
    }

    pub fn split(self) -> (Source<S>, Sink<S>) {
        let (read, write) = tokio::io::split(self.stream);
        (
            Source {
                half: read,
                closed: self.closed.clone(),
            },
            Sink {
                half: write,
                closed: self.closed,
            },
        )
    }
}

/// Read side of a [`Connection`].
pub struct Source<S> {
    half: ReadHalf<S>,
    closed: CancellationToken,
}

impl<S> Source<S> {
    fn close(self) {
        self.closed.cancel();
    }
}

/// Write side of a [`Connection`].
pub struct Sink<S> {
    half: WriteHalf<S>,
    closed: CancellationToken,
}

impl<S> Sink<S>
where
    S: AsyncWrite,
{
    async fn close(mut self) {
        self.closed.cancel();
        // The peer may already be gone; there is nobody left to report to.
        let _ = self.half.shutdown().await;
    }
}

/// Why a relay direction stopped.
#[derive(Debug)]
pub enum RelayEnd {
    /// The source reached end-of-stream.
    Eof,
    /// One of the endpoints was closed by the opposite direction.
    Closed,
    /// A read or write failed.
    Error(io::Error),
}

#[derive(Debug)]
pub struct RelayOutcome {
    pub copied: u64,
    pub end: RelayEnd,
}

/// Copy bytes from `source` into `destination` until the source ends, an
/// I/O error occurs, or either endpoint is closed. Both endpoints are closed
/// before returning. Partial writes are not retried.
pub async fn relay<D, S>(mut destination: Sink<D>, mut source: Source<S>) -> RelayOutcome
where
    D: AsyncRead + AsyncWrite,
    S: AsyncRead + AsyncWrite,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut copied = 0u64;

    let end = loop {
        let read = tokio::select! {
            res = source.half.read(&mut buf) => res,
            _ = source.closed.cancelled() => break RelayEnd::Closed,
            _ = destination.closed.cancelled() => break RelayEnd::Closed,
        };
        let n = match read {
            Ok(0) => break RelayEnd::Eof,
            Ok(n) => n,
            Err(e) => break RelayEnd::Error(e),
        };

        let written = tokio::select! {
            res = destination.half.write_all(&buf[..n]) => res,
            _ = source.closed.cancelled() => break RelayEnd::Closed,
            _ = destination.closed.cancelled() => break RelayEnd::Closed,
        };
        if let Err(e) = written {
            break RelayEnd::Error(e);
        }
        copied += n as u64;
    };

    source.close();
    destination.close().await;

    RelayOutcome { copied, end }
}

/// Spawn the two relay directions of a tunnel as independent tasks.
///
/// Returns the `(client -> upstream, upstream -> client)` handles. After this
/// call the caller holds no reference to either connection.
pub fn spawn_pair<C, U>(
    client: Connection<C>,
    upstream: Connection<U>,
) -> (JoinHandle<RelayOutcome>, JoinHandle<RelayOutcome>)
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_rx, client_tx) = client.split();
    let (upstream_rx, upstream_tx) = upstream.split();

    let outbound = tokio::spawn(relay(upstream_tx, client_rx));
    let inbound = tokio::spawn(relay(client_tx, upstream_rx));

    (outbound, inbound)
}
