//! CONNECT handling: dial the target, take over the client socket and wire
//! the two together with a pair of relays.

use std::time::Duration;

use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, error, info, Instrument, Span};

use crate::connection::TunnelGuard;
use crate::proxy::{dial, empty, error_response, request_host, ProxyBody};
use crate::relay::{self, Connection, RelayEnd};

/// Establish a tunnel for a CONNECT request.
///
/// Dial failures answer 503. If the serving layer offers no way to take over
/// the client socket the upstream connection is dropped and 500 returned.
/// Otherwise a 200 with no body is returned and the relays start once hyper
/// hands over the raw connection.
pub async fn handle_connect<B>(mut req: Request<B>, timeout: Duration) -> Response<ProxyBody> {
    let addr = request_host(&req);

    let upstream = match dial(&addr, timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to dial host, {}", e);
            return error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string());
        }
    };

    let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        error!("Attempted to hijack connection that does not support it");
        drop(upstream);
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Hijacking not supported",
        );
    };

    tokio::spawn(
        async move {
            match on_upgrade.await {
                Ok(upgraded) => splice(TokioIo::new(upgraded), upstream, &addr).await,
                // Also reached when the 200 could not be written; the
                // upstream stream is dropped here.
                Err(e) => error!("Failed to hijack connection, {}", e),
            }
        }
        .instrument(Span::current()),
    );

    Response::new(empty())
}

/// Relay between the hijacked client and the upstream until both
/// directions have finished.
async fn splice<C>(client: C, upstream: TcpStream, addr: &str)
where
    C: AsyncRead + AsyncWrite + Send + 'static,
{
    let (guard, active) = TunnelGuard::acquire();
    debug!("Tunnel to {} established, {} active", addr, active);

    let (outbound, inbound) =
        relay::spawn_pair(Connection::new(client), Connection::new(upstream));
    let (outbound, inbound) = tokio::join!(outbound, inbound);
    drop(guard);

    match (outbound, inbound) {
        (Ok(sent), Ok(received)) => {
            let directions = [
                ("client -> upstream", &sent),
                ("upstream -> client", &received),
            ];
            for (direction, outcome) in directions {
                if let RelayEnd::Error(e) = &outcome.end {
                    debug!("Tunnel to {} {} stopped on error: {}", addr, direction, e);
                }
            }
            // Only log big transfers to keep noise down
            if sent.copied + received.copied > 10_485_760 {
                info!(
                    "Tunnel to {} completed large transfer: {}↑ {}↓ bytes, {} active",
                    addr,
                    sent.copied,
                    received.copied,
                    TunnelGuard::active_count()
                );
            }
        }
        (outbound, inbound) => {
            error!(
                "Tunnel to {} relay task failed: {:?} / {:?}",
                addr,
                outbound.err(),
                inbound.err()
            );
        }
    }
}
