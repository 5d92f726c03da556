use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST, PROXY_AUTHENTICATE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::auth::{authorize, AuthDecision};
use crate::config::ProxyConfig;
use crate::logging::AUTH_TARGET;
use crate::{forward, tunnel};

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Failures that end a request with an error response.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("dial tcp {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("dial tcp {addr}: i/o timeout after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },
    #[error("unsupported protocol scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("no host in request URL")]
    MissingHost,
    #[error("invalid TLS server name {0:?}")]
    ServerName(String),
    #[error("tls handshake with {host}: {source}")]
    Tls {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper::Error),
}

/// Open a TCP connection to `addr` (`host:port`), giving up after `timeout`.
pub async fn dial(addr: &str, timeout: Duration) -> Result<TcpStream, ProxyError> {
    connect_within(addr, timeout, TcpStream::connect(addr)).await
}

/// Bound a connection attempt to `addr` by `timeout`.
pub(crate) async fn connect_within<T, F>(
    addr: &str,
    timeout: Duration,
    connect: F,
) -> Result<T, ProxyError>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ProxyError::Dial {
            addr: addr.to_string(),
            source,
        }),
        Err(_) => Err(ProxyError::DialTimeout {
            addr: addr.to_string(),
            timeout,
        }),
    }
}

/// Request dispatcher: logs, runs the auth gate, then either forwards the
/// request or establishes a CONNECT tunnel.
#[derive(Clone)]
pub struct Proxy {
    config: Arc<ProxyConfig>,
}

impl Proxy {
    pub fn new(config: Arc<ProxyConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub async fn handle(
        &self,
        req: Request<Incoming>,
        remote: SocketAddr,
    ) -> Result<Response<ProxyBody>, hyper::Error> {
        let host = request_host(&req);
        let span = info_span!("request", method = %req.method(), %remote, %host);
        Ok(self.dispatch(req, remote, host).instrument(span).await)
    }

    async fn dispatch(
        &self,
        req: Request<Incoming>,
        remote: SocketAddr,
        host: String,
    ) -> Response<ProxyBody> {
        info!("Serving '{}' request from '{}' to '{}'", req.method(), remote, host);

        if self.config.log_headers {
            log_headers(&req);
        }

        match authorize(self.config.credentials.as_ref(), req.headers()) {
            AuthDecision::Denied => {
                warn!(target: AUTH_TARGET, "Unauthorized request from {}", remote);
                return proxy_auth_required();
            }
            AuthDecision::Granted(username) if self.config.log_auth => {
                info!(target: AUTH_TARGET, "Authorized '{}' from {}", username, remote);
            }
            _ => {}
        }

        if req.method() == Method::CONNECT {
            tunnel::handle_connect(req, self.config.timeout).await
        } else {
            forward::forward(req, self.config.timeout).await
        }
    }
}

/// Serve one accepted client connection until it closes or is hijacked.
pub async fn serve_connection(proxy: Proxy, stream: TcpStream, peer_addr: SocketAddr) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let proxy = proxy.clone();
        async move { proxy.handle(req, peer_addr).await }
    });

    if let Err(err) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        debug!("Connection from {} ended with error: {:?}", peer_addr, err);
    }
}

/// Target of the request: the URI authority, else the `Host` header.
pub fn request_host<B>(req: &Request<B>) -> String {
    if let Some(authority) = req.uri().authority() {
        return authority.to_string();
    }
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_default()
}

fn log_headers<B>(req: &Request<B>) {
    let headers = req.headers();
    for name in headers.keys() {
        for (i, value) in headers.get_all(name).iter().enumerate() {
            info!("'{}': [{}] {}", name, i, String::from_utf8_lossy(value.as_bytes()));
        }
    }
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Plain-text error reply; the message becomes the body, newline terminated.
pub fn error_response(status: StatusCode, msg: &str) -> Response<ProxyBody> {
    let mut resp = Response::new(full(format!("{}\n", msg)));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp.headers_mut().insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    resp
}

fn proxy_auth_required() -> Response<ProxyBody> {
    let mut resp = error_response(StatusCode::PROXY_AUTHENTICATION_REQUIRED, "Unauthorized");
    resp.headers_mut()
        .insert(PROXY_AUTHENTICATE, HeaderValue::from_static("Basic"));
    resp
}
