//! Absolute-form forwarding: re-issue the request to its origin, over TLS
//! for `https` targets, and stream the response back.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use http::uri::{PathAndQuery, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1::Builder;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, PROXY_AUTHORIZATION, TE, TRAILER,
    TRANSFER_ENCODING, UPGRADE,
};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tracing::{debug, error};

use crate::proxy::{dial, error_response, ProxyBody, ProxyError};

const KEEP_ALIVE: &str = "keep-alive";
const PROXY_CONNECTION: &str = "proxy-connection";

/// Forward `req` to the host named in its absolute-form URI.
///
/// Transport failures become a 503 whose body is the error text. Once the
/// response head has been returned, a failure while streaming the body
/// only truncates it.
pub async fn forward(req: Request<Incoming>, timeout: Duration) -> Response<ProxyBody> {
    match round_trip(req, timeout).await {
        Ok(resp) => resp,
        Err(e) => unavailable(e),
    }
}

fn unavailable(e: ProxyError) -> Response<ProxyBody> {
    error!("Failed to proxy request, {}", e);
    error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string())
}

async fn round_trip(
    req: Request<Incoming>,
    timeout: Duration,
) -> Result<Response<ProxyBody>, ProxyError> {
    let target = Target::from_uri(req.uri())?;
    let stream = dial(&target.addr, timeout).await?;
    let req = outbound_request(req, &target.host_header);

    let resp = if target.secure {
        let server_name = ServerName::try_from(target.host.clone())
            .map_err(|_| ProxyError::ServerName(target.host.clone()))?;
        let stream = tls_connector()
            .connect(server_name, stream)
            .await
            .map_err(|source| ProxyError::Tls {
                host: target.host.clone(),
                source,
            })?;
        send(stream, req, target.addr).await?
    } else {
        send(stream, req, target.addr).await?
    };
    Ok(inbound_response(resp))
}

/// Run one HTTP/1.1 exchange over an already connected upstream stream.
async fn send<S>(
    io: S,
    req: Request<Incoming>,
    addr: String,
) -> Result<Response<Incoming>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(io))
        .await?;

    // The driver must outlive this call so the body can keep streaming;
    // it ends once the body is consumed or dropped.
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!("Upstream connection to {} error: {:?}", addr, err);
        }
    });

    Ok(sender.send_request(req).await?)
}

/// Client TLS settings shared by every `https` exchange.
fn tls_connector() -> TlsConnector {
    static CONNECTOR: OnceLock<TlsConnector> = OnceLock::new();
    CONNECTOR
        .get_or_init(|| {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            TlsConnector::from(Arc::new(config))
        })
        .clone()
}

/// Where an absolute-form request goes.
#[derive(Debug, PartialEq, Eq)]
struct Target {
    /// `host:port` to dial.
    addr: String,
    /// Host without IPv6 brackets, used as the TLS server name.
    host: String,
    /// Value written into the outgoing `Host` header.
    host_header: String,
    secure: bool,
}

impl Target {
    fn from_uri(uri: &Uri) -> Result<Self, ProxyError> {
        let (secure, default_port) = match uri.scheme_str() {
            Some("http") => (false, 80),
            Some("https") => (true, 443),
            Some(other) => return Err(ProxyError::UnsupportedScheme(other.to_string())),
            None => return Err(ProxyError::UnsupportedScheme(String::new())),
        };
        let authority_host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or(ProxyError::MissingHost)?;
        let host_header = match uri.port_u16() {
            Some(p) => format!("{}:{}", authority_host, p),
            None => authority_host.to_string(),
        };
        let port = uri.port_u16().unwrap_or(default_port);

        Ok(Self {
            addr: format!("{}:{}", authority_host, port),
            host: authority_host
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string(),
            host_header,
            secure,
        })
    }
}

fn outbound_request(req: Request<Incoming>, host_header: &str) -> Request<Incoming> {
    let (mut parts, body) = req.into_parts();

    parts.uri = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"))
        .into();

    strip_hop_by_hop(&mut parts.headers);
    parts.headers.remove(PROXY_AUTHORIZATION);
    // The absolute-form authority wins over whatever Host the client sent.
    match HeaderValue::from_str(host_header) {
        Ok(value) => {
            parts.headers.insert(HOST, value);
        }
        Err(_) => {
            parts.headers.remove(HOST);
        }
    }

    Request::from_parts(parts, body)
}

fn inbound_response(resp: Response<Incoming>) -> Response<ProxyBody> {
    let (parts, body) = resp.into_parts();

    let mut out = Response::new(body.boxed());
    *out.status_mut() = parts.status;
    *out.extensions_mut() = parts.extensions;

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    copy_headers(out.headers_mut(), &headers);
    out
}

/// Append every value of every header, so repeated names survive.
fn copy_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for (name, value) in src {
        dst.append(name.clone(), value.clone());
    }
}

/// Remove connection-scoped headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }

    for name in [CONNECTION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE] {
        headers.remove(name);
    }
    headers.remove(KEEP_ALIVE);
    headers.remove(PROXY_CONNECTION);
}
