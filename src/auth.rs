use base64::engine::general_purpose;
use base64::Engine;
use hyper::header::{HeaderMap, PROXY_AUTHORIZATION};

const BASIC_PREFIX: &str = "Basic ";

/// Username/password pair, either configured or decoded from a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Byte-exact comparison of both fields.
    pub fn matches(&self, other: &Credentials) -> bool {
        self.username == other.username && self.password == other.password
    }
}

/// Parse an HTTP Basic credential string such as
/// `Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==` into `("Aladdin", "open sesame")`.
///
/// The scheme token is matched ASCII case-insensitively. The decoded payload
/// is split on the first `:`; the password may contain further colons.
/// Nothing is trimmed or case-folded.
pub fn parse_basic_auth(value: &[u8]) -> Option<Credentials> {
    let prefix = BASIC_PREFIX.as_bytes();
    if value.len() < prefix.len() || !value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        return None;
    }

    let decoded = general_purpose::STANDARD
        .decode(&value[prefix.len()..])
        .ok()?;
    let split = decoded.iter().position(|&b| b == b':')?;

    // Invalid UTF-8 can never equal a configured String, so it is rejected here.
    let username = String::from_utf8(decoded[..split].to_vec()).ok()?;
    let password = String::from_utf8(decoded[split + 1..].to_vec()).ok()?;
    Some(Credentials { username, password })
}

/// Extract credentials from the `Proxy-Authorization` header, if any.
pub fn proxy_basic_auth(headers: &HeaderMap) -> Option<Credentials> {
    let value = headers.get(PROXY_AUTHORIZATION)?;
    if value.is_empty() {
        return None;
    }
    parse_basic_auth(value.as_bytes())
}

/// Outcome of checking a request against the configured credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// No credentials configured, everything passes.
    Disabled,
    /// Credentials matched; carries the authenticated username.
    Granted(String),
    Denied,
}

/// Decide whether a request carrying `headers` may use the proxy.
pub fn authorize(expected: Option<&Credentials>, headers: &HeaderMap) -> AuthDecision {
    let Some(expected) = expected else {
        return AuthDecision::Disabled;
    };

    match proxy_basic_auth(headers) {
        Some(presented) if expected.matches(&presented) => {
            AuthDecision::Granted(presented.username)
        }
        _ => AuthDecision::Denied,
    }
}
