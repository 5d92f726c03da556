use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::{value_parser, Parser};

use crate::auth::Credentials;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "Forward HTTP proxy with CONNECT tunneling",
    long_about = "fwdproxy forwards absolute-form http:// and https:// requests and tunnels CONNECT requests.\n\nFeatures:\n- Optional HTTP Basic proxy authentication (--username/--password)\n- Bounded dial timeout for upstream connections\n- Optional auth event and header logging\n"
)]
pub struct Cli {
    /// IP address to bind the server
    #[arg(long, env = "PROXY_LISTEN_IP", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub listen_ip: IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "PROXY_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Request timeout in seconds (bounds upstream dialing)
    #[arg(
        short, long, env = "PROXY_TIMEOUT", default_value_t = 10,
        value_parser = value_parser!(u64).range(1..)
    )]
    pub timeout: u64,

    /// Username required in Proxy-Authorization (requires --password)
    #[arg(short, long, env = "PROXY_USERNAME")]
    pub username: Option<String>,

    /// Password required in Proxy-Authorization (requires --username)
    #[arg(short = 'P', long, env = "PROXY_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Also log successful authentications
    #[arg(long, env = "PROXY_LOG_AUTH")]
    pub log_auth: bool,

    /// Log every inbound request header value
    #[arg(long, env = "PROXY_LOG_HEADERS")]
    pub log_headers: bool,
}

/// Proxy server configuration derived from CLI arguments.
///
/// Immutable once built; shared behind an `Arc`.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub timeout: Duration,
    pub credentials: Option<Credentials>,
    pub log_auth: bool,
    pub log_headers: bool,
}

impl ProxyConfig {
    /// Create ProxyConfig from CLI arguments
    pub fn from_cli(args: Cli) -> color_eyre::Result<Self> {
        if args.timeout == 0 {
            return Err(color_eyre::eyre::eyre!("--timeout must be at least 1 second"));
        }

        let credentials = match (args.username, args.password) {
            (Some(u), Some(p)) => Some(Credentials::new(u, p)),
            (None, None) => None,
            (Some(_), None) => {
                return Err(color_eyre::eyre::eyre!("--username requires --password"))
            }
            (None, Some(_)) => {
                return Err(color_eyre::eyre::eyre!("--password requires --username"))
            }
        };

        Ok(Self {
            listen_addr: SocketAddr::new(args.listen_ip, args.port),
            timeout: Duration::from_secs(args.timeout),
            credentials,
            log_auth: args.log_auth,
            log_headers: args.log_headers,
        })
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080),
            timeout: Duration::from_secs(10),
            credentials: None,
            log_auth: false,
            log_headers: false,
        }
    }
}
