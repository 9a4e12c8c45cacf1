//! Endpoint URI validation and hostname resolution
//!
//! URIs take the form `[scheme://]host[:port]` and are canonicalised to
//! `scheme://ip:port`. IPv6 hosts are bracketed in the canonical form so that it
//! parses back to the same endpoint.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CommError, CommResult};

/// Port that rigs listen on for commands unless told otherwise
pub const LISTEN_PORT: u16 = 1001;

/// Public service that echoes back the caller's address
pub const EXTERNAL_IP_URL: &str = "https://ident.me";

/// Transport scheme of an endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Udp,
    Tcp,
    Ws,
    Wss,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Udp => "udp",
            Scheme::Tcp => "tcp",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        }
    }

    /// True for the datagram transport, false for the stream transports
    pub fn is_datagram(&self) -> bool {
        matches!(self, Scheme::Udp)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = CommError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "udp" => Ok(Scheme::Udp),
            "tcp" => Ok(Scheme::Tcp),
            "ws" => Ok(Scheme::Ws),
            "wss" => Ok(Scheme::Wss),
            other => Err(CommError::config(format!(
                "Unsupported scheme \"{other}\". Choices: udp, tcp, ws, wss"
            ))),
        }
    }
}

/// A URI to validate: either text or an already resolved IP address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UriInput {
    Text(String),
    Ip(IpAddr),
}

impl From<&str> for UriInput {
    fn from(s: &str) -> Self {
        UriInput::Text(s.to_string())
    }
}

impl From<String> for UriInput {
    fn from(s: String) -> Self {
        UriInput::Text(s)
    }
}

impl From<&String> for UriInput {
    fn from(s: &String) -> Self {
        UriInput::Text(s.clone())
    }
}

impl From<IpAddr> for UriInput {
    fn from(ip: IpAddr) -> Self {
        UriInput::Ip(ip)
    }
}

impl From<Ipv4Addr> for UriInput {
    fn from(ip: Ipv4Addr) -> Self {
        UriInput::Ip(IpAddr::V4(ip))
    }
}

impl From<Ipv6Addr> for UriInput {
    fn from(ip: Ipv6Addr) -> Self {
        UriInput::Ip(IpAddr::V6(ip))
    }
}

impl From<&Endpoint> for UriInput {
    fn from(endpoint: &Endpoint) -> Self {
        UriInput::Text(endpoint.to_string())
    }
}

/// Options for [`validate_uri`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UriOptions {
    /// Resolve hostnames to an IP address
    pub resolve_host: bool,
    /// Port used when the URI has none
    pub default_port: u16,
    /// Scheme used when the URI has none
    pub default_scheme: Scheme,
}

impl Default for UriOptions {
    fn default() -> Self {
        Self {
            resolve_host: true,
            default_port: LISTEN_PORT,
            default_scheme: Scheme::Udp,
        }
    }
}

impl UriOptions {
    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    pub fn with_default_scheme(mut self, scheme: Scheme) -> Self {
        self.default_scheme = scheme;
        self
    }

    pub fn without_resolve(mut self) -> Self {
        self.resolve_host = false;
        self
    }
}

/// A validated connection endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Validate a URI and build the endpoint it names
    pub fn from_uri(uri: impl Into<UriInput>, opts: &UriOptions) -> CommResult<Self> {
        let text = match uri.into() {
            UriInput::Ip(ip) => {
                return Ok(Self {
                    scheme: opts.default_scheme,
                    host: ip.to_string(),
                    port: parse_port(None, opts.default_port)?,
                });
            }
            UriInput::Text(text) => text,
        };

        let (scheme, rest) = split_scheme(&text)?;
        let (host, port) = split_host_port(rest)?;

        let host = if let Ok(ip) = host.parse::<IpAddr>() {
            ip.to_string()
        } else if opts.resolve_host {
            hostname2ip(Some(host))?.to_string()
        } else if is_valid_hostname(host) {
            host.to_string()
        } else {
            return Err(CommError::config(format!("Invalid hostname \"{host}\"")));
        };

        let endpoint = Self {
            scheme: scheme.unwrap_or(opts.default_scheme),
            host,
            port: parse_port(port, opts.default_port)?,
        };
        debug!(%endpoint, "Endpoint::from_uri: validated");
        Ok(endpoint)
    }

    /// Validate a URI with the default options
    pub fn parse(uri: impl Into<UriInput>) -> CommResult<Self> {
        Self::from_uri(uri, &UriOptions::default())
    }

    /// The host as an IP address, if it is one
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// The socket address of a resolved endpoint
    pub fn socket_addr(&self) -> CommResult<SocketAddr> {
        self.ip()
            .map(|ip| SocketAddr::new(ip, self.port))
            .ok_or_else(|| CommError::config(format!("Endpoint host \"{}\" is not resolved to an IP", self.host)))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip() {
            Some(IpAddr::V6(ip)) => write!(f, "{}://[{}]:{}", self.scheme, ip, self.port),
            _ => write!(f, "{}://{}:{}", self.scheme, self.host, self.port),
        }
    }
}

/// Validate a URI and return its canonical `scheme://ip:port` form
pub fn validate_uri(uri: impl Into<UriInput>, opts: &UriOptions) -> CommResult<String> {
    Endpoint::from_uri(uri, opts).map(|endpoint| endpoint.to_string())
}

/// Check a URI's scheme, host and port without resolving the host
///
/// Accepts any host a resolver could be asked about, including dotted and
/// mixed-case names. Resolution is left to the caller.
pub fn check_uri(uri: &str, opts: &UriOptions) -> CommResult<()> {
    let (_, rest) = split_scheme(uri)?;
    let (host, port) = split_host_port(rest)?;
    if host.is_empty() || host.contains(|c: char| c.is_whitespace() || c == '/') {
        return Err(CommError::config(format!("Invalid hostname \"{host}\"")));
    }
    parse_port(port, opts.default_port)?;
    Ok(())
}

/// True if the string is a literal IPv4 or IPv6 address
pub fn is_valid_ip(s: &str) -> bool {
    s.parse::<IpAddr>().is_ok()
}

/// Resolve a hostname (or this machine's hostname) to an IP address
///
/// An IPv4 result is preferred when the name resolves to both families.
pub fn hostname2ip(hostname: Option<&str>) -> CommResult<IpAddr> {
    let hostname = match hostname {
        Some(name) => name.to_string(),
        None => local_hostname()?,
    };
    debug!(%hostname, "hostname2ip: called");

    let unresolved = || CommError::config(format!("Failed to resolve IP for hostname \"{hostname}\""));
    let addrs: Vec<SocketAddr> = (hostname.as_str(), 0)
        .to_socket_addrs()
        .map_err(|_| unresolved())?
        .collect();

    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .map(|addr| addr.ip())
        .ok_or_else(unresolved)
}

/// Ask a public echo service for this machine's external IP address
pub async fn external_ip() -> CommResult<IpAddr> {
    debug!("external_ip: called");
    let body = reqwest::get(EXTERNAL_IP_URL)
        .await?
        .error_for_status()?
        .text()
        .await?;

    body.trim()
        .parse()
        .map_err(|_| CommError::transport(EXTERNAL_IP_URL, format!("unexpected response {body:?}")))
}

fn local_hostname() -> CommResult<String> {
    nix::unistd::gethostname()
        .map_err(|e| CommError::config(format!("Failed to read local hostname: {e}")))?
        .into_string()
        .map_err(|name| CommError::config(format!("Local hostname is not valid UTF-8: {name:?}")))
}

fn is_valid_hostname(host: &str) -> bool {
    !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn split_scheme(text: &str) -> CommResult<(Option<Scheme>, &str)> {
    match text.find("://") {
        Some(idx) if idx > 0 && text[..idx].chars().all(|c| c.is_ascii_alphabetic()) => {
            Ok((Some(text[..idx].parse()?), &text[idx + 3..]))
        }
        _ => Ok((None, text)),
    }
}

fn split_host_port(rest: &str) -> CommResult<(&str, Option<&str>)> {
    if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| CommError::config(format!("Invalid hostname \"{rest}\"")))?;
        return match after {
            "" => Ok((host, None)),
            _ => match after.strip_prefix(':') {
                Some(port) => Ok((host, Some(port))),
                None => Err(CommError::config(format!("Invalid hostname \"{rest}\""))),
            },
        };
    }

    // A bare IPv6 literal carries no port
    if rest.matches(':').count() > 1 {
        return Ok((rest, None));
    }

    Ok(match rest.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (rest, None),
    })
}

fn parse_port(port: Option<&str>, default_port: u16) -> CommResult<u16> {
    let raw = match port {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => default_port.to_string(),
    };
    match raw.parse::<i64>() {
        Ok(n) if (1..=65535).contains(&n) => Ok(n as u16),
        _ => Err(CommError::config(format!("Invalid port number: {raw}"))),
    }
}
