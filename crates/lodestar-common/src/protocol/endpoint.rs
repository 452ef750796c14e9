use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{LodestarError, Result};

/// Wire protocol generation spoken by a reference or endpoint.
///
/// `Ice1` locators answer `find_adapter_by_id`/`find_object_by_id`, `Ice2`
/// locators answer `resolve_location`/`resolve_well_known_proxy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ice1,
    #[default]
    Ice2,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ice1 => write!(f, "ice1"),
            Protocol::Ice2 => write!(f, "ice2"),
        }
    }
}

/// Transport kinds an endpoint can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Ssl,
    Ws,
    Wss,
    Udp,
}

impl TransportKind {
    pub fn name(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Ssl => "ssl",
            TransportKind::Ws => "ws",
            TransportKind::Wss => "wss",
            TransportKind::Udp => "udp",
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, TransportKind::Ssl | TransportKind::Wss)
    }

    /// Datagram transports cannot carry replies.
    pub fn is_datagram(&self) -> bool {
        matches!(self, TransportKind::Udp)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TransportKind {
    type Err = LodestarError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "ssl" => Ok(TransportKind::Ssl),
            "ws" => Ok(TransportKind::Ws),
            "wss" => Ok(TransportKind::Wss),
            "udp" => Ok(TransportKind::Udp),
            other => Err(LodestarError::InvalidReference(format!(
                "unknown transport `{}`",
                other
            ))),
        }
    }
}

/// A transport-specific connection target.
///
/// Equality and hashing consider the transport, protocol and address fields.
/// The connect timeout is a tuning knob and does not change which server an
/// endpoint designates.
///
/// Two textual forms are accepted:
///
/// ```
/// use lodestar_common::protocol::{Endpoint, Protocol};
///
/// let uri: Endpoint = "tcp://10.0.0.1:10000?timeout=500".parse().unwrap();
/// assert_eq!(uri.protocol, Protocol::Ice2);
///
/// let classic: Endpoint = "tcp -h 10.0.0.1 -p 10000 -t 500".parse().unwrap();
/// assert_eq!(classic.protocol, Protocol::Ice1);
/// assert_eq!(classic.port, uri.port);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub transport: TransportKind,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    /// Connect timeout in milliseconds, overriding the communicator default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_address: Option<String>,
}

impl Endpoint {
    pub fn new(transport: TransportKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            transport,
            protocol: Protocol::Ice2,
            host: host.into(),
            port,
            timeout_ms: None,
            source_address: None,
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(TransportKind::Tcp, host, port)
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_source_address(mut self, source_address: impl Into<String>) -> Self {
        self.source_address = Some(source_address.into());
        self
    }

    pub fn is_secure(&self) -> bool {
        self.transport.is_secure()
    }

    pub fn is_datagram(&self) -> bool {
        self.transport.is_datagram()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    fn parse_uri(transport: &str, rest: &str) -> Result<Self> {
        let transport: TransportKind = transport.parse()?;
        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };
        let authority = authority.trim_end_matches('/');
        let (host, port) = authority.rsplit_once(':').ok_or_else(|| {
            LodestarError::InvalidReference(format!("missing port in `{}`", authority))
        })?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let mut endpoint = Endpoint::new(transport, host, parse_port(port)?);

        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            match pair.split_once('=') {
                Some(("timeout", value)) => endpoint.timeout_ms = Some(parse_timeout(value)?),
                Some(("source-address", value)) => {
                    endpoint.source_address = Some(value.to_string())
                }
                _ => {
                    return Err(LodestarError::InvalidReference(format!(
                        "unknown endpoint option `{}`",
                        pair
                    )))
                }
            }
        }
        Ok(endpoint)
    }

    fn parse_classic(s: &str) -> Result<Self> {
        let mut tokens = s.split_whitespace();
        let transport: TransportKind = tokens
            .next()
            .ok_or_else(|| LodestarError::InvalidReference("empty endpoint".to_string()))?
            .parse()?;

        let mut host = None;
        let mut port = None;
        let mut endpoint = Endpoint::new(transport, "", 0).with_protocol(Protocol::Ice1);
        while let Some(option) = tokens.next() {
            let value = tokens.next().ok_or_else(|| {
                LodestarError::InvalidReference(format!("no value for option `{}`", option))
            })?;
            match option {
                "-h" => host = Some(value.to_string()),
                "-p" => port = Some(parse_port(value)?),
                "-t" => endpoint.timeout_ms = Some(parse_timeout(value)?),
                "--sourceAddress" => endpoint.source_address = Some(value.to_string()),
                other => {
                    return Err(LodestarError::InvalidReference(format!(
                        "unknown endpoint option `{}`",
                        other
                    )))
                }
            }
        }
        endpoint.host = host.ok_or_else(|| {
            LodestarError::InvalidReference(format!("missing -h in `{}`", s))
        })?;
        endpoint.port =
            port.ok_or_else(|| LodestarError::InvalidReference(format!("missing -p in `{}`", s)))?;
        Ok(endpoint)
    }
}

fn parse_port(value: &str) -> Result<u16> {
    value
        .parse()
        .map_err(|_| LodestarError::InvalidReference(format!("invalid port `{}`", value)))
}

fn parse_timeout(value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| LodestarError::InvalidReference(format!("invalid timeout `{}`", value)))
}

impl FromStr for Endpoint {
    type Err = LodestarError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.split_once("://") {
            Some((transport, rest)) => Self::parse_uri(transport, rest),
            None => Self::parse_classic(s),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            Protocol::Ice1 => {
                write!(f, "{} -h {} -p {}", self.transport, self.host, self.port)?;
                if let Some(timeout) = self.timeout_ms {
                    write!(f, " -t {}", timeout)?;
                }
                Ok(())
            }
            Protocol::Ice2 => {
                if self.host.contains(':') {
                    write!(f, "{}://[{}]:{}", self.transport, self.host, self.port)
                } else {
                    write!(f, "{}://{}:{}", self.transport, self.host, self.port)
                }
            }
        }
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.transport == other.transport
            && self.protocol == other.protocol
            && self.host == other.host
            && self.port == other.port
            && self.source_address == other.source_address
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.transport.hash(state);
        self.protocol.hash(state);
        self.host.hash(state);
        self.port.hash(state);
        self.source_address.hash(state);
    }
}

/// One concrete network address an endpoint resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Connector {
    pub transport: TransportKind,
    pub addr: SocketAddr,
    /// Host name the address was resolved from.
    pub host: String,
}

impl Connector {
    pub fn new(transport: TransportKind, addr: SocketAddr, host: impl Into<String>) -> Self {
        Self {
            transport,
            addr,
            host: host.into(),
        }
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.transport, self.addr)
    }
}
