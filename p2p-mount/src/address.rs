//! Local TCP endpoints in `/ip4/HOST/tcp/PORT` form.
//!
//! ```
//! use p2p_mount::Endpoint;
//!
//! let endpoint: Endpoint = "/ip4/127.0.0.1/tcp/8080".parse().unwrap();
//! assert_eq!(endpoint.host(), "127.0.0.1");
//! assert_eq!(endpoint.port(), 8080);
//! assert_eq!(endpoint.to_string(), "/ip4/127.0.0.1/tcp/8080");
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Longest hostname accepted, in bytes.
pub const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => f.write_str("tcp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("malformed address {0:?}, expected /ip4/HOST/tcp/PORT")]
    Malformed(String),

    #[error("unsupported segment {0:?}")]
    UnknownSegment(String),

    #[error("empty host")]
    EmptyHost,

    #[error("invalid host {0:?}")]
    InvalidHost(String),

    #[error("port {0:?} is not a number")]
    InvalidPort(String),

    #[error("port 0 is not allowed")]
    PortZero,

    #[error("port {0} is out of range")]
    PortOutOfRange(String),
}

/// A validated TCP endpoint. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    transport: Transport,
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, AddressError> {
        let host = host.into();
        if host.is_empty() {
            return Err(AddressError::EmptyHost);
        }
        if port == 0 {
            return Err(AddressError::PortZero);
        }
        if !valid_host(&host) {
            return Err(AddressError::InvalidHost(host));
        }
        Ok(Self {
            transport: Transport::Tcp,
            host,
            port,
        })
    }

    /// Parse `/ip4/HOST/tcp/PORT`.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let (family, host, port) = split(input)?;
        if family != "ip4" {
            return Err(AddressError::UnknownSegment(family.to_string()));
        }
        if !valid_host(host) {
            return Err(AddressError::InvalidHost(host.to_string()));
        }
        Ok(Self {
            transport: Transport::Tcp,
            host: host.to_string(),
            port: parse_port(port)?,
        })
    }

    /// Like [`Endpoint::parse`], but also takes the `/ip6/ADDR/tcp/PORT`
    /// form that IPv6 session origins display as.
    fn parse_reported(input: &str) -> Result<Self, AddressError> {
        let (family, host, port) = split(input)?;
        if family != "ip6" {
            return Self::parse(input);
        }
        if host.parse::<Ipv6Addr>().is_err() {
            return Err(AddressError::InvalidHost(host.to_string()));
        }
        Ok(Self {
            transport: Transport::Tcp,
            host: host.to_string(),
            port: parse_port(port)?,
        })
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn is_ip6(&self) -> bool {
        self.host.parse::<Ipv6Addr>().is_ok()
    }
}

/// `(family, host, port)` of a `/FAMILY/HOST/tcp/PORT` string.
fn split(input: &str) -> Result<(&str, &str, &str), AddressError> {
    let Some(rest) = input.strip_prefix('/') else {
        return Err(AddressError::Malformed(input.to_string()));
    };
    let segments: Vec<&str> = rest.split('/').collect();
    let &[family, host, transport, port] = segments.as_slice() else {
        return Err(AddressError::Malformed(input.to_string()));
    };
    if transport != "tcp" {
        return Err(AddressError::UnknownSegment(transport.to_string()));
    }
    if host.is_empty() {
        return Err(AddressError::EmptyHost);
    }
    Ok((family, host, port))
}

fn parse_port(port: &str) -> Result<u16, AddressError> {
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AddressError::InvalidPort(port.to_string()));
    }
    // "080" would display as "80"
    if port.len() > 1 && port.starts_with('0') {
        return Err(AddressError::InvalidPort(port.to_string()));
    }
    // all digits, so the only way to fail is overflow
    let value: u64 = port
        .parse()
        .map_err(|_| AddressError::PortOutOfRange(port.to_string()))?;
    match u16::try_from(value) {
        Ok(0) => Err(AddressError::PortZero),
        Ok(port) => Ok(port),
        Err(_) => Err(AddressError::PortOutOfRange(port.to_string())),
    }
}

fn valid_host(host: &str) -> bool {
    if host.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return host.parse::<Ipv4Addr>().is_ok();
    }
    valid_hostname(host)
}

fn valid_hostname(host: &str) -> bool {
    // a single trailing dot marks a fully qualified name
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

impl std::str::FromStr for Endpoint {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let family = if self.is_ip6() { "ip6" } else { "ip4" };
        write!(
            f,
            "/{family}/{}/{}/{}",
            self.host, self.transport, self.port
        )
    }
}

/// Session origins. IPv6 peers are kept as `/ip6/...`; port 0 is refused.
impl TryFrom<SocketAddr> for Endpoint {
    type Error = AddressError;

    fn try_from(addr: SocketAddr) -> Result<Self, Self::Error> {
        if addr.port() == 0 {
            return Err(AddressError::PortZero);
        }
        // an IPv4-mapped client on a dual stack socket reads as plain IPv4
        let ip = match addr.ip() {
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map(IpAddr::V4)
                .unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        };
        Ok(Self {
            transport: Transport::Tcp,
            host: ip.to_string(),
            port: addr.port(),
        })
    }
}

impl serde::Serialize for Endpoint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Endpoint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Endpoint::parse_reported(&s).map_err(serde::de::Error::custom)
    }
}
