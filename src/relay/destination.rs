//! Destination Resolution
//!
//! Turns a raw destination string such as `udp://203.0.113.5:53`, `:9090`
//! or `unix:///var/run/app.sock` into the network/address pair a relay dials.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const SCHEME_SEPARATOR: &str = "://";

/// Network family of a socket or destination
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
    Unix,
    Unixgram,
    /// Unrecognised network name, rejected when dialing
    Other(String),
}

impl Network {
    /// Network name as written in a destination string
    pub fn as_str(&self) -> &str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
            Network::Unix => "unix",
            Network::Unixgram => "unixgram",
            Network::Other(name) => name,
        }
    }

    /// Whether addresses in this network are `host:port` pairs
    pub fn is_inet(&self) -> bool {
        let name = self.as_str();
        name.starts_with("tcp") || name.starts_with("udp")
    }

    /// Whether this network carries datagrams rather than a byte stream
    pub fn is_datagram(&self) -> bool {
        matches!(
            self,
            Network::Udp | Network::Udp4 | Network::Udp6 | Network::Unixgram
        )
    }
}

impl From<&str> for Network {
    fn from(name: &str) -> Self {
        match name {
            "tcp" => Network::Tcp,
            "tcp4" => Network::Tcp4,
            "tcp6" => Network::Tcp6,
            "udp" => Network::Udp,
            "udp4" => Network::Udp4,
            "udp6" => Network::Udp6,
            "unix" => Network::Unix,
            "unixgram" => Network::Unixgram,
            other => Network::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The socket a relay was built from, as seen by the resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// Network of the inherited socket (`tcp`, `udp`, `unix` or `unixgram`)
    pub network: Network,
    /// Bound address, `None` for unix sockets
    pub addr: Option<SocketAddr>,
}

impl Origin {
    pub fn new(network: Network, addr: Option<SocketAddr>) -> Self {
        Self { network, addr }
    }

    /// Loopback address of the same IP version as the bound address
    fn loopback(&self) -> Option<IpAddr> {
        match self.addr? {
            SocketAddr::V4(_) => Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            SocketAddr::V6(v6) if v6.ip().to_ipv4_mapped().is_some() => {
                Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
            }
            SocketAddr::V6(_) => Some(IpAddr::V6(Ipv6Addr::LOCALHOST)),
        }
    }
}

/// Resolved destination of a relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub network: Network,
    pub address: String,
}

impl Destination {
    /// Resolve a raw destination string against the socket it is relayed from.
    ///
    /// A missing `scheme://` prefix inherits the origin's network. For
    /// `tcp*`/`udp*` networks an empty host (`:9090`) is replaced by the
    /// loopback address matching the origin's IP version. Resolution never
    /// fails; malformed addresses are reported when dialing.
    pub fn resolve(raw: &str, origin: &Origin) -> Self {
        let (network, address) = split_destination(raw);
        let network = match network {
            Some(name) if !name.is_empty() => Network::from(name),
            _ => origin.network.clone(),
        };

        let address = if network.is_inet() {
            fill_host(address, origin)
        } else {
            address.to_string()
        };

        Self { network, address }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.network, SCHEME_SEPARATOR, self.address)
    }
}

fn split_destination(raw: &str) -> (Option<&str>, &str) {
    match raw.find(SCHEME_SEPARATOR) {
        Some(idx) => (Some(&raw[..idx]), &raw[idx + SCHEME_SEPARATOR.len()..]),
        None => (None, raw),
    }
}

fn fill_host(address: &str, origin: &Origin) -> String {
    match (split_host_port(address), origin.loopback()) {
        (Some(("", port)), Some(loopback)) => join_host_port(&loopback.to_string(), port),
        _ => address.to_string(),
    }
}

/// Split `host:port` or `[host]:port`. Returns `None` for anything else.
pub(crate) fn split_host_port(address: &str) -> Option<(&str, &str)> {
    if let Some(rest) = address.strip_prefix('[') {
        let end = rest.find(']')?;
        let port = rest[end + 1..].strip_prefix(':')?;
        if port.contains(':') {
            return None;
        }
        return Some((&rest[..end], port));
    }

    let (host, port) = address.rsplit_once(':')?;
    if host.contains(':') || host.contains('[') || host.contains(']') {
        return None;
    }
    Some((host, port))
}

pub(crate) fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
