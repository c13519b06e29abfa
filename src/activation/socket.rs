//! Inherited socket classification

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};

use anyhow::{bail, Context};
use socket2::{Socket, Type};

use crate::relay::SocketKind;
use crate::Result;

/// Inherited descriptor together with its socket kind
#[derive(Debug)]
pub struct InheritedSocket {
    pub fd: OwnedFd,
    pub kind: SocketKind,
    pub name: Option<String>,
}

impl InheritedSocket {
    /// Query `SO_TYPE` to tell listening stream sockets from datagram sockets
    pub fn classify(fd: OwnedFd, name: Option<String>) -> Result<Self> {
        let raw = fd.as_raw_fd();
        let socket = Socket::from(fd);
        let ty = socket
            .r#type()
            .with_context(|| format!("Failed to query socket type of fd {}", raw))?;

        let kind = if ty == Type::STREAM {
            SocketKind::Stream
        } else if ty == Type::DGRAM {
            SocketKind::Packet
        } else {
            bail!("Unsupported socket type {:?} for fd {}", ty, raw);
        };

        Ok(Self {
            fd: OwnedFd::from(socket),
            kind,
            name,
        })
    }
}

impl fmt::Display for InheritedSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} fd {} ({})", self.kind, self.fd.as_raw_fd(), name),
            None => write!(f, "{} fd {}", self.kind, self.fd.as_raw_fd()),
        }
    }
}
