//! Socket Activation
//!
//! Collects the sockets an init system opened on the daemon's behalf. Every
//! platform protocol sits behind [`SocketSource`]; the rest of the daemon
//! only sees classified [`InheritedSocket`]s.

pub mod launchd;
pub mod socket;
pub mod systemd;

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

pub use launchd::Launchd;
pub use socket::InheritedSocket;
pub use systemd::Systemd;

use crate::config::{ActivationConfig, Backend};
use crate::Result;

/// Failure modes of socket activation
#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    #[error("the socket name {0:?} does not exist in the service's launchd.plist")]
    NotExist(String),
    #[error("the calling process is not managed by launchd")]
    NotManaged,
    #[error("the socket {0:?} has already been activated")]
    AlreadyActivated(String),
    #[error("launch_activate_socket({name:?}) failed with errno {errno}")]
    Launchd { name: String, errno: i32 },
    #[error("socket names not found in {}", .0.display())]
    NoSocketNames(PathBuf),
    #[error("launchd socket activation is only available on macOS")]
    LaunchdUnsupported,
    #[error("invalid file descriptor: {0}")]
    InvalidDescriptor(RawFd),
    #[error("no inherited sockets")]
    NoSockets,
}

/// Descriptor handed over by an init system
#[derive(Debug)]
pub struct ActivatedFd {
    pub fd: OwnedFd,
    /// Socket name, when the protocol provides one
    pub name: Option<String>,
}

/// Source of inherited socket descriptors
pub trait SocketSource {
    /// Take ownership of the inherited descriptors. Later calls return
    /// nothing.
    fn activate(&mut self) -> Result<Vec<ActivatedFd>>;
}

/// Explicitly listed descriptor numbers
#[derive(Debug, Clone, Default)]
pub struct FdList {
    fds: Vec<RawFd>,
}

impl FdList {
    pub fn new(fds: Vec<RawFd>) -> Self {
        Self { fds }
    }
}

impl SocketSource for FdList {
    fn activate(&mut self) -> Result<Vec<ActivatedFd>> {
        let fds = std::mem::take(&mut self.fds);
        let mut activated = Vec::with_capacity(fds.len());
        for fd in fds {
            activated.push(ActivatedFd {
                fd: adopt_fd(fd)?,
                name: None,
            });
        }
        Ok(activated)
    }
}

/// Take ownership of a raw descriptor number after checking it is open
pub fn adopt_fd(fd: RawFd) -> std::result::Result<OwnedFd, ActivationError> {
    // SAFETY: F_GETFD only inspects the descriptor table entry
    if fd < 0 || unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
        return Err(ActivationError::InvalidDescriptor(fd));
    }
    // SAFETY: the descriptor is open and was inherited for this process to
    // own; callers hand each number over once
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Socket source selected by the configuration
pub fn source_from_config(config: &ActivationConfig) -> Box<dyn SocketSource> {
    match config.backend.resolve() {
        Backend::Launchd => {
            let launchd = Launchd::new(config.sockets.clone());
            match &config.plist {
                Some(plist) => Box::new(launchd.with_plist(plist)),
                None => Box::new(launchd),
            }
        }
        Backend::Fds => Box::new(FdList::new(config.fds.clone())),
        Backend::Systemd | Backend::Auto => Box::new(Systemd::from_env(config.unset_environment)),
    }
}

/// Activate and classify every inherited socket
pub fn activate(source: &mut dyn SocketSource) -> Result<Vec<InheritedSocket>> {
    let activated = source.activate()?;
    if activated.is_empty() {
        return Err(ActivationError::NoSockets.into());
    }
    activated
        .into_iter()
        .map(|ActivatedFd { fd, name }| InheritedSocket::classify(fd, name))
        .collect()
}
