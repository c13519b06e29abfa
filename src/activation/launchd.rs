//! launchd socket activation
//!
//! launchd opens the sockets declared under `Sockets` in the job's plist and
//! hands them out by name through `launch_activate_socket(3)`. A single name
//! may carry several descriptors (e.g. one per address family).
//!
//! Names are either listed explicitly or read from the keys of the job's
//! `Sockets` dictionary.

use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, info};

use super::{ActivatedFd, ActivationError, SocketSource};
use crate::Result;

/// Socket name used by single-socket launchd jobs
pub const DEFAULT_SOCKET_NAME: &str = "Socket";

/// Job definition read when `--plist` is given without a path
pub const DEFAULT_PLIST: &str = "/Library/LaunchDaemons/me.lucky.init-proxyd.plist";

/// Plist path standing for "just the default socket name"
pub const PLIST_DEFAULT_SOCKET: &str = "-";

/// Sockets activated by name through launchd
#[derive(Debug, Clone, Default)]
pub struct Launchd {
    names: Vec<String>,
    plist: Option<PathBuf>,
}

impl Launchd {
    pub fn new(names: Vec<String>) -> Self {
        Self { names, plist: None }
    }

    /// Take the socket names from the job's plist instead of the list.
    /// A path of `-` selects [`DEFAULT_SOCKET_NAME`] alone.
    pub fn with_plist(mut self, plist: impl Into<PathBuf>) -> Self {
        self.plist = Some(plist.into());
        self
    }

    fn socket_names(&mut self) -> Result<Vec<String>> {
        let names = std::mem::take(&mut self.names);
        match self.plist.take() {
            None => Ok(names),
            Some(path) if path.as_os_str() == PLIST_DEFAULT_SOCKET => {
                Ok(vec![DEFAULT_SOCKET_NAME.to_string()])
            }
            Some(path) => {
                let names = socket_names_from_plist(&path)?;
                if names.is_empty() {
                    return Err(ActivationError::NoSocketNames(path).into());
                }
                debug!(plist = %path.display(), names = ?names, "Read launchd socket names");
                Ok(names)
            }
        }
    }
}

/// Keys of the top-level `Sockets` dictionary of a launchd job definition.
/// A job without `Sockets` yields no names.
pub fn socket_names_from_plist(path: &Path) -> Result<Vec<String>> {
    let job = plist::Value::from_file(path)
        .with_context(|| format!("Failed to read launchd plist: {}", path.display()))?;
    let job = job
        .as_dictionary()
        .with_context(|| format!("launchd plist is not a dictionary: {}", path.display()))?;

    let names = match job.get("Sockets") {
        None => Vec::new(),
        Some(sockets) => sockets
            .as_dictionary()
            .with_context(|| format!("Sockets in {} is not a dictionary", path.display()))?
            .keys()
            .cloned()
            .collect(),
    };
    Ok(names)
}

impl SocketSource for Launchd {
    fn activate(&mut self) -> Result<Vec<ActivatedFd>> {
        let mut activated = Vec::new();
        for name in self.socket_names()? {
            let fds = activate_socket(&name)?;
            info!(name = %name, count = fds.len(), "Activated launchd socket");
            activated.extend(fds.into_iter().map(|fd| ActivatedFd {
                fd,
                name: Some(name.clone()),
            }));
        }
        Ok(activated)
    }
}

/// Map a `launch_activate_socket` error code
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn activation_error(name: &str, errno: i32) -> ActivationError {
    match errno {
        libc::ENOENT => ActivationError::NotExist(name.to_string()),
        libc::ESRCH => ActivationError::NotManaged,
        libc::EALREADY => ActivationError::AlreadyActivated(name.to_string()),
        errno => ActivationError::Launchd {
            name: name.to_string(),
            errno,
        },
    }
}

#[cfg(target_os = "macos")]
fn activate_socket(name: &str) -> std::result::Result<Vec<OwnedFd>, ActivationError> {
    use std::ffi::CString;
    use std::os::fd::FromRawFd;
    use std::ptr;

    extern "C" {
        fn launch_activate_socket(
            name: *const libc::c_char,
            fds: *mut *mut libc::c_int,
            cnt: *mut libc::size_t,
        ) -> libc::c_int;
    }

    let c_name = CString::new(name).map_err(|_| ActivationError::NotExist(name.to_string()))?;
    let mut fds: *mut libc::c_int = ptr::null_mut();
    let mut cnt: libc::size_t = 0;

    // SAFETY: valid C string and out-pointers; launchd allocates `fds`
    let errno = unsafe { launch_activate_socket(c_name.as_ptr(), &mut fds, &mut cnt) };
    if errno != 0 {
        return Err(activation_error(name, errno));
    }
    if fds.is_null() {
        return Ok(Vec::new());
    }

    // SAFETY: launchd returned `cnt` descriptors in a malloc'd array that we
    // now own, together with the descriptors themselves
    let owned = unsafe {
        let raw = std::slice::from_raw_parts(fds, cnt).to_vec();
        libc::free(fds.cast());
        raw.into_iter()
            .map(|fd| OwnedFd::from_raw_fd(fd))
            .collect()
    };
    Ok(owned)
}

#[cfg(not(target_os = "macos"))]
fn activate_socket(_name: &str) -> std::result::Result<Vec<OwnedFd>, ActivationError> {
    Err(ActivationError::LaunchdUnsupported)
}
