//! systemd socket activation
//!
//! systemd passes `LISTEN_FDS` descriptors starting at fd 3 and names the
//! process they are meant for in `LISTEN_PID`. Optional names arrive
//! colon-separated in `LISTEN_FDNAMES`.

use std::os::fd::RawFd;

use tracing::debug;

use super::{adopt_fd, ActivatedFd, SocketSource};
use crate::Result;

const LISTEN_FDS_START: RawFd = 3;

const ENV_LISTEN_PID: &str = "LISTEN_PID";
const ENV_LISTEN_FDS: &str = "LISTEN_FDS";
const ENV_LISTEN_FDNAMES: &str = "LISTEN_FDNAMES";

/// Descriptors passed by systemd
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Systemd {
    count: usize,
    names: Vec<String>,
}

impl Systemd {
    /// Read the activation variables of the current process, optionally
    /// removing them so child processes do not inherit them.
    pub fn from_env(unset_environment: bool) -> Self {
        let pid = std::env::var(ENV_LISTEN_PID).ok();
        let fds = std::env::var(ENV_LISTEN_FDS).ok();
        let names = std::env::var(ENV_LISTEN_FDNAMES).ok();

        if unset_environment {
            std::env::remove_var(ENV_LISTEN_PID);
            std::env::remove_var(ENV_LISTEN_FDS);
            std::env::remove_var(ENV_LISTEN_FDNAMES);
        }

        Self::parse(
            pid.as_deref(),
            fds.as_deref(),
            names.as_deref(),
            std::process::id(),
        )
    }

    /// Interpret activation variables for process `pid`. Anything missing,
    /// malformed or addressed to another process means no sockets.
    pub fn parse(
        listen_pid: Option<&str>,
        listen_fds: Option<&str>,
        listen_fdnames: Option<&str>,
        pid: u32,
    ) -> Self {
        let for_us = listen_pid
            .and_then(|value| value.trim().parse::<u32>().ok())
            .is_some_and(|listen_pid| listen_pid == pid);
        if !for_us {
            debug!("{} does not match this process, no systemd sockets", ENV_LISTEN_PID);
            return Self::default();
        }

        let count = listen_fds
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let names = listen_fdnames
            .map(|value| value.split(':').map(str::to_string).collect())
            .unwrap_or_default();

        Self { count, names }
    }

    /// Number of passed descriptors
    pub fn count(&self) -> usize {
        self.count
    }
}

impl SocketSource for Systemd {
    fn activate(&mut self) -> Result<Vec<ActivatedFd>> {
        let count = std::mem::take(&mut self.count);
        let names = std::mem::take(&mut self.names);

        let mut activated = Vec::with_capacity(count);
        for index in 0..count {
            let fd = LISTEN_FDS_START + RawFd::try_from(index)?;
            activated.push(ActivatedFd {
                fd: adopt_fd(fd)?,
                name: names.get(index).filter(|name| !name.is_empty()).cloned(),
            });
        }
        Ok(activated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_for_this_process() {
        let systemd = Systemd::parse(Some("42"), Some("2"), Some("http:dns"), 42);
        assert_eq!(systemd.count(), 2);
        assert_eq!(systemd.names, vec!["http".to_string(), "dns".to_string()]);
    }

    #[test]
    fn test_parse_other_process() {
        let systemd = Systemd::parse(Some("41"), Some("2"), None, 42);
        assert_eq!(systemd, Systemd::default());
    }

    #[test]
    fn test_parse_missing_or_malformed() {
        assert_eq!(Systemd::parse(None, Some("2"), None, 42).count(), 0);
        assert_eq!(Systemd::parse(Some("x"), Some("2"), None, 42).count(), 0);
        assert_eq!(Systemd::parse(Some("42"), None, None, 42).count(), 0);
        assert_eq!(Systemd::parse(Some("42"), Some("-1"), None, 42).count(), 0);
    }

    #[test]
    fn test_no_sockets_activates_nothing() {
        let mut systemd = Systemd::default();
        assert!(systemd.activate().unwrap().is_empty());
    }
}
