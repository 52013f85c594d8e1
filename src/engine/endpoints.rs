//! The three well-known journal socket endpoints.
//!
//! Resolution prefers descriptors inherited from socket activation; when none
//! matches, the socket is created fresh, replacing any stale filesystem node
//! left behind by an unclean shutdown. Either way the resulting descriptor is
//! non-blocking and close-on-exec before the dispatcher sees it.

use crate::engine::activation;
use anyhow::{Context, Result};
use log::info;
use std::fs;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixDatagram, UnixListener};
use std::path::{Path, PathBuf};

pub const DEV_LOG_PATH: &str = "/run/systemd/journal/dev-log";
pub const JOURNAL_PATH: &str = "/run/systemd/journal/socket";
pub const STDOUT_PATH: &str = "/run/systemd/journal/stdout";
/// Conventional alias hard-coded into many syslog clients.
pub const DEV_LOG_ALIAS: &str = "/dev/log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockKind {
    Datagram,
    Stream,
}

/// Logical role of an endpoint. One of each exists for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    DevLog,
    Journal,
    Stdout,
}

#[derive(Debug, Clone)]
pub struct EndpointSpec {
    pub role: Role,
    pub path: PathBuf,
    pub kind: SockKind,
}

impl EndpointSpec {
    pub fn new(role: Role, path: impl Into<PathBuf>) -> Self {
        let kind = match role {
            Role::DevLog | Role::Journal => SockKind::Datagram,
            Role::Stdout => SockKind::Stream,
        };
        Self {
            role,
            path: path.into(),
            kind,
        }
    }

    /// The fixed journald socket surface.
    pub fn well_known() -> [EndpointSpec; 3] {
        [
            EndpointSpec::new(Role::DevLog, DEV_LOG_PATH),
            EndpointSpec::new(Role::Journal, JOURNAL_PATH),
            EndpointSpec::new(Role::Stdout, STDOUT_PATH),
        ]
    }
}

/// A resolved endpoint descriptor, typed by socket kind. Stream endpoints are
/// always in the listening state and only ever accepted on, never read.
pub enum Resolved {
    Datagram(UnixDatagram),
    Listener(UnixListener),
}

/// Produces the descriptor for one endpoint. An inherited descriptor matching
/// the declared kind and path wins and is removed from `inherited`; otherwise
/// a fresh socket is bound at the path, replacing any stale node.
pub fn resolve(spec: &EndpointSpec, inherited: &mut Vec<OwnedFd>) -> Result<Resolved> {
    if let Some(i) = inherited
        .iter()
        .position(|fd| activation::matches(fd.as_raw_fd(), spec.kind, &spec.path))
    {
        info!("{}: using inherited descriptor", spec.path.display());
        let fd = inherited.remove(i);
        return finish(spec.kind, fd);
    }

    // Recover from a prior unclean shutdown.
    let _ = fs::remove_file(&spec.path);

    let resolved = match spec.kind {
        SockKind::Datagram => {
            let sock = UnixDatagram::bind(&spec.path)
                .with_context(|| format!("cannot bind {}", spec.path.display()))?;
            Resolved::Datagram(sock)
        }
        SockKind::Stream => {
            let listener = UnixListener::bind(&spec.path)
                .with_context(|| format!("cannot listen on {}", spec.path.display()))?;
            Resolved::Listener(listener)
        }
    };

    // Unprivileged clients must be able to log.
    let _ = fs::set_permissions(&spec.path, fs::Permissions::from_mode(0o666));

    mark(&resolved)?;
    Ok(resolved)
}

fn finish(kind: SockKind, fd: OwnedFd) -> Result<Resolved> {
    let resolved = match kind {
        SockKind::Datagram => Resolved::Datagram(UnixDatagram::from(fd)),
        SockKind::Stream => Resolved::Listener(UnixListener::from(fd)),
    };
    mark(&resolved)?;
    Ok(resolved)
}

/// Non-blocking and close-on-exec, idempotently; inherited descriptors may or
/// may not already carry these flags.
fn mark(resolved: &Resolved) -> Result<()> {
    match resolved {
        Resolved::Datagram(s) => {
            s.set_nonblocking(true).context("set_nonblocking failed")?;
            set_cloexec(s.as_raw_fd());
        }
        Resolved::Listener(l) => {
            l.set_nonblocking(true).context("set_nonblocking failed")?;
            set_cloexec(l.as_raw_fd());
        }
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
}

/// Best-effort compatibility symlink for clients hard-coded to the alias
/// path. Failure (alias exists, no permission) is deliberately ignored.
pub fn install_alias(alias: &Path, real: &Path) {
    let _ = std::os::unix::fs::symlink(real, alias);
}
