//! Socket-activation intake.
//!
//! Implements the receiving side of the `sd_listen_fds(3)` contract without
//! an sd-daemon binding: descriptors handed over by the service manager start
//! at fd 3, `LISTEN_PID` must name this process, and the environment variables
//! are consumed so children never see stale values. Matching a descriptor to
//! an endpoint role checks the socket type, the bound path, and for stream
//! roles the listening state.

use crate::engine::endpoints::SockKind;
use log::warn;
use std::env;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// First inherited descriptor, per `sd_listen_fds(3)`.
pub const LISTEN_FDS_START: RawFd = 3;

/// A well-formed handoff carries a handful of sockets; anything past this is
/// a malformed environment and gets capped.
const MAX_LISTEN_FDS: usize = 64;

/// Takes ownership of any descriptors passed by the activation mechanism.
/// Returns an empty list when not socket-activated.
pub fn inherited_fds() -> Vec<OwnedFd> {
    let count = listen_fd_count(
        env::var("LISTEN_PID").ok().as_deref(),
        env::var("LISTEN_FDS").ok().as_deref(),
        std::process::id(),
    );
    env::remove_var("LISTEN_PID");
    env::remove_var("LISTEN_FDS");

    (0..count)
        .map(|i| unsafe { OwnedFd::from_raw_fd(LISTEN_FDS_START + i as RawFd) })
        .collect()
}

/// How many descriptors the environment says we inherited. Anything
/// malformed, or a `LISTEN_PID` naming someone else, means zero.
fn listen_fd_count(pid: Option<&str>, fds: Option<&str>, self_pid: u32) -> usize {
    let Some(pid) = pid.and_then(|p| p.parse::<u32>().ok()) else {
        return 0;
    };
    if pid != self_pid {
        warn!("LISTEN_PID={} is not us; ignoring inherited descriptors", pid);
        return 0;
    }
    let count = fds.and_then(|n| n.parse::<usize>().ok()).unwrap_or(0);
    if count > MAX_LISTEN_FDS {
        warn!(
            "LISTEN_FDS={} is implausible; keeping the first {}",
            count, MAX_LISTEN_FDS
        );
        return MAX_LISTEN_FDS;
    }
    count
}

/// Whether `fd` is a Unix socket of the given kind bound to `path`, and for
/// stream kinds already in the listening state.
pub fn matches(fd: RawFd, kind: SockKind, path: &Path) -> bool {
    let expected_type = match kind {
        SockKind::Datagram => libc::SOCK_DGRAM,
        SockKind::Stream => libc::SOCK_STREAM,
    };
    if sockopt_int(fd, libc::SOL_SOCKET, libc::SO_TYPE) != Some(expected_type) {
        return false;
    }
    if kind == SockKind::Stream
        && sockopt_int(fd, libc::SOL_SOCKET, libc::SO_ACCEPTCONN) != Some(1)
    {
        return false;
    }
    bound_path(fd).as_deref() == Some(path.as_os_str().as_bytes())
}

fn sockopt_int(fd: RawFd, level: libc::c_int, opt: libc::c_int) -> Option<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            level,
            opt,
            &mut value as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    (rc == 0).then_some(value)
}

/// The filesystem path `fd` is bound to, or `None` for non-Unix sockets and
/// unnamed/abstract ones.
fn bound_path(fd: RawFd) -> Option<Vec<u8>> {
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            fd,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc != 0 || addr.sun_family != libc::AF_UNIX as libc::sa_family_t {
        return None;
    }

    let header = std::mem::size_of::<libc::sa_family_t>();
    let path_len = (len as usize).checked_sub(header)?;
    let raw: Vec<u8> = addr.sun_path[..path_len.min(addr.sun_path.len())]
        .iter()
        .map(|&c| c as u8)
        .take_while(|&c| c != 0)
        .collect();
    // An empty or NUL-leading sun_path is an unnamed or abstract socket.
    (!raw.is_empty()).then_some(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::{UnixDatagram, UnixListener};
    use std::path::PathBuf;

    fn temp_sock(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("nologd_act_{}_{}", name, std::process::id()))
    }

    #[test]
    fn foreign_listen_pid_is_rejected() {
        assert_eq!(listen_fd_count(Some("1"), Some("3"), 4242), 0);
    }

    #[test]
    fn matching_listen_pid_yields_count() {
        assert_eq!(listen_fd_count(Some("4242"), Some("3"), 4242), 3);
    }

    #[test]
    fn implausible_listen_fds_is_capped() {
        assert_eq!(
            listen_fd_count(Some("4242"), Some("9999999999"), 4242),
            MAX_LISTEN_FDS
        );
        assert_eq!(listen_fd_count(Some("4242"), Some("64"), 4242), 64);
    }

    #[test]
    fn malformed_env_means_no_descriptors() {
        assert_eq!(listen_fd_count(None, Some("2"), 4242), 0);
        assert_eq!(listen_fd_count(Some("nope"), Some("2"), 4242), 0);
        assert_eq!(listen_fd_count(Some("4242"), Some("many"), 4242), 0);
        assert_eq!(listen_fd_count(Some("4242"), None, 4242), 0);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn bound_datagram_socket_matches_its_role() {
        let path = temp_sock("dgram");
        let _ = std::fs::remove_file(&path);
        let sock = UnixDatagram::bind(&path).expect("bind failed");

        assert!(matches(sock.as_raw_fd(), SockKind::Datagram, &path));
        assert!(!matches(sock.as_raw_fd(), SockKind::Stream, &path));
        assert!(!matches(
            sock.as_raw_fd(),
            SockKind::Datagram,
            Path::new("/some/other/path")
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn listener_matches_stream_role_only() {
        let path = temp_sock("stream");
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).expect("bind failed");

        assert!(matches(listener.as_raw_fd(), SockKind::Stream, &path));
        assert!(!matches(listener.as_raw_fd(), SockKind::Datagram, &path));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn unbound_socket_matches_nothing() {
        let sock = UnixDatagram::unbound().expect("socket failed");
        assert!(!matches(
            sock.as_raw_fd(),
            SockKind::Datagram,
            Path::new("/tmp/whatever")
        ));
    }
}
