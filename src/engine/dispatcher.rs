//! The readiness dispatcher: a single-threaded poll loop multiplexing the
//! three fixed endpoints plus every accepted stdout connection.
//!
//! All watched descriptors are non-blocking; the blocking wait is the only
//! suspension point. On each wakeup the ready descriptor is drained to
//! would-block through its protocol's normalizer into the sink. The event
//! buffer holds a single event, so descriptors are handled strictly one at a
//! time in the order the kernel reports them.

use crate::engine::endpoints::{Resolved, Role};
use crate::engine::normalize::Protocol;
use crate::engine::sink::Sink;
use anyhow::{bail, Context, Result};
use log::{debug, warn};
use mio::net::{UnixDatagram, UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io::{self, Read};

const DEV_LOG: Token = Token(0);
const JOURNAL: Token = Token(1);
const STDOUT: Token = Token(2);
/// Connection tokens start past the fixed endpoints and only ever grow.
const FIRST_CONNECTION: usize = 3;

/// One read per chunk; matches the datagram sizes journald clients send.
const CHUNK_SIZE: usize = 2048;

struct Connection {
    stream: UnixStream,
    proto: Protocol,
}

/// Owns the poll instance, the sink, the watched descriptor set and the one
/// scratch buffer every drain reuses. Strictly single-threaded; nothing here
/// is shared across threads.
pub struct Dispatcher {
    poll: Poll,
    events: Events,
    scratch: Box<[u8; CHUNK_SIZE]>,
    sink: Sink,
    dev_log: Option<(UnixDatagram, Protocol)>,
    journal: Option<(UnixDatagram, Protocol)>,
    stdout: Option<(UnixListener, Protocol)>,
    connections: HashMap<Token, Connection>,
    next_connection: usize,
}

impl Dispatcher {
    pub fn new(sink: Sink) -> Result<Self> {
        Ok(Self {
            poll: Poll::new().context("cannot create poll instance")?,
            events: Events::with_capacity(1),
            scratch: Box::new([0u8; CHUNK_SIZE]),
            sink,
            dev_log: None,
            journal: None,
            stdout: None,
            connections: HashMap::new(),
            next_connection: FIRST_CONNECTION,
        })
    }

    /// Registers a resolved endpoint under its role. Datagram endpoints are
    /// drained through `proto`; for the stdout listener, `proto` is applied
    /// to every connection it later spawns.
    pub fn watch(&mut self, role: Role, resolved: Resolved, proto: Protocol) -> Result<()> {
        match (role, resolved) {
            (Role::DevLog, Resolved::Datagram(sock)) => {
                let mut sock = UnixDatagram::from_std(sock);
                self.poll
                    .registry()
                    .register(&mut sock, DEV_LOG, Interest::READABLE)?;
                self.dev_log = Some((sock, proto));
            }
            (Role::Journal, Resolved::Datagram(sock)) => {
                let mut sock = UnixDatagram::from_std(sock);
                self.poll
                    .registry()
                    .register(&mut sock, JOURNAL, Interest::READABLE)?;
                self.journal = Some((sock, proto));
            }
            (Role::Stdout, Resolved::Listener(listener)) => {
                let mut listener = UnixListener::from_std(listener);
                self.poll
                    .registry()
                    .register(&mut listener, STDOUT, Interest::READABLE)?;
                self.stdout = Some((listener, proto));
            }
            (role, _) => bail!("endpoint kind does not fit role {:?}", role),
        }
        Ok(())
    }

    /// Whether at least one endpoint is being watched. With none, running the
    /// loop would block forever for nothing.
    pub fn has_endpoints(&self) -> bool {
        self.dev_log.is_some() || self.journal.is_some() || self.stdout.is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Runs until the process is externally terminated. Only a failing wait
    /// is fatal; everything per-descriptor is recoverable.
    pub fn run(mut self) -> Result<()> {
        loop {
            self.poll_once()?;
        }
    }

    /// Blocks for one readiness event and services it. Signal interruption
    /// retries on the next call; any other wait failure is fatal.
    pub fn poll_once(&mut self) -> Result<()> {
        if let Err(e) = self.poll.poll(&mut self.events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e).context("event wait failed");
        }
        let ready: Vec<Token> = self.events.iter().map(|ev| ev.token()).collect();
        for token in ready {
            self.service(token);
        }
        Ok(())
    }

    fn service(&mut self, token: Token) {
        match token {
            DEV_LOG => {
                if let Some((sock, proto)) = &self.dev_log {
                    drain_datagram(sock, *proto, &mut self.scratch[..], &mut self.sink);
                }
            }
            JOURNAL => {
                if let Some((sock, proto)) = &self.journal {
                    drain_datagram(sock, *proto, &mut self.scratch[..], &mut self.sink);
                }
            }
            STDOUT => self.accept_pending(),
            token => self.drain_connection(token),
        }
    }

    /// Accepts every pending stdout peer and adds it to the watched set. A
    /// transient accept failure is logged and never fatal; the kernel backlog
    /// is the only admission control.
    fn accept_pending(&mut self) {
        let Some((listener, proto)) = &self.stdout else {
            return;
        };
        let proto = *proto;
        loop {
            match listener.accept() {
                Ok((mut stream, _)) => {
                    let token = Token(self.next_connection);
                    self.next_connection += 1;
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        warn!("cannot watch accepted connection: {}", e);
                        continue;
                    }
                    self.connections.insert(token, Connection { stream, proto });
                    debug!("stdout connection accepted ({} open)", self.connections.len());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn drain_connection(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            debug!("event for unknown descriptor {:?}, ignoring", token);
            return;
        };
        let closed = drain_stream(
            &mut conn.stream,
            conn.proto,
            &mut self.scratch[..],
            &mut self.sink,
        );
        if closed {
            if let Some(mut conn) = self.connections.remove(&token) {
                let _ = self.poll.registry().deregister(&mut conn.stream);
            }
            debug!("stdout connection closed ({} open)", self.connections.len());
        }
    }
}

/// Drains a datagram endpoint. A zero-length datagram is valid empty data,
/// not closure; the loop only ends on would-block (or a logged error).
fn drain_datagram(sock: &UnixDatagram, proto: Protocol, scratch: &mut [u8], sink: &mut Sink) {
    loop {
        match sock.recv(scratch) {
            Ok(n) => {
                if let Some(line) = proto.normalize(&scratch[..n]) {
                    sink.write(&line);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("datagram read failed: {}", e);
                break;
            }
        }
    }
}

/// Drains one stream connection. Returns true when the peer shut down
/// orderly (zero-length read), which is the connection's terminal state; a
/// read error other than would-block ends the drain but keeps it watched.
fn drain_stream(stream: &mut UnixStream, proto: Protocol, scratch: &mut [u8], sink: &mut Sink) -> bool {
    loop {
        match stream.read(scratch) {
            Ok(0) => return true,
            Ok(n) => {
                if let Some(line) = proto.normalize(&scratch[..n]) {
                    sink.write(&line);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("connection read failed: {}", e);
                return false;
            }
        }
    }
}

#[cfg(test)]
#[cfg(target_os = "linux")]
mod tests {
    use super::*;
    use crate::engine::endpoints::{resolve, EndpointSpec};
    use std::io::Write;
    use std::os::unix::net::{UnixDatagram as StdDatagram, UnixStream as StdStream};
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("nologd_disp_{}_{}", name, std::process::id()))
    }

    fn watch_fresh(dispatcher: &mut Dispatcher, role: Role, path: &PathBuf, proto: Protocol) {
        let _ = std::fs::remove_file(path);
        let resolved = resolve(&EndpointSpec::new(role, path), &mut Vec::new()).expect("resolve");
        dispatcher.watch(role, resolved, proto).expect("watch");
    }

    #[test]
    fn syslog_datagrams_land_in_the_sink_in_order() {
        let sock = temp_path("devlog.sock");
        let file = temp_path("devlog.out");
        let _ = std::fs::remove_file(&file);

        let mut dispatcher = Dispatcher::new(Sink::open(&file).unwrap()).unwrap();
        watch_fresh(&mut dispatcher, Role::DevLog, &sock, Protocol::Syslog);

        let client = StdDatagram::unbound().unwrap();
        client
            .send_to(b"<6>Feb  7 23:34:43 unit test message\n", &sock)
            .unwrap();
        client.send_to(b"<4>second", &sock).unwrap();
        client.send_to(b"no tag", &sock).unwrap();
        dispatcher.poll_once().expect("poll");

        let contents = std::fs::read(&file).unwrap();
        assert_eq!(
            contents,
            b"Feb  7 23:34:43 unit test message\nsecond\nno tag\n"
        );
        let _ = std::fs::remove_file(&sock);
        let _ = std::fs::remove_file(&file);
    }

    #[test]
    fn zero_length_datagram_is_data_not_closure() {
        let sock = temp_path("empty.sock");
        let file = temp_path("empty.out");
        let _ = std::fs::remove_file(&file);

        let mut dispatcher = Dispatcher::new(Sink::open(&file).unwrap()).unwrap();
        watch_fresh(&mut dispatcher, Role::Journal, &sock, Protocol::Journal);

        let client = StdDatagram::unbound().unwrap();
        client.send_to(b"", &sock).unwrap();
        dispatcher.poll_once().expect("poll");
        // The endpoint stays watched: a later datagram still arrives.
        client.send_to(b"MESSAGE=after", &sock).unwrap();
        dispatcher.poll_once().expect("poll");

        let contents = std::fs::read(&file).unwrap();
        assert_eq!(contents, b"\nMESSAGE=after\n");
        let _ = std::fs::remove_file(&sock);
        let _ = std::fs::remove_file(&file);
    }

    #[test]
    fn discard_sink_swallows_journal_traffic() {
        let sock = temp_path("discard.sock");
        let mut dispatcher = Dispatcher::new(Sink::discard()).unwrap();
        watch_fresh(&mut dispatcher, Role::Journal, &sock, Protocol::Journal);

        let client = StdDatagram::unbound().unwrap();
        client.send_to(b"hello", &sock).unwrap();
        dispatcher.poll_once().expect("poll");
        let _ = std::fs::remove_file(&sock);
    }

    #[test]
    fn connection_lifecycle_watched_to_closed() {
        let sock = temp_path("lifecycle.sock");
        let mut dispatcher = Dispatcher::new(Sink::discard()).unwrap();
        watch_fresh(&mut dispatcher, Role::Stdout, &sock, Protocol::Stream);

        let client = StdStream::connect(&sock).unwrap();
        dispatcher.poll_once().expect("poll");
        assert_eq!(dispatcher.connection_count(), 1);

        drop(client);
        dispatcher.poll_once().expect("poll");
        assert_eq!(dispatcher.connection_count(), 0, "no residual entry after EOF");
        let _ = std::fs::remove_file(&sock);
    }

    #[test]
    fn concurrent_connections_are_tracked_independently() {
        let sock = temp_path("pair.sock");
        let mut dispatcher = Dispatcher::new(Sink::discard()).unwrap();
        watch_fresh(&mut dispatcher, Role::Stdout, &sock, Protocol::Stream);

        let first = StdStream::connect(&sock).unwrap();
        let second = StdStream::connect(&sock).unwrap();
        dispatcher.poll_once().expect("poll");
        assert_eq!(dispatcher.connection_count(), 2);

        drop(first);
        dispatcher.poll_once().expect("poll");
        assert_eq!(
            dispatcher.connection_count(),
            1,
            "closing one peer must not disturb the other"
        );

        drop(second);
        dispatcher.poll_once().expect("poll");
        assert_eq!(dispatcher.connection_count(), 0);
        let _ = std::fs::remove_file(&sock);
    }

    #[test]
    fn stream_protocol_consumes_without_writing() {
        let sock = temp_path("noop.sock");
        let file = temp_path("noop.out");
        let _ = std::fs::remove_file(&file);

        let mut dispatcher = Dispatcher::new(Sink::open(&file).unwrap()).unwrap();
        watch_fresh(&mut dispatcher, Role::Stdout, &sock, Protocol::Stream);

        let mut client = StdStream::connect(&sock).unwrap();
        dispatcher.poll_once().expect("poll");
        client.write_all(b"captured stdout bytes").unwrap();
        drop(client);
        dispatcher.poll_once().expect("poll");

        assert_eq!(dispatcher.connection_count(), 0);
        let contents = std::fs::read(&file).unwrap();
        assert!(contents.is_empty(), "stream baseline writes nothing");
        let _ = std::fs::remove_file(&sock);
        let _ = std::fs::remove_file(&file);
    }

    #[test]
    fn raw_mode_passes_stream_chunks_through() {
        let sock = temp_path("raw.sock");
        let file = temp_path("raw.out");
        let _ = std::fs::remove_file(&file);

        let mut dispatcher = Dispatcher::new(Sink::open(&file).unwrap()).unwrap();
        watch_fresh(&mut dispatcher, Role::Stdout, &sock, Protocol::Raw);

        let mut client = StdStream::connect(&sock).unwrap();
        dispatcher.poll_once().expect("poll");
        client.write_all(b"as-is").unwrap();
        drop(client);
        dispatcher.poll_once().expect("poll");

        let contents = std::fs::read(&file).unwrap();
        assert_eq!(contents, b"as-is\n");
        let _ = std::fs::remove_file(&sock);
        let _ = std::fs::remove_file(&file);
    }

    #[test]
    fn watch_rejects_mismatched_role_and_kind() {
        let sock = temp_path("mismatch.sock");
        let _ = std::fs::remove_file(&sock);
        let resolved = resolve(
            &EndpointSpec::new(Role::Stdout, &sock),
            &mut Vec::new(),
        )
        .expect("resolve");

        let mut dispatcher = Dispatcher::new(Sink::discard()).unwrap();
        assert!(dispatcher
            .watch(Role::DevLog, resolved, Protocol::Syslog)
            .is_err());
        assert!(!dispatcher.has_endpoints());
        let _ = std::fs::remove_file(&sock);
    }
}
