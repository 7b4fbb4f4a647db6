//! Integration tests for servers, connections and the manager.
//!
//! Each test drives a real `EventLoop` with `turn()` on the test thread while
//! std clients run either inline (connect and send only) or in helper
//! threads (anything that blocks on a read).

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::Token;
use tempfile::TempDir;

use crate::addr::{ListenAddr, PeerAddr};
use crate::buffer::ReadBuffer;
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionInfo, ConnectionSetup, ConnectionState};
use crate::error::{ConnectionError, ServerError};
use crate::handler::{ConnectionHandler, ServerContext};
use crate::manager::{Manager, ManagerContext, ManagerHandler, ManagerState};
use crate::reactor::{Dispatch, EventLoop, ServerId, TimerKind};
use crate::server::{Server, ServerState, StopProgress};
use crate::socket::Stream;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Helpers
// ============================================================================

fn tcp_config() -> ServerConfig {
    ServerConfig::new(SocketAddr::from(([127, 0, 0, 1], 0))).without_write_timeout()
}

/// Turns the loop until `done` holds, failing the test after `TEST_TIMEOUT`.
fn pump_until<D: Dispatch>(event_loop: &mut EventLoop, target: &mut D, mut done: impl FnMut(&D) -> bool) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while !done(target) {
        assert!(Instant::now() < deadline, "condition not reached in time");
        event_loop
            .turn(target, Some(Duration::from_millis(10)))
            .expect("event loop turn failed");
    }
}

/// Connects and sends one byte. Listeners defer accept until data arrives.
fn connect_and_poke(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).expect("connect failed");
    stream.write_all(b"x").expect("poke failed");
    stream
}

fn spawn_client<T, F>(addr: SocketAddr, f: F) -> thread::JoinHandle<T>
where
    T: Send + 'static,
    F: FnOnce(TcpStream) -> T + Send + 'static,
{
    thread::spawn(move || {
        let stream = TcpStream::connect(addr).expect("connect failed");
        stream
            .set_read_timeout(Some(TEST_TIMEOUT))
            .expect("set_read_timeout failed");
        f(stream)
    })
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ============================================================================
// Handlers
// ============================================================================

/// Echoes every read and records what happened.
#[derive(Default)]
struct Echo {
    started: usize,
    reads: Vec<usize>,
    destroyed: Vec<Option<ConnectionError>>,
    completed: usize,
}

impl ConnectionHandler for Echo {
    type Session = ();

    fn on_started(&mut self, _server: &ServerContext) {
        self.started += 1;
    }

    fn on_read(&mut self, conn: &mut Connection<()>, n: usize) {
        self.reads.push(n);
        if n == 0 {
            return;
        }
        let data = conn.read_buffer().filled().to_vec();
        conn.read_buffer_mut().clear();
        conn.write(&data);
    }

    fn on_connection_destroy(&mut self, _conn: Connection<()>, error: Option<ConnectionError>) {
        self.destroyed.push(error);
    }

    fn on_graceful_stop_complete(&mut self, _server: &ServerContext) {
        self.completed += 1;
    }
}

/// Never consumes its read buffer.
#[derive(Default)]
struct Hoarder {
    tiny_buffer: bool,
    destroyed: Vec<Option<ConnectionError>>,
}

impl ConnectionHandler for Hoarder {
    type Session = ();

    fn on_connection_create(&mut self, _server: &ServerContext, _info: &ConnectionInfo) -> ConnectionSetup<()> {
        let setup = ConnectionSetup::new(());
        if self.tiny_buffer {
            setup.with_read_buffer(ReadBuffer::from_vec(vec![0; 4]))
        } else {
            setup
        }
    }

    fn on_read(&mut self, _conn: &mut Connection<()>, _n: usize) {}

    fn on_connection_destroy(&mut self, _conn: Connection<()>, error: Option<ConnectionError>) {
        self.destroyed.push(error);
    }
}

/// Sends a fixed payload once the first bytes arrive.
struct Sender {
    payload: Vec<u8>,
    chunk: usize,
    write_now: bool,
    queued_after_write: Option<usize>,
}

impl ConnectionHandler for Sender {
    type Session = bool;

    fn on_connection_create(&mut self, _server: &ServerContext, _info: &ConnectionInfo) -> ConnectionSetup<bool> {
        ConnectionSetup::new(false).with_write_now(self.write_now)
    }

    fn on_read(&mut self, conn: &mut Connection<bool>, n: usize) {
        conn.read_buffer_mut().clear();
        if n == 0 || *conn.session() {
            return;
        }
        *conn.session_mut() = true;

        for (i, chunk) in self.payload.chunks(self.chunk).enumerate() {
            // Switching policy mid-burst must not reorder anything.
            if i == 10 {
                conn.set_write_now(true);
            }
            conn.write_bytes(Bytes::copy_from_slice(chunk));
        }
        self.queued_after_write = Some(conn.pending_write_bytes());
    }
}

/// Graceful-close policy chosen per connection: connections created at or
/// after `defer_from` (1-based) defer their close.
struct Polite {
    defer_from: usize,
    created: usize,
    destroyed: usize,
    completed: usize,
}

impl Polite {
    fn deferring_from(defer_from: usize) -> Self {
        Self {
            defer_from,
            created: 0,
            destroyed: 0,
            completed: 0,
        }
    }
}

impl ConnectionHandler for Polite {
    type Session = bool;

    fn on_connection_create(&mut self, _server: &ServerContext, _info: &ConnectionInfo) -> ConnectionSetup<bool> {
        self.created += 1;
        ConnectionSetup::new(self.created >= self.defer_from)
    }

    fn on_read(&mut self, conn: &mut Connection<bool>, _n: usize) {
        conn.read_buffer_mut().clear();
    }

    fn on_graceful_close(&mut self, conn: &mut Connection<bool>) -> bool {
        if *conn.session() {
            return false;
        }
        conn.close();
        true
    }

    fn on_connection_destroy(&mut self, _conn: Connection<bool>, _error: Option<ConnectionError>) {
        self.destroyed += 1;
    }

    fn on_graceful_stop_complete(&mut self, _server: &ServerContext) {
        self.completed += 1;
    }
}

/// Counts creates and destroys; a destroy without a matching create fails.
#[derive(Default)]
struct Churn {
    created: usize,
    destroyed: usize,
}

impl ConnectionHandler for Churn {
    type Session = ();

    fn on_connection_create(&mut self, _server: &ServerContext, _info: &ConnectionInfo) -> ConnectionSetup<()> {
        self.created += 1;
        ConnectionSetup::default()
    }

    fn on_read(&mut self, conn: &mut Connection<()>, _n: usize) {
        conn.read_buffer_mut().clear();
    }

    fn on_connection_destroy(&mut self, _conn: Connection<()>, _error: Option<ConnectionError>) {
        assert!(self.destroyed < self.created, "destroyed more connections than were created");
        self.destroyed += 1;
    }
}

/// Keeps the read idle timer running across reads.
#[derive(Default)]
struct Idle {
    destroyed: Vec<Option<ConnectionError>>,
}

impl ConnectionHandler for Idle {
    type Session = ();

    fn on_read(&mut self, conn: &mut Connection<()>, _n: usize) {
        conn.read_buffer_mut().clear();
        conn.restart_read_timer();
    }

    fn on_connection_destroy(&mut self, _conn: Connection<()>, error: Option<ConnectionError>) {
        self.destroyed.push(error);
    }
}

/// Queues `len` bytes on the first read and never reads again.
struct Flood {
    len: usize,
    destroyed: Vec<Option<ConnectionError>>,
}

impl ConnectionHandler for Flood {
    type Session = bool;

    fn on_read(&mut self, conn: &mut Connection<bool>, n: usize) {
        conn.read_buffer_mut().clear();
        if n == 0 || *conn.session() {
            return;
        }
        *conn.session_mut() = true;
        conn.write_bytes(Bytes::from(vec![0u8; self.len]));
    }

    fn on_connection_destroy(&mut self, _conn: Connection<bool>, error: Option<ConnectionError>) {
        self.destroyed.push(error);
    }
}

#[derive(Default)]
struct Watch {
    started: usize,
    completed: usize,
}

impl ManagerHandler for Watch {
    fn on_started(&mut self, _manager: &ManagerContext) {
        self.started += 1;
    }

    fn on_graceful_stop_complete(&mut self, _manager: &ManagerContext) {
        self.completed += 1;
    }
}

// ============================================================================
// Server Lifecycle
// ============================================================================

#[test]
fn test_server_lifecycle_states() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let mut server = Server::new(tcp_config(), Echo::default());
    assert_eq!(server.state(), ServerState::Idle);

    server.bind().expect("bind");
    assert_eq!(server.state(), ServerState::Bound);
    let bound = server.local_addr().expect("bound address");
    assert_ne!(bound.port(), 0);

    server.listen().expect("listen");
    assert_eq!(server.state(), ServerState::Listening);

    server.accept(event_loop.reactor_mut()).expect("accept");
    assert_eq!(server.state(), ServerState::Accepting);
    assert_eq!(server.handler().started, 1);
    assert_eq!(server.local_addr(), Some(bound));

    server.stop(event_loop.reactor_mut());
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(server.is_stopped());
}

#[test]
fn test_operations_in_wrong_state_are_rejected() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let mut server = Server::new(tcp_config(), Echo::default());

    assert!(matches!(
        server.listen(),
        Err(ServerError::InvalidState { op: "listen", state: ServerState::Idle })
    ));
    assert!(matches!(
        server.accept(event_loop.reactor_mut()),
        Err(ServerError::InvalidState { op: "accept", .. })
    ));

    server.start(event_loop.reactor_mut()).expect("start server");
    assert!(matches!(
        server.bind(),
        Err(ServerError::InvalidState { op: "bind", state: ServerState::Accepting })
    ));
}

#[test]
fn test_bind_failure_leaves_server_idle() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let mut first = Server::new(tcp_config(), Echo::default());
    first.start(event_loop.reactor_mut()).expect("start server");
    let taken = first.local_addr().expect("bound address");

    let mut second = Server::new(ServerConfig::new(taken), Echo::default());
    let err = second.bind().expect_err("address is taken");
    assert!(matches!(err, ServerError::BindFailed { .. }), "unexpected error: {err}");
    assert_eq!(second.state(), ServerState::Idle);
}

#[test]
fn test_invalid_config_fails_bind() {
    let mut server = Server::new(tcp_config().with_read_buffer_size(0), Echo::default());
    assert!(matches!(server.bind(), Err(ServerError::Config(_))));
    assert_eq!(server.state(), ServerState::Idle);
}

// ============================================================================
// Data Path
// ============================================================================

#[test]
fn test_echo_round_trip() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let mut server = Server::new(tcp_config(), Echo::default());
    server.start(event_loop.reactor_mut()).expect("start server");
    let addr = server.local_addr().expect("bound address");

    let client = spawn_client(addr, |mut stream| {
        stream.write_all(b"hello").expect("write failed");
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).expect("read failed");
        buf
    });

    pump_until(&mut event_loop, &mut server, |_| client.is_finished());
    assert_eq!(&client.join().expect("thread panicked"), b"hello");

    pump_until(&mut event_loop, &mut server, |s| s.active_connections() == 0);
    let handler = server.handler();
    assert_eq!(handler.reads.first(), Some(&5));
    assert_eq!(handler.reads.last(), Some(&0));
    assert_eq!(handler.destroyed.len(), 1);
    assert!(handler.destroyed[0].is_none());
}

#[test]
fn test_unix_socket_echo() {
    let dir = TempDir::new().expect("create temp dir");
    let path = dir.path().join("echo.sock");
    let config = ServerConfig::new(ListenAddr::unix(&path).expect("valid unix path"));

    let mut event_loop = EventLoop::new().expect("create event loop");
    let mut server = Server::new(config, Echo::default());
    server.start(event_loop.reactor_mut()).expect("start server");
    assert!(server.local_addr().is_none());

    let client = thread::spawn(move || {
        let mut stream = StdUnixStream::connect(&path).expect("connect failed");
        stream.set_read_timeout(Some(TEST_TIMEOUT)).expect("set_read_timeout failed");
        stream.write_all(b"over unix").expect("write failed");
        let mut buf = [0u8; 9];
        stream.read_exact(&mut buf).expect("read failed");
        buf
    });

    pump_until(&mut event_loop, &mut server, |_| client.is_finished());
    assert_eq!(&client.join().expect("thread panicked"), b"over unix");
}

#[test]
fn test_queued_writes_arrive_in_call_order() {
    let payload = pattern(5_000);
    let mut event_loop = EventLoop::new().expect("create event loop");
    let mut server = Server::new(
        tcp_config(),
        Sender {
            payload: payload.clone(),
            chunk: 7,
            write_now: false,
            queued_after_write: None,
        },
    );
    server.start(event_loop.reactor_mut()).expect("start server");
    let addr = server.local_addr().expect("bound address");

    let expected = payload.len();
    let client = spawn_client(addr, move |mut stream| {
        stream.write_all(b"go").expect("write failed");
        let mut buf = vec![0u8; expected];
        stream.read_exact(&mut buf).expect("read failed");
        buf
    });

    pump_until(&mut event_loop, &mut server, |_| client.is_finished());
    assert_eq!(client.join().expect("thread panicked"), payload);
    // Always-queue policy: nothing went out before the first writable event.
    assert_eq!(server.handler().queued_after_write, Some(payload.len()));
}

#[test]
fn test_large_write_drains_completely() {
    const LEN: usize = 10 * 1024 * 1024;
    let payload = pattern(LEN);
    let mut event_loop = EventLoop::new().expect("create event loop");
    let mut server = Server::new(
        tcp_config(),
        Sender {
            payload: payload.clone(),
            chunk: LEN,
            write_now: true,
            queued_after_write: None,
        },
    );
    server.start(event_loop.reactor_mut()).expect("start server");
    let addr = server.local_addr().expect("bound address");

    let client = spawn_client(addr, move |mut stream| {
        stream.write_all(b"go").expect("write failed");
        thread::sleep(Duration::from_millis(100));
        let mut buf = vec![0u8; LEN];
        stream.read_exact(&mut buf).expect("read failed");
        buf
    });

    pump_until(&mut event_loop, &mut server, |_| client.is_finished());
    let received = client.join().expect("thread panicked");
    assert!(received == payload, "payload corrupted in transit");

    let queued = server.handler().queued_after_write.expect("payload was written");
    assert!(queued > 0 && queued < LEN, "expected a partial immediate send, queued {queued}");

    for fd in server.connection_fds() {
        assert_eq!(server.connection(fd).expect("live connection").pending_write_bytes(), 0);
    }
}

#[test]
fn test_full_read_buffer_closes_connection() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let mut server = Server::new(tcp_config().with_read_buffer_size(16), Hoarder::default());
    server.start(event_loop.reactor_mut()).expect("start server");
    let addr = server.local_addr().expect("bound address");

    let mut stream = connect_and_poke(addr);
    stream.write_all(&[7u8; 64]).expect("write failed");

    pump_until(&mut event_loop, &mut server, |s| !s.handler().destroyed.is_empty());
    let destroyed = &server.handler().destroyed;
    assert_eq!(destroyed.len(), 1);
    let error = destroyed[0].as_ref().expect("closed with an error");
    assert!(matches!(error, ConnectionError::BufferFull));
    assert_eq!(error.raw_os_error(), Some(libc::ENOBUFS));
    assert_eq!(server.active_connections(), 0);
}

#[test]
fn test_embedder_supplied_buffer_is_used() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let mut server = Server::new(
        tcp_config(),
        Hoarder {
            tiny_buffer: true,
            destroyed: Vec::new(),
        },
    );
    server.start(event_loop.reactor_mut()).expect("start server");
    let addr = server.local_addr().expect("bound address");

    let mut stream = connect_and_poke(addr);
    stream.write_all(b"more than four").expect("write failed");

    pump_until(&mut event_loop, &mut server, |s| !s.handler().destroyed.is_empty());
    assert!(matches!(
        server.handler().destroyed[0],
        Some(ConnectionError::BufferFull)
    ));
}

#[test]
fn test_read_idle_timeout_closes_connection() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let config = tcp_config().with_read_timeout(Duration::from_millis(50));
    let mut server = Server::new(config, Idle::default());
    server.start(event_loop.reactor_mut()).expect("start server");
    let addr = server.local_addr().expect("bound address");

    let _stream = connect_and_poke(addr);
    pump_until(&mut event_loop, &mut server, |s| !s.handler().destroyed.is_empty());

    let error = server.handler().destroyed[0].as_ref().expect("closed with an error");
    assert!(matches!(error, ConnectionError::ReadTimeout));
    assert!(error.is_timeout());
    assert_eq!(server.active_connections(), 0);
}

#[test]
fn test_write_idle_timeout_closes_stalled_connection() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let config = tcp_config().with_write_timeout(Duration::from_millis(100));
    let flood = Flood {
        len: 32 * 1024 * 1024,
        destroyed: Vec::new(),
    };
    let mut server = Server::new(config, flood);
    server.start(event_loop.reactor_mut()).expect("start server");
    let addr = server.local_addr().expect("bound address");

    // The peer never reads, so the queue stops draining once the socket
    // buffers fill up.
    let _stream = connect_and_poke(addr);
    pump_until(&mut event_loop, &mut server, |s| !s.handler().destroyed.is_empty());

    let error = server.handler().destroyed[0].as_ref().expect("closed with an error");
    assert!(matches!(error, ConnectionError::WriteTimeout));
    assert_eq!(error.raw_os_error(), Some(libc::ETIMEDOUT));
    assert_eq!(server.active_connections(), 0);
}

#[test]
fn test_unbounded_read_timeout_keeps_serving() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let config = tcp_config().with_read_timeout(Duration::MAX);
    let mut server = Server::new(config, Echo::default());
    server.start(event_loop.reactor_mut()).expect("start server");
    let addr = server.local_addr().expect("bound address");

    let mut stream = connect_and_poke(addr);
    stream
        .set_read_timeout(Some(TEST_TIMEOUT))
        .expect("set_read_timeout failed");
    pump_until(&mut event_loop, &mut server, |s| !s.handler().reads.is_empty());

    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).expect("read failed");
    assert_eq!(&buf, b"x");
    assert_eq!(server.active_connections(), 1);
    assert!(server.handler().destroyed.is_empty());
}

#[test]
fn test_active_count_tracks_churn() {
    const CLIENTS: usize = 20;
    let mut event_loop = EventLoop::new().expect("create event loop");
    let mut server = Server::new(tcp_config(), Churn::default());
    server.start(event_loop.reactor_mut()).expect("start server");
    let addr = server.local_addr().expect("bound address");

    for _ in 0..CLIENTS {
        drop(connect_and_poke(addr));
    }

    pump_until(&mut event_loop, &mut server, |s| {
        let h = s.handler();
        assert_eq!(s.active_connections(), h.created - h.destroyed);
        h.destroyed == CLIENTS
    });
    assert_eq!(server.handler().created, CLIENTS);
    assert_eq!(server.active_connections(), 0);
}

#[test]
fn test_close_connection_from_outside_callbacks() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let mut server = Server::new(tcp_config(), Echo::default());
    server.start(event_loop.reactor_mut()).expect("start server");
    let addr = server.local_addr().expect("bound address");

    let mut stream = connect_and_poke(addr);
    stream.set_read_timeout(Some(TEST_TIMEOUT)).expect("set_read_timeout failed");
    pump_until(&mut event_loop, &mut server, |s| !s.handler().reads.is_empty());
    let fd = server.connection_fds()[0];

    let queued = server.with_connection(event_loop.reactor_mut(), fd, |conn| {
        conn.write(b"!");
        conn.pending_write_bytes()
    });
    assert_eq!(queued, Some(0));

    // The echoed poke, then the byte pushed from outside.
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).expect("read failed");
    assert_eq!(&buf, b"x!");

    assert!(server.close_connection(event_loop.reactor_mut(), fd));
    assert!(!server.close_connection(event_loop.reactor_mut(), fd));
    assert_eq!(server.active_connections(), 0);
    assert_eq!(server.handler().destroyed.len(), 1);
    assert!(server.with_connection(event_loop.reactor_mut(), fd, |_| ()).is_none());
}

// ============================================================================
// Graceful Stop
// ============================================================================

#[test]
fn test_graceful_stop_without_connections_completes_immediately() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let mut server = Server::new(tcp_config(), Echo::default());
    server.start(event_loop.reactor_mut()).expect("start server");

    assert_eq!(server.graceful_stop(event_loop.reactor_mut()), StopProgress::Complete);
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(server.handler().completed, 1);

    // A second request changes nothing.
    assert_eq!(server.graceful_stop(event_loop.reactor_mut()), StopProgress::Complete);
    assert_eq!(server.handler().completed, 1);
}

#[test]
fn test_graceful_stop_waits_for_deferred_connection() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let mut server = Server::new(tcp_config(), Polite::deferring_from(3));
    server.start(event_loop.reactor_mut()).expect("start server");
    let addr = server.local_addr().expect("bound address");

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(connect_and_poke(addr));
        // Accept in order so the third accepted connection is the one that defers.
        pump_until(&mut event_loop, &mut server, |s| s.handler().created == clients.len());
    }
    assert_eq!(server.active_connections(), 3);

    let progress = server.graceful_stop(event_loop.reactor_mut());
    assert_eq!(progress, StopProgress::Pending);
    assert_eq!(server.state(), ServerState::GracefullyStopping);
    assert_eq!(server.active_connections(), 1);
    assert_eq!(server.handler().destroyed, 2);
    assert_eq!(server.handler().completed, 0);

    let fd = server.connection_fds()[0];
    assert_eq!(
        server.connection(fd).expect("live connection").state(),
        ConnectionState::PendingClose
    );

    assert!(server.close_connection(event_loop.reactor_mut(), fd));
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(server.handler().completed, 1);
    assert_eq!(server.active_connections(), 0);
}

#[test]
fn test_graceful_stop_completes_once_after_all_deferred_close() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let mut server = Server::new(tcp_config(), Polite::deferring_from(1));
    server.start(event_loop.reactor_mut()).expect("start server");
    let addr = server.local_addr().expect("bound address");

    let first = connect_and_poke(addr);
    let second = connect_and_poke(addr);
    pump_until(&mut event_loop, &mut server, |s| s.active_connections() == 2);

    assert_eq!(server.graceful_stop(event_loop.reactor_mut()), StopProgress::Pending);
    assert_eq!(server.active_connections(), 2);

    // One peer hangs up: the server keeps waiting for the other.
    drop(first);
    pump_until(&mut event_loop, &mut server, |s| s.active_connections() == 1);
    assert_eq!(server.handler().completed, 0);

    drop(second);
    pump_until(&mut event_loop, &mut server, |s| s.is_stopped());
    assert_eq!(server.handler().completed, 1);
    assert_eq!(server.handler().destroyed, 2);
}

#[test]
fn test_shutdown_handle_stops_running_server() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let mut server = Server::new(tcp_config(), Echo::default());
    server.start(event_loop.reactor_mut()).expect("start server");

    let handle = event_loop.shutdown_handle();
    let trigger = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        handle.request().expect("request shutdown");
    });

    event_loop.run(&mut server).expect("event loop run failed");
    trigger.join().expect("thread panicked");
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(server.handler().completed, 1);
}

// ============================================================================
// Manager
// ============================================================================

#[test]
fn test_manager_graceful_stop_across_servers() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let mut manager = Manager::new(Watch::default());
    let echo = manager.add_server(Server::new(tcp_config(), Echo::default())).expect("add server");
    let polite = manager
        .add_server(Server::new(tcp_config(), Polite::deferring_from(1)))
        .expect("add server");
    assert_eq!((echo, polite), (ServerId(1), ServerId(2)));

    assert_eq!(manager.start(event_loop.reactor_mut()), 2);
    assert_eq!(manager.state(), ManagerState::Accepting);
    assert_eq!(manager.handler().started, 1);
    assert!(matches!(
        manager.add_server(Server::new(tcp_config(), Echo::default())),
        Err(ServerError::ManagerStarted)
    ));

    let echo_addr = manager
        .server(echo)
        .and_then(|s| s.local_addr())
        .expect("bound address");
    let polite_addr = manager
        .server(polite)
        .and_then(|s| s.local_addr())
        .expect("bound address");
    let _echo_client = connect_and_poke(echo_addr);
    let polite_client = connect_and_poke(polite_addr);
    pump_until(&mut event_loop, &mut manager, |m| {
        m.servers().all(|s| s.active_connections() == 1)
    });

    assert_eq!(manager.graceful_stop(event_loop.reactor_mut()), StopProgress::Pending);
    assert_eq!(manager.server(echo).expect("managed server").state(), ServerState::Stopped);
    assert_eq!(
        manager.server(polite).expect("managed server").state(),
        ServerState::GracefullyStopping
    );
    assert_eq!(manager.stopped_servers(), 1);
    assert_eq!(manager.handler().completed, 0);

    drop(polite_client);
    pump_until(&mut event_loop, &mut manager, |m| m.is_stopped());
    assert_eq!(manager.state(), ManagerState::Stopped);
    assert_eq!(manager.stopped_servers(), 2);
    assert_eq!(manager.active_servers(), 0);
    assert_eq!(manager.handler().completed, 1);
}

#[test]
fn test_manager_closes_deferred_connection_from_outside_callbacks() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let mut manager = Manager::new(Watch::default());
    let id = manager
        .add_server(Server::new(tcp_config(), Polite::deferring_from(1)))
        .expect("add server");
    assert_eq!(manager.start(event_loop.reactor_mut()), 1);

    let addr = manager
        .server(id)
        .and_then(|s| s.local_addr())
        .expect("bound address");
    // Silent peer: nothing it does will end the connection.
    let _client = connect_and_poke(addr);
    pump_until(&mut event_loop, &mut manager, |m| {
        m.server(id).is_some_and(|s| s.active_connections() == 1)
    });

    assert_eq!(manager.graceful_stop(event_loop.reactor_mut()), StopProgress::Pending);
    let fd = manager.server(id).expect("managed server").connection_fds()[0];

    let wrong_type = manager.with_connection::<Echo, _>(event_loop.reactor_mut(), id, fd, |_| ());
    assert!(wrong_type.is_none());

    let state = manager.with_connection::<Polite, _>(event_loop.reactor_mut(), id, fd, |conn| {
        conn.write(b"last words");
        conn.state()
    });
    assert_eq!(state, Some(ConnectionState::PendingClose));
    assert_eq!(manager.handler().completed, 0);

    assert!(manager.close_connection(event_loop.reactor_mut(), id, fd));
    assert!(manager.is_stopped());
    assert_eq!(manager.stopped_servers(), 1);
    assert_eq!(manager.handler().completed, 1);
    assert!(!manager.close_connection(event_loop.reactor_mut(), id, fd));
}

#[test]
fn test_manager_reports_started_once() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let mut manager = Manager::new(Watch::default());
    manager
        .add_server(Server::new(tcp_config(), Echo::default()))
        .expect("add server");

    assert_eq!(manager.start(event_loop.reactor_mut()), 1);
    assert_eq!(manager.handler().started, 1);

    // Nothing left to start: no second callback.
    assert_eq!(manager.accept(event_loop.reactor_mut()), 0);
    assert_eq!(manager.handler().started, 1);
    assert_eq!(manager.state(), ManagerState::Accepting);
    assert_eq!(manager.active_servers(), 1);
}

#[test]
fn test_manager_completes_synchronously_when_nothing_accepts() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let mut holder = Server::new(tcp_config(), Echo::default());
    holder.start(event_loop.reactor_mut()).expect("start server");
    let taken = holder.local_addr().expect("bound address");

    let mut manager = Manager::new(Watch::default());
    manager
        .add_server(Server::new(ServerConfig::new(taken), Echo::default()))
        .expect("add server");

    assert_eq!(manager.start(event_loop.reactor_mut()), 0);
    assert_eq!(manager.handler().started, 0);
    assert_ne!(manager.state(), ManagerState::Accepting);

    assert_eq!(manager.graceful_stop(event_loop.reactor_mut()), StopProgress::Complete);
    assert_eq!(manager.handler().completed, 1);
    assert!(manager.is_stopped());
}

#[test]
fn test_manager_forceful_stop() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let mut manager = Manager::without_handler();
    let id = manager
        .add_server(Server::new(tcp_config(), Polite::deferring_from(1)))
        .expect("add server");
    assert_eq!(manager.start(event_loop.reactor_mut()), 1);

    let addr = manager
        .server(id)
        .and_then(|s| s.local_addr())
        .expect("bound address");
    let _client = connect_and_poke(addr);
    pump_until(&mut event_loop, &mut manager, |m| {
        m.server(id).is_some_and(|s| s.active_connections() == 1)
    });

    manager.stop(event_loop.reactor_mut());
    assert!(manager.is_stopped());
    let server = manager.server(id).expect("managed server");
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(server.active_connections(), 0);
}

// ============================================================================
// Connection Engine
// ============================================================================

/// A connection over one end of a socket pair; the other end is returned
/// as a blocking std stream.
fn socket_pair_connection(setup: ConnectionSetup<()>) -> (Connection<()>, StdUnixStream) {
    socket_pair_connection_with(&ServerConfig::default(), setup)
}

fn socket_pair_connection_with(
    config: &ServerConfig,
    setup: ConnectionSetup<()>,
) -> (Connection<()>, StdUnixStream) {
    let (ours, theirs) = StdUnixStream::pair().expect("socket pair");
    ours.set_nonblocking(true).expect("set_nonblocking failed");
    let stream = Stream::Unix(mio::net::UnixStream::from_std(ours));
    let fd: RawFd = stream.as_raw_fd();
    let info = ConnectionInfo {
        fd,
        peer: PeerAddr::Unix(None),
        server: ServerId(0),
    };
    let conn = Connection::new(info, stream, Token(fd as usize), setup, config);
    (conn, theirs)
}

#[derive(Default)]
struct Recorder {
    reads: Vec<usize>,
}

impl ConnectionHandler for Recorder {
    type Session = ();

    fn on_read(&mut self, conn: &mut Connection<()>, n: usize) {
        self.reads.push(n);
        conn.read_buffer_mut().clear();
    }
}

#[test]
fn test_backlog_keeps_order_and_drain_is_idempotent() {
    const LEN: usize = 4 * 1024 * 1024;
    let (mut conn, mut peer) = socket_pair_connection(ConnectionSetup::new(()));
    let payload = pattern(LEN);

    conn.write(&payload);
    let backlog = conn.pending_write_bytes();
    assert!(backlog > 0, "socket pair took {LEN} bytes at once");

    // Appended behind the backlog even though write-now is on.
    conn.write(b"tail");
    assert_eq!(conn.pending_write_bytes(), backlog + 4);

    let reader = thread::spawn(move || {
        let mut buf = vec![0u8; LEN + 4];
        peer.read_exact(&mut buf).expect("read failed");
        buf
    });

    let deadline = Instant::now() + TEST_TIMEOUT;
    while conn.pending_write_bytes() > 0 {
        assert!(Instant::now() < deadline, "queue did not drain");
        conn.handle_writable();
        thread::sleep(Duration::from_millis(1));
    }
    assert!(!conn.is_closing());

    // Draining an empty queue is a no-op.
    conn.handle_writable();
    assert!(!conn.is_closing());

    let received = reader.join().expect("thread panicked");
    assert!(received[..LEN] == payload[..], "payload reordered");
    assert_eq!(&received[LEN..], b"tail");
}

#[test]
fn test_writes_after_close_are_discarded() {
    let (mut conn, mut peer) = socket_pair_connection(ConnectionSetup::new(()));
    conn.close();
    conn.write(b"dropped");
    conn.write_bytes(Bytes::from_static(b"also dropped"));
    assert_eq!(conn.pending_write_bytes(), 0);
    assert!(matches!(conn.take_close_request(), Some(None)));

    peer.set_nonblocking(true).expect("set_nonblocking failed");
    let mut buf = [0u8; 16];
    let err = peer.read(&mut buf).expect_err("nothing was sent");
    assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
}

#[test]
fn test_first_close_reason_wins() {
    let (mut conn, _peer) = socket_pair_connection(ConnectionSetup::new(()));
    conn.close_with(ConnectionError::WriteTimeout);
    conn.close();
    conn.close_with(ConnectionError::BufferFull);
    assert!(matches!(
        conn.take_close_request(),
        Some(Some(ConnectionError::WriteTimeout))
    ));
}

#[test]
fn test_read_path_reports_bytes_then_eof() {
    let (mut conn, mut peer) = socket_pair_connection(ConnectionSetup::new(()));
    let mut handler = Recorder::default();

    peer.write_all(b"abc").expect("write failed");
    conn.handle_readable(&mut handler);
    assert_eq!(handler.reads, vec![3]);
    assert!(!conn.is_closing());

    // Nothing pending: the event is absorbed.
    conn.handle_readable(&mut handler);
    assert_eq!(handler.reads, vec![3]);

    drop(peer);
    conn.handle_readable(&mut handler);
    assert_eq!(handler.reads, vec![3, 0]);
    assert!(matches!(conn.take_close_request(), Some(None)));
}

#[test]
fn test_zero_capacity_buffer_closes_without_reading() {
    let setup = ConnectionSetup::new(()).with_read_buffer(ReadBuffer::from_vec(Vec::new()));
    let (mut conn, mut peer) = socket_pair_connection(setup);
    let mut handler = Recorder::default();

    peer.write_all(b"abc").expect("write failed");
    conn.handle_readable(&mut handler);
    assert!(handler.reads.is_empty());
    assert!(matches!(
        conn.take_close_request(),
        Some(Some(ConnectionError::BufferFull))
    ));
}

#[test]
fn test_idle_timers_follow_the_queue() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let reactor = event_loop.reactor_mut();
    let (mut conn, _peer) = socket_pair_connection(ConnectionSetup::new(()).with_write_now(false));

    conn.start(reactor).expect("start connection");
    assert_eq!(conn.state(), ConnectionState::Active);
    // Read timeout is disabled by default; no timers yet.
    assert_eq!(reactor.pending_timers(), 0);

    conn.write(b"queued");
    conn.sync(reactor).expect("sync connection");
    assert_eq!(reactor.pending_timers(), 1, "write timer armed with the watcher");

    conn.handle_writable();
    assert_eq!(conn.pending_write_bytes(), 0);
    conn.sync(reactor).expect("sync connection");
    assert_eq!(reactor.pending_timers(), 0, "write timer disarmed after drain");

    conn.stop(reactor);
    assert_eq!(conn.state(), ConnectionState::Stopped);
}

#[test]
fn test_stale_timer_is_ignored() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let reactor = event_loop.reactor_mut();
    let (mut conn, _peer) = socket_pair_connection(ConnectionSetup::new(()));

    let stray = reactor.schedule(Token(0), TimerKind::WriteIdle, Duration::ZERO);
    conn.handle_timeout(TimerKind::WriteIdle, stray);
    assert!(!conn.is_closing());
}

#[test]
fn test_delivered_data_stops_read_timer() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let reactor = event_loop.reactor_mut();
    let config = ServerConfig::default().with_read_timeout(Duration::from_secs(30));
    let (mut conn, mut peer) = socket_pair_connection_with(&config, ConnectionSetup::new(()));
    let mut handler = Recorder::default();

    conn.start(reactor).expect("start connection");
    assert!(conn.armed_timer(TimerKind::ReadIdle).is_some());
    assert_eq!(reactor.pending_timers(), 1);

    // The handler does not restart the timer, so data cancels it.
    peer.write_all(b"abc").expect("write failed");
    conn.handle_readable(&mut handler);
    conn.sync(reactor).expect("sync connection");
    assert_eq!(handler.reads, vec![3]);
    assert!(conn.armed_timer(TimerKind::ReadIdle).is_none());
    assert_eq!(reactor.pending_timers(), 0);
}

#[test]
fn test_readiness_without_data_rearms_read_timer() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let reactor = event_loop.reactor_mut();
    let config = ServerConfig::default().with_read_timeout(Duration::from_secs(30));
    let (mut conn, _peer) = socket_pair_connection_with(&config, ConnectionSetup::new(()));
    let mut handler = Recorder::default();

    conn.start(reactor).expect("start connection");
    let first = conn
        .armed_timer(TimerKind::ReadIdle)
        .expect("read timer armed at start");

    thread::sleep(Duration::from_millis(5));
    conn.handle_readable(&mut handler);
    conn.sync(reactor).expect("sync connection");

    assert!(handler.reads.is_empty());
    let second = conn
        .armed_timer(TimerKind::ReadIdle)
        .expect("read timer re-armed");
    assert!(second.deadline() > first.deadline());
    assert_eq!(reactor.pending_timers(), 1);
}
