//! Listening server: accept loop, connection table and stop protocols.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};

use mio::{Interest, Token};
use tracing::{debug, error, info, trace, warn};

use crate::addr::PeerAddr;
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionInfo, ConnectionState};
use crate::error::{ServerError, ServerResult};
use crate::handler::{ConnectionHandler, ServerContext};
use crate::metrics;
use crate::reactor::{Dispatch, Reactor, Readiness, ServerId, TimerHandle, TimerKind, split_token, token_for};
use crate::socket::{Listener, Stream, bind_socket};

/// Lifecycle state of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    /// Created, nothing bound.
    Idle,
    /// Socket bound.
    Bound,
    /// `listen(2)` issued.
    Listening,
    /// Accept watcher armed.
    Accepting,
    /// Listener closed, waiting for connections to finish.
    GracefullyStopping,
    /// Listener closed and every connection gone.
    Stopped,
}

/// Outcome of starting a graceful stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopProgress {
    /// The stop finished before the call returned.
    Complete,
    /// Some connections deferred their close; completion is reported through
    /// `on_graceful_stop_complete`.
    Pending,
}

/// A single listening server.
///
/// The server never owns the event loop: lifecycle operations that arm or
/// disarm watchers take the [`Reactor`] explicitly, and the loop reaches the
/// server through its [`Dispatch`] implementation.
pub struct Server<H: ConnectionHandler> {
    id: ServerId,
    config: ServerConfig,
    state: ServerState,
    socket: Option<socket2::Socket>,
    listener: Option<Listener>,
    listener_token: Option<Token>,
    connections: HashMap<RawFd, Connection<H::Session>>,
    handler: H,
}

impl<H: ConnectionHandler> Server<H> {
    /// Creates an idle server.
    pub fn new(config: ServerConfig, handler: H) -> Self {
        Self {
            id: ServerId::default(),
            config,
            state: ServerState::Idle,
            socket: None,
            listener: None,
            listener_token: None,
            connections: HashMap::new(),
            handler,
        }
    }

    /// Server id used in tokens and metrics.
    pub fn id(&self) -> ServerId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: ServerId) {
        self.id = id;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Configuration the server was created with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Number of connections in the table.
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// The connection handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// The connection handler.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Bound TCP address. Useful after binding to port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        if let Some(listener) = &self.listener {
            return listener.local_addr();
        }
        self.socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .and_then(|a| a.as_socket())
    }

    /// Looks up a live connection.
    pub fn connection(&self, fd: RawFd) -> Option<&Connection<H::Session>> {
        self.connections.get(&fd)
    }

    /// Descriptors of all live connections, in ascending order.
    pub fn connection_fds(&self) -> Vec<RawFd> {
        let mut fds: Vec<RawFd> = self.connections.keys().copied().collect();
        fds.sort_unstable();
        fds
    }

    /// Runs `f` on a live connection, then applies whatever it changed.
    ///
    /// This is how connections are written to or closed from outside their
    /// own callbacks.
    pub fn with_connection<R>(
        &mut self,
        reactor: &mut Reactor,
        fd: RawFd,
        f: impl FnOnce(&mut Connection<H::Session>) -> R,
    ) -> Option<R> {
        let conn = self.connections.get_mut(&fd)?;
        let result = f(conn);
        self.settle(reactor, fd);
        Some(result)
    }

    /// Closes a connection without reporting an error.
    pub fn close_connection(&mut self, reactor: &mut Reactor, fd: RawFd) -> bool {
        self.with_connection(reactor, fd, Connection::close).is_some()
    }

    pub(crate) fn context(&self) -> ServerContext {
        ServerContext {
            id: self.id,
            addr: self.config.addr.clone(),
            local_addr: self.local_addr(),
            state: self.state,
            active_connections: self.connections.len(),
        }
    }

    fn expect_state(&self, op: &'static str, expected: ServerState) -> ServerResult<()> {
        if self.state != expected {
            return Err(ServerError::InvalidState {
                op,
                state: self.state,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Creates and binds the listening socket.
    ///
    /// On failure the server stays idle.
    pub fn bind(&mut self) -> ServerResult<()> {
        self.expect_state("bind", ServerState::Idle)?;
        self.config.validate()?;

        let socket = bind_socket(&self.config.addr)?;
        self.socket = Some(socket);
        self.state = ServerState::Bound;
        info!(server = %self.id, addr = %self.config.addr, "server bound");
        Ok(())
    }

    /// Starts listening with the configured backlog.
    ///
    /// On failure the bound socket is released and the server returns to
    /// idle.
    pub fn listen(&mut self) -> ServerResult<()> {
        self.expect_state("listen", ServerState::Bound)?;
        let Some(socket) = self.socket.take() else {
            self.state = ServerState::Idle;
            return Err(ServerError::InvalidState {
                op: "listen",
                state: ServerState::Idle,
            });
        };

        match Listener::listen(socket, &self.config.addr, self.config.backlog) {
            Ok(listener) => {
                self.listener = Some(listener);
                self.state = ServerState::Listening;
                info!(
                    server = %self.id,
                    addr = %self.config.addr,
                    backlog = self.config.backlog,
                    "server listening"
                );
                Ok(())
            }
            Err(e) => {
                self.state = ServerState::Idle;
                Err(e)
            }
        }
    }

    /// Arms the accept watcher and reports `on_started`.
    pub fn accept(&mut self, reactor: &mut Reactor) -> ServerResult<()> {
        self.expect_state("accept", ServerState::Listening)?;
        let Some(listener) = self.listener.as_mut() else {
            return Err(ServerError::InvalidState {
                op: "accept",
                state: self.state,
            });
        };

        let token = token_for(self.id, listener.as_raw_fd());
        reactor.register(listener, token, Interest::READABLE)?;
        self.listener_token = Some(token);
        self.state = ServerState::Accepting;
        info!(server = %self.id, addr = %self.config.addr, "server accepting");

        let ctx = self.context();
        self.handler.on_started(&ctx);
        Ok(())
    }

    /// Binds, listens and starts accepting.
    pub fn start(&mut self, reactor: &mut Reactor) -> ServerResult<()> {
        self.bind()?;
        self.listen()?;
        self.accept(reactor)
    }

    // ========================================================================
    // Accept Loop
    // ========================================================================

    fn accept_ready(&mut self, reactor: &mut Reactor) {
        while self.state == ServerState::Accepting {
            let Some(listener) = &self.listener else {
                return;
            };
            match listener.accept() {
                Ok((stream, peer)) => self.admit(reactor, stream, peer),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(server = %self.id, error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn admit(&mut self, reactor: &mut Reactor, stream: Stream, peer: PeerAddr) {
        let fd = stream.as_raw_fd();

        if let Some(stale) = self.connections.get_mut(&fd) {
            warn!(server = %self.id, fd, "descriptor reused, evicting stale connection");
            stale.close();
            self.finish_close(reactor, fd);
        }

        let info = ConnectionInfo {
            fd,
            peer,
            server: self.id,
        };
        let ctx = self.context();
        let setup = self.handler.on_connection_create(&ctx, &info);
        debug!(server = %self.id, fd, peer = %info.peer, "connection accepted");
        metrics::record_connection_accepted(self.id);

        let mut conn = Connection::new(info, stream, token_for(self.id, fd), setup, &self.config);
        let started = conn.start(reactor);
        self.connections.insert(fd, conn);

        if let Err(e) = started {
            error!(server = %self.id, fd, error = %e, "failed to arm connection");
            if let Some(conn) = self.connections.get_mut(&fd) {
                conn.close_with(e.into());
            }
            self.finish_close(reactor, fd);
            return;
        }

        if let Some(conn) = self.connections.get_mut(&fd) {
            self.handler.on_connection_ready(conn);
        }
        self.settle(reactor, fd);
    }

    // ========================================================================
    // Connection Events
    // ========================================================================

    fn connection_ready(&mut self, reactor: &mut Reactor, fd: RawFd, readiness: Readiness) {
        let Some(conn) = self.connections.get_mut(&fd) else {
            trace!(server = %self.id, fd, "event for unknown connection");
            return;
        };

        if readiness.readable {
            conn.handle_readable(&mut self.handler);
        }
        if readiness.writable {
            conn.handle_writable();
        }
        self.settle(reactor, fd);
    }

    /// Applies a connection's recorded changes, or tears it down if a close
    /// was requested.
    fn settle(&mut self, reactor: &mut Reactor, fd: RawFd) {
        let Some(conn) = self.connections.get_mut(&fd) else {
            return;
        };
        if !conn.is_closing() {
            match conn.sync(reactor) {
                Ok(()) => return,
                Err(e) => {
                    error!(server = %self.id, fd, error = %e, "failed to update watchers");
                    conn.close_with(e.into());
                }
            }
        }
        self.finish_close(reactor, fd);
    }

    /// Removes a connection from the table, disarms it and hands it to
    /// `on_connection_destroy`.
    fn finish_close(&mut self, reactor: &mut Reactor, fd: RawFd) {
        let Some(mut conn) = self.connections.remove(&fd) else {
            return;
        };
        let error = conn.take_close_request().flatten();
        let previous = conn.state();

        conn.set_state(ConnectionState::Closing);
        conn.stop(reactor);

        let reason = error.as_ref().map_or("closed", |e| e.label());
        metrics::record_connection_closed(self.id, reason);
        match &error {
            Some(e) => debug!(
                server = %self.id,
                fd,
                ?previous,
                unsent = conn.pending_write_bytes(),
                error = %e,
                "connection closed"
            ),
            None => debug!(
                server = %self.id,
                fd,
                ?previous,
                unsent = conn.pending_write_bytes(),
                "connection closed"
            ),
        }

        self.handler.on_connection_destroy(conn, error);
        self.maybe_finish_graceful();
    }

    fn maybe_finish_graceful(&mut self) {
        if self.state != ServerState::GracefullyStopping || !self.connections.is_empty() {
            return;
        }
        self.state = ServerState::Stopped;
        info!(server = %self.id, "graceful stop complete");
        let ctx = self.context();
        self.handler.on_graceful_stop_complete(&ctx);
    }

    // ========================================================================
    // Stop
    // ========================================================================

    fn close_listener(&mut self, reactor: &mut Reactor) {
        self.socket = None;
        if let Some(mut listener) = self.listener.take() {
            if self.listener_token.take().is_some() {
                if let Err(e) = reactor.deregister(&mut listener) {
                    trace!(server = %self.id, error = %e, "listener deregister failed");
                }
            }
        }
    }

    /// Closes the listener and every connection immediately.
    ///
    /// Graceful-close policies are not consulted and no completion callback
    /// fires.
    pub fn stop(&mut self, reactor: &mut Reactor) {
        if self.state == ServerState::Stopped {
            return;
        }
        self.close_listener(reactor);
        self.state = ServerState::Stopped;

        let fds = self.connection_fds();
        info!(server = %self.id, connections = fds.len(), "server stopping");
        for fd in fds {
            if let Some(conn) = self.connections.get_mut(&fd) {
                conn.close();
            }
            self.finish_close(reactor, fd);
        }
    }

    /// Closes the listener and asks every connection to close.
    ///
    /// Each connection goes through `on_graceful_close`; connections that
    /// defer are left open and the stop completes once the last one closes.
    /// `on_graceful_stop_complete` fires exactly once, possibly before this
    /// returns.
    pub fn graceful_stop(&mut self, reactor: &mut Reactor) -> StopProgress {
        match self.state {
            ServerState::Stopped => return StopProgress::Complete,
            ServerState::GracefullyStopping => return StopProgress::Pending,
            _ => {}
        }

        self.close_listener(reactor);
        self.state = ServerState::GracefullyStopping;
        info!(
            server = %self.id,
            connections = self.connections.len(),
            "graceful stop started"
        );

        if self.connections.is_empty() {
            self.maybe_finish_graceful();
            return StopProgress::Complete;
        }

        for fd in self.connection_fds() {
            if self.state != ServerState::GracefullyStopping {
                break;
            }
            let Some(conn) = self.connections.get_mut(&fd) else {
                continue;
            };
            if conn.is_closing() {
                self.finish_close(reactor, fd);
                continue;
            }

            let closed = self.handler.on_graceful_close(conn);
            if !closed && !conn.is_closing() {
                debug!(server = %self.id, fd, "connection deferred close");
                conn.set_state(ConnectionState::PendingClose);
            } else if closed && !conn.is_closing() {
                conn.close();
            }
            self.settle(reactor, fd);
        }

        if self.state == ServerState::Stopped {
            StopProgress::Complete
        } else {
            StopProgress::Pending
        }
    }
}

impl<H: ConnectionHandler> Dispatch for Server<H> {
    fn on_ready(&mut self, reactor: &mut Reactor, token: Token, readiness: Readiness) {
        if Some(token) == self.listener_token {
            self.accept_ready(reactor);
            return;
        }
        let (server, fd) = split_token(token);
        if server != self.id {
            trace!(server = %self.id, ?token, "event for another server");
            return;
        }
        self.connection_ready(reactor, fd, readiness);
    }

    fn on_timer(&mut self, reactor: &mut Reactor, token: Token, kind: TimerKind, handle: TimerHandle) {
        let (_, fd) = split_token(token);
        let Some(conn) = self.connections.get_mut(&fd) else {
            return;
        };
        conn.handle_timeout(kind, handle);
        self.settle(reactor, fd);
    }

    fn on_shutdown_requested(&mut self, reactor: &mut Reactor) {
        match self.state {
            ServerState::Accepting => {
                self.graceful_stop(reactor);
            }
            ServerState::GracefullyStopping | ServerState::Stopped => {}
            _ => self.stop(reactor),
        }
    }

    fn is_stopped(&self) -> bool {
        self.state == ServerState::Stopped
    }
}

impl<H: ConnectionHandler> std::fmt::Debug for Server<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("addr", &self.config.addr)
            .field("state", &self.state)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}
