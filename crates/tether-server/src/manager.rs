//! Several servers sharing one event loop.
//!
//! A [`Manager`] owns independently configured servers, fans lifecycle calls
//! out to them in insertion order and reports a single graceful-stop
//! completion once every server has stopped.

use std::any::Any;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use mio::Token;
use tracing::{debug, error, info, trace};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::{ServerError, ServerResult};
use crate::handler::ConnectionHandler;
use crate::reactor::{Dispatch, Reactor, Readiness, ServerId, TimerHandle, TimerKind, split_token};
use crate::server::{Server, ServerState, StopProgress};

/// Lifecycle state of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerState {
    /// No lifecycle call made yet; servers may be added.
    Idle,
    /// Bind fanned out.
    Bound,
    /// Listen fanned out.
    Listening,
    /// At least one server is accepting.
    Accepting,
    /// Waiting for servers to finish their graceful stops.
    GracefullyStopping,
    /// Every server stopped.
    Stopped,
}

/// Snapshot handed to manager callbacks.
#[derive(Debug, Clone, Copy)]
pub struct ManagerContext {
    /// State at the time of the callback.
    pub state: ManagerState,
    /// Number of servers owned.
    pub servers: usize,
    /// Servers that entered accept mode and have not stopped.
    pub active_servers: usize,
    /// Servers that stopped.
    pub stopped_servers: usize,
}

/// Manager-level callbacks.
pub trait ManagerHandler {
    /// At least one server started accepting.
    fn on_started(&mut self, _manager: &ManagerContext) {}

    /// Every server finished stopping. Called exactly once per stop.
    fn on_graceful_stop_complete(&mut self, _manager: &ManagerContext) {}
}

impl ManagerHandler for () {}

/// Type-erased server, so one manager can hold servers with different
/// handlers.
pub trait Service: Dispatch {
    /// Server id.
    fn id(&self) -> ServerId;
    /// Current state.
    fn state(&self) -> ServerState;
    /// Configuration.
    fn config(&self) -> &ServerConfig;
    /// Bound TCP address.
    fn local_addr(&self) -> Option<SocketAddr>;
    /// Number of live connections.
    fn active_connections(&self) -> usize;
    /// See [`Server::connection_fds`].
    fn connection_fds(&self) -> Vec<RawFd>;
    /// See [`Server::bind`].
    fn bind(&mut self) -> ServerResult<()>;
    /// See [`Server::listen`].
    fn listen(&mut self) -> ServerResult<()>;
    /// See [`Server::accept`].
    fn accept(&mut self, reactor: &mut Reactor) -> ServerResult<()>;
    /// See [`Server::stop`].
    fn stop(&mut self, reactor: &mut Reactor);
    /// See [`Server::graceful_stop`].
    fn graceful_stop(&mut self, reactor: &mut Reactor) -> StopProgress;
    /// See [`Server::close_connection`].
    fn close_connection(&mut self, reactor: &mut Reactor, fd: RawFd) -> bool;
    /// The concrete server, for typed access through [`Manager::with_connection`].
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<H: ConnectionHandler + 'static> Service for Server<H> {
    fn id(&self) -> ServerId {
        Server::id(self)
    }

    fn state(&self) -> ServerState {
        Server::state(self)
    }

    fn config(&self) -> &ServerConfig {
        Server::config(self)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Server::local_addr(self)
    }

    fn active_connections(&self) -> usize {
        Server::active_connections(self)
    }

    fn connection_fds(&self) -> Vec<RawFd> {
        Server::connection_fds(self)
    }

    fn bind(&mut self) -> ServerResult<()> {
        Server::bind(self)
    }

    fn listen(&mut self) -> ServerResult<()> {
        Server::listen(self)
    }

    fn accept(&mut self, reactor: &mut Reactor) -> ServerResult<()> {
        Server::accept(self, reactor)
    }

    fn stop(&mut self, reactor: &mut Reactor) {
        Server::stop(self, reactor);
    }

    fn graceful_stop(&mut self, reactor: &mut Reactor) -> StopProgress {
        Server::graceful_stop(self, reactor)
    }

    fn close_connection(&mut self, reactor: &mut Reactor, fd: RawFd) -> bool {
        Server::close_connection(self, reactor, fd)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Stop bookkeeping for one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Idle,
    Accepting,
    Awaiting,
    Stopped,
}

/// Owns a set of servers driven by one event loop.
pub struct Manager<M: ManagerHandler = ()> {
    servers: Vec<Box<dyn Service>>,
    slots: Vec<Slot>,
    state: ManagerState,
    active: usize,
    stopped: usize,
    handler: M,
}

impl Manager<()> {
    /// Creates a manager without callbacks.
    pub fn without_handler() -> Self {
        Self::new(())
    }
}

impl<M: ManagerHandler> Manager<M> {
    /// Creates an empty manager.
    pub fn new(handler: M) -> Self {
        Self {
            servers: Vec::new(),
            slots: Vec::new(),
            state: ManagerState::Idle,
            active: 0,
            stopped: 0,
            handler,
        }
    }

    /// Adds a server. Ids are assigned from 1 in insertion order.
    pub fn add_server<H>(&mut self, mut server: Server<H>) -> ServerResult<ServerId>
    where
        H: ConnectionHandler + 'static,
    {
        if self.state != ManagerState::Idle {
            return Err(ServerError::ManagerStarted);
        }
        if server.state() != ServerState::Idle {
            return Err(ServerError::InvalidState {
                op: "add to manager",
                state: server.state(),
            });
        }

        let id = ServerId(self.servers.len() as u32 + 1);
        server.set_id(id);
        debug!(server = %id, addr = %server.config().addr, "server added");
        self.servers.push(Box::new(server));
        self.slots.push(Slot::Idle);
        Ok(id)
    }

    /// Current state.
    pub fn state(&self) -> ManagerState {
        self.state
    }

    /// Number of servers that entered accept mode and have not stopped.
    pub fn active_servers(&self) -> usize {
        self.active
    }

    /// Number of servers that stopped.
    pub fn stopped_servers(&self) -> usize {
        self.stopped
    }

    /// Looks up a server by id.
    pub fn server(&self, id: ServerId) -> Option<&dyn Service> {
        let index = self.position(id)?;
        Some(self.servers[index].as_ref())
    }

    /// All servers in insertion order.
    pub fn servers(&self) -> impl Iterator<Item = &dyn Service> {
        self.servers.iter().map(|s| s.as_ref())
    }

    /// The manager handler.
    pub fn handler(&self) -> &M {
        &self.handler
    }

    /// The manager handler.
    pub fn handler_mut(&mut self) -> &mut M {
        &mut self.handler
    }

    /// Runs `f` on a live connection of server `id`, then applies whatever
    /// it changed and picks up a graceful stop that this completed.
    ///
    /// `H` is the handler type the server was added with; any other type
    /// yields `None`. This is how a connection that deferred its close
    /// during a graceful stop gets closed from outside its callbacks.
    pub fn with_connection<H, R>(
        &mut self,
        reactor: &mut Reactor,
        id: ServerId,
        fd: RawFd,
        f: impl FnOnce(&mut Connection<H::Session>) -> R,
    ) -> Option<R>
    where
        H: ConnectionHandler + 'static,
    {
        let index = self.position(id)?;
        let server = self.servers[index].as_any_mut().downcast_mut::<Server<H>>()?;
        let result = server.with_connection(reactor, fd, f);
        self.observe(index);
        result
    }

    /// Closes a connection of server `id` without reporting an error.
    pub fn close_connection(&mut self, reactor: &mut Reactor, id: ServerId, fd: RawFd) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };
        let closed = self.servers[index].close_connection(reactor, fd);
        self.observe(index);
        closed
    }

    fn context(&self) -> ManagerContext {
        ManagerContext {
            state: self.state,
            servers: self.servers.len(),
            active_servers: self.active,
            stopped_servers: self.stopped,
        }
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Binds every idle server. Failures are logged; returns how many bound.
    pub fn bind(&mut self) -> usize {
        let mut bound = 0;
        for server in &mut self.servers {
            if server.state() != ServerState::Idle {
                continue;
            }
            match server.bind() {
                Ok(()) => bound += 1,
                Err(e) => error!(server = %server.id(), addr = %server.config().addr, error = %e, "bind failed"),
            }
        }
        self.state = ManagerState::Bound;
        bound
    }

    /// Starts listening on every bound server. Returns how many listen.
    pub fn listen(&mut self) -> usize {
        let mut listening = 0;
        for server in &mut self.servers {
            if server.state() != ServerState::Bound {
                continue;
            }
            match server.listen() {
                Ok(()) => listening += 1,
                Err(e) => error!(server = %server.id(), addr = %server.config().addr, error = %e, "listen failed"),
            }
        }
        self.state = ManagerState::Listening;
        listening
    }

    /// Starts accepting on every listening server and reports `on_started`
    /// if this call started any. Returns how many started accepting.
    pub fn accept(&mut self, reactor: &mut Reactor) -> usize {
        let mut accepting = 0;
        for (server, slot) in self.servers.iter_mut().zip(&mut self.slots) {
            if server.state() != ServerState::Listening {
                continue;
            }
            match server.accept(reactor) {
                Ok(()) => {
                    *slot = Slot::Accepting;
                    accepting += 1;
                }
                Err(e) => error!(server = %server.id(), error = %e, "accept failed"),
            }
        }

        if accepting == 0 {
            return 0;
        }
        self.active += accepting;
        self.state = ManagerState::Accepting;
        info!(servers = self.servers.len(), accepting = self.active, "manager started");
        let ctx = self.context();
        self.handler.on_started(&ctx);
        accepting
    }

    /// Binds, listens and accepts. Returns how many servers accept.
    pub fn start(&mut self, reactor: &mut Reactor) -> usize {
        self.bind();
        self.listen();
        self.accept(reactor)
    }

    // ========================================================================
    // Stop
    // ========================================================================

    fn mark_stopped(&mut self, index: usize) {
        let previous = std::mem::replace(&mut self.slots[index], Slot::Stopped);
        if previous == Slot::Stopped {
            return;
        }
        if matches!(previous, Slot::Accepting | Slot::Awaiting) {
            self.active = self.active.saturating_sub(1);
        }
        self.stopped += 1;
        debug!(
            server = %self.servers[index].id(),
            stopped = self.stopped,
            total = self.servers.len(),
            "server stopped"
        );
    }

    fn check_complete(&mut self) {
        if self.state != ManagerState::GracefullyStopping || self.stopped != self.servers.len() {
            return;
        }
        self.state = ManagerState::Stopped;
        info!(servers = self.servers.len(), "manager graceful stop complete");
        let ctx = self.context();
        self.handler.on_graceful_stop_complete(&ctx);
    }

    /// Stops every server immediately. No completion callback fires.
    pub fn stop(&mut self, reactor: &mut Reactor) {
        for index in 0..self.servers.len() {
            if self.slots[index] != Slot::Stopped {
                self.servers[index].stop(reactor);
                self.mark_stopped(index);
            }
        }
        self.state = ManagerState::Stopped;
        info!(servers = self.servers.len(), "manager stopped");
    }

    /// Stops every server gracefully.
    ///
    /// Accepting servers run their graceful protocol; the rest are stopped
    /// immediately. `on_graceful_stop_complete` fires once every server has
    /// stopped, possibly before this returns.
    pub fn graceful_stop(&mut self, reactor: &mut Reactor) -> StopProgress {
        match self.state {
            ManagerState::Stopped => return StopProgress::Complete,
            ManagerState::GracefullyStopping => return StopProgress::Pending,
            _ => {}
        }
        self.state = ManagerState::GracefullyStopping;
        info!(servers = self.servers.len(), "manager graceful stop started");

        for index in 0..self.servers.len() {
            match self.slots[index] {
                Slot::Stopped | Slot::Awaiting => continue,
                Slot::Accepting if self.servers[index].state() == ServerState::Accepting => {
                    match self.servers[index].graceful_stop(reactor) {
                        StopProgress::Complete => self.mark_stopped(index),
                        StopProgress::Pending => self.slots[index] = Slot::Awaiting,
                    }
                }
                _ => {
                    self.servers[index].stop(reactor);
                    self.mark_stopped(index);
                }
            }
        }

        self.check_complete();
        if self.state == ManagerState::Stopped {
            StopProgress::Complete
        } else {
            StopProgress::Pending
        }
    }

    /// Picks up a server that finished its graceful stop during an event.
    fn observe(&mut self, index: usize) {
        if self.slots[index] == Slot::Awaiting && self.servers[index].is_stopped() {
            self.mark_stopped(index);
            self.check_complete();
        }
    }

    fn position(&self, id: ServerId) -> Option<usize> {
        let index = (id.0 as usize).checked_sub(1)?;
        (index < self.servers.len()).then_some(index)
    }

    fn index_of(&self, token: Token) -> Option<usize> {
        self.position(split_token(token).0)
    }
}

impl<M: ManagerHandler> Dispatch for Manager<M> {
    fn on_ready(&mut self, reactor: &mut Reactor, token: Token, readiness: Readiness) {
        let Some(index) = self.index_of(token) else {
            trace!(?token, "event for unknown server");
            return;
        };
        self.servers[index].on_ready(reactor, token, readiness);
        self.observe(index);
    }

    fn on_timer(&mut self, reactor: &mut Reactor, token: Token, kind: TimerKind, handle: TimerHandle) {
        let Some(index) = self.index_of(token) else {
            return;
        };
        self.servers[index].on_timer(reactor, token, kind, handle);
        self.observe(index);
    }

    fn on_shutdown_requested(&mut self, reactor: &mut Reactor) {
        match self.state {
            ManagerState::GracefullyStopping | ManagerState::Stopped => {}
            _ => {
                self.graceful_stop(reactor);
            }
        }
    }

    fn is_stopped(&self) -> bool {
        self.state == ManagerState::Stopped
    }
}

impl<M: ManagerHandler> std::fmt::Debug for Manager<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("state", &self.state)
            .field("servers", &self.servers.len())
            .field("active", &self.active)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}
