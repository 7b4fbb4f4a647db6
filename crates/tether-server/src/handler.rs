//! Callbacks an embedding application implements.

use std::net::SocketAddr;

use crate::addr::ListenAddr;
use crate::connection::{Connection, ConnectionInfo, ConnectionSetup};
use crate::error::ConnectionError;
use crate::reactor::ServerId;
use crate::server::ServerState;

/// Snapshot of a server handed to server-level callbacks.
#[derive(Debug, Clone)]
pub struct ServerContext {
    /// Server id within its event loop.
    pub id: ServerId,
    /// Configured listen address.
    pub addr: ListenAddr,
    /// Bound TCP address, if any (resolves port 0).
    pub local_addr: Option<SocketAddr>,
    /// State at the time of the callback.
    pub state: ServerState,
    /// Connections in the table at the time of the callback.
    pub active_connections: usize,
}

/// Connection lifecycle callbacks.
///
/// Only [`on_read`](Self::on_read) is required. Callbacks run on the event
/// loop thread and must not block. A connection passed as `&mut` can be
/// written to, shut down or closed; a close takes effect as soon as the
/// callback returns.
///
/// # Example
///
/// ```no_run
/// use tether_server::{Connection, ConnectionHandler};
///
/// struct Echo;
///
/// impl ConnectionHandler for Echo {
///     type Session = ();
///
///     fn on_read(&mut self, conn: &mut Connection<()>, n: usize) {
///         if n == 0 {
///             return;
///         }
///         let data = conn.read_buffer().filled().to_vec();
///         conn.read_buffer_mut().clear();
///         conn.write(&data);
///     }
/// }
/// ```
pub trait ConnectionHandler {
    /// Per-connection state.
    type Session: Default;

    /// The server started accepting.
    fn on_started(&mut self, _server: &ServerContext) {}

    /// A socket was accepted. Returns the connection's session and buffer
    /// choices; the default uses `Session::default()` and the server's
    /// buffer size.
    fn on_connection_create(
        &mut self,
        _server: &ServerContext,
        _info: &ConnectionInfo,
    ) -> ConnectionSetup<Self::Session> {
        ConnectionSetup::default()
    }

    /// The connection's watchers are armed.
    fn on_connection_ready(&mut self, _conn: &mut Connection<Self::Session>) {}

    /// `n` bytes were appended to the read buffer; `n == 0` means the peer
    /// shut down its side, and the connection closes after this returns.
    ///
    /// If the buffer is still full when this returns, the connection is
    /// closed with [`ConnectionError::BufferFull`].
    fn on_read(&mut self, conn: &mut Connection<Self::Session>, n: usize);

    /// The server is stopping gracefully.
    ///
    /// Return `true` if the connection was closed (the default closes it).
    /// Return `false` to keep it open; the server then waits until the
    /// connection closes on its own before completing the stop.
    fn on_graceful_close(&mut self, conn: &mut Connection<Self::Session>) -> bool {
        conn.close();
        true
    }

    /// The connection was removed from the server. `error` is `None` for an
    /// orderly close.
    ///
    /// The socket closes when `conn` is dropped.
    fn on_connection_destroy(
        &mut self,
        _conn: Connection<Self::Session>,
        _error: Option<ConnectionError>,
    ) {
    }

    /// A graceful stop finished. Called exactly once per stop.
    fn on_graceful_stop_complete(&mut self, _server: &ServerContext) {}
}
