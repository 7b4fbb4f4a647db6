//! Connection state machine and its buffered I/O engine.
//!
//! A [`Connection`] owns one accepted socket, its read buffer and its queue of
//! pending writes. Handler callbacks receive `&mut Connection` and may write,
//! shut the socket down or ask for a close; none of these touch the reactor
//! directly. Interest changes, timer changes and closes are recorded on the
//! connection and applied by the owning server as soon as the callback
//! returns.
//!
//! ```text
//! Created ──start──► Active ──┬──► Shutdown ─────┐
//!                             ├──► PendingClose ─┼──► Closing ──► Stopped ──► dropped
//!                             └──────────────────┘
//! ```

use std::fmt;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::RawFd;
use std::time::Duration;

use bytes::Bytes;
use mio::{Interest, Token};
use tracing::{error, trace, warn};

use crate::addr::PeerAddr;
use crate::buffer::{ReadBuffer, WriteQueue};
use crate::config::ServerConfig;
use crate::error::ConnectionError;
use crate::handler::ConnectionHandler;
use crate::metrics;
use crate::reactor::{Reactor, ServerId, TimerHandle, TimerKind};
use crate::socket::{MAX_IOVECS, Stream};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Accepted, watchers not armed yet.
    Created,
    /// Watchers armed, normal operation.
    Active,
    /// A socket shutdown was issued.
    Shutdown,
    /// Teardown in progress.
    Closing,
    /// The handler deferred its close during a graceful stop.
    PendingClose,
    /// All watchers disarmed; the socket is still open until drop.
    Stopped,
}

/// Identity of a freshly accepted socket, handed to
/// [`ConnectionHandler::on_connection_create`].
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Socket descriptor.
    pub fd: RawFd,
    /// Remote address.
    pub peer: PeerAddr,
    /// Server that accepted the socket.
    pub server: ServerId,
}

/// Per-connection choices made by the handler at accept time.
#[derive(Debug)]
pub struct ConnectionSetup<S> {
    /// Handler-owned state carried by the connection.
    pub session: S,
    /// Read buffer to use instead of the server default.
    pub read_buffer: Option<ReadBuffer>,
    /// Overrides the server's write-now policy.
    pub write_now: Option<bool>,
}

impl<S> ConnectionSetup<S> {
    /// Uses `session` with the server's default buffer and write policy.
    pub fn new(session: S) -> Self {
        Self {
            session,
            read_buffer: None,
            write_now: None,
        }
    }

    /// Supplies the read buffer.
    pub fn with_read_buffer(mut self, buffer: ReadBuffer) -> Self {
        self.read_buffer = Some(buffer);
        self
    }

    /// Overrides the write-now policy.
    pub fn with_write_now(mut self, write_now: bool) -> Self {
        self.write_now = Some(write_now);
        self
    }
}

impl<S: Default> Default for ConnectionSetup<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

/// Pending change to an idle timer, applied when the connection settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerIntent {
    Keep,
    Restart,
    Stop,
}

#[derive(Debug, Clone, Copy, Default)]
struct Timeouts {
    read: Option<Duration>,
    write: Option<Duration>,
}

/// One armed-or-not idle timer.
#[derive(Debug)]
struct TimerSlot {
    kind: TimerKind,
    handle: Option<TimerHandle>,
    intent: TimerIntent,
}

impl TimerSlot {
    fn new(kind: TimerKind) -> Self {
        Self {
            kind,
            handle: None,
            intent: TimerIntent::Keep,
        }
    }

    fn apply(&mut self, reactor: &mut Reactor, token: Token, timeout: Option<Duration>) {
        match std::mem::replace(&mut self.intent, TimerIntent::Keep) {
            TimerIntent::Keep => {}
            TimerIntent::Stop => self.cancel(reactor),
            TimerIntent::Restart => {
                self.cancel(reactor);
                if let Some(after) = timeout {
                    self.handle = Some(reactor.schedule(token, self.kind, after));
                }
            }
        }
    }

    fn cancel(&mut self, reactor: &mut Reactor) {
        if let Some(handle) = self.handle.take() {
            reactor.cancel(handle);
        }
    }
}

/// One accepted socket and its buffers.
///
/// `S` is the handler's per-connection session type.
pub struct Connection<S> {
    fd: RawFd,
    token: Token,
    server: ServerId,
    peer: PeerAddr,
    stream: Stream,
    state: ConnectionState,

    read_buf: ReadBuffer,
    write_queue: WriteQueue,
    write_now: bool,

    timeouts: Timeouts,
    registered: Option<Interest>,
    read_timer: TimerSlot,
    write_timer: TimerSlot,

    /// Set once a close was requested; holds the reason.
    close_request: Option<Option<ConnectionError>>,

    session: S,
}

impl<S> Connection<S> {
    pub(crate) fn new(
        info: ConnectionInfo,
        stream: Stream,
        token: Token,
        setup: ConnectionSetup<S>,
        config: &ServerConfig,
    ) -> Self {
        let read_buf = setup
            .read_buffer
            .unwrap_or_else(|| ReadBuffer::with_capacity(config.read_buffer_size));

        Self {
            fd: info.fd,
            token,
            server: info.server,
            peer: info.peer,
            stream,
            state: ConnectionState::Created,
            read_buf,
            write_queue: WriteQueue::new(),
            write_now: setup.write_now.unwrap_or(config.write_now),
            timeouts: Timeouts {
                read: config.read_timeout,
                write: config.write_timeout,
            },
            registered: None,
            read_timer: TimerSlot::new(TimerKind::ReadIdle),
            write_timer: TimerSlot::new(TimerKind::WriteIdle),
            close_request: None,
            session: setup.session,
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Socket descriptor, also the key in the server's connection table.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Remote address.
    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    /// Owning server.
    pub fn server_id(&self) -> ServerId {
        self.server
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns true once a close has been requested.
    pub fn is_closing(&self) -> bool {
        self.close_request.is_some()
    }

    /// Bytes waiting in the write queue.
    pub fn pending_write_bytes(&self) -> usize {
        self.write_queue.queued_bytes()
    }

    /// Whether writes try an immediate send first.
    pub fn write_now(&self) -> bool {
        self.write_now
    }

    /// Switches between immediate sends and always queueing.
    pub fn set_write_now(&mut self, write_now: bool) {
        self.write_now = write_now;
    }

    /// Received data.
    pub fn read_buffer(&self) -> &ReadBuffer {
        &self.read_buf
    }

    /// Received data, for consuming what the handler has processed.
    pub fn read_buffer_mut(&mut self) -> &mut ReadBuffer {
        &mut self.read_buf
    }

    /// Handler-owned state.
    pub fn session(&self) -> &S {
        &self.session
    }

    /// Handler-owned state.
    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    /// Takes the read buffer back, e.g. from `on_connection_destroy` to
    /// return embedder-supplied storage to a pool.
    pub fn into_read_buffer(self) -> ReadBuffer {
        self.read_buf
    }

    /// Consumes the connection, returning its session.
    pub fn into_session(self) -> S {
        self.session
    }

    // ------------------------------------------------------------------------
    // Operations available to handlers
    // ------------------------------------------------------------------------

    /// Sends `data`, queueing whatever the socket does not take right away.
    ///
    /// Bytes are copied only if they have to be queued. Once anything is
    /// queued, later writes are appended behind it so the peer sees them in
    /// call order.
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() || self.is_closing() {
            return;
        }
        if !self.write_queue.is_empty() {
            self.append(Bytes::copy_from_slice(data));
            return;
        }

        let sent = if self.write_now {
            match self.send_now(data) {
                Some(sent) => sent,
                None => return,
            }
        } else {
            0
        };
        if sent < data.len() {
            self.enqueue(Bytes::copy_from_slice(&data[sent..]));
        }
    }

    /// Like [`write`](Self::write) for owned bytes; queueing never copies.
    pub fn write_bytes(&mut self, data: Bytes) {
        if data.is_empty() || self.is_closing() {
            return;
        }
        if !self.write_queue.is_empty() {
            self.append(data);
            return;
        }

        let sent = if self.write_now {
            match self.send_now(&data) {
                Some(sent) => sent,
                None => return,
            }
        } else {
            0
        };
        if sent < data.len() {
            self.enqueue(data.slice(sent..));
        }
    }

    /// Issues a half or full socket shutdown.
    ///
    /// The connection stays in the table until the peer hangs up or a close
    /// is requested.
    pub fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        self.state = ConnectionState::Shutdown;
        self.stream.shutdown(how)
    }

    /// Requests an orderly close.
    pub fn close(&mut self) {
        self.request_close(None);
    }

    /// Requests a close reporting `error` to `on_connection_destroy`.
    pub fn close_with(&mut self, error: ConnectionError) {
        self.request_close(Some(error));
    }

    /// Re-arms the read idle timer, if one is configured.
    pub fn restart_read_timer(&mut self) {
        self.read_timer.intent = TimerIntent::Restart;
    }

    /// Disarms the read idle timer.
    pub fn stop_read_timer(&mut self) {
        self.read_timer.intent = TimerIntent::Stop;
    }

    #[cfg(test)]
    pub(crate) fn armed_timer(&self, kind: TimerKind) -> Option<TimerHandle> {
        match kind {
            TimerKind::ReadIdle => self.read_timer.handle,
            TimerKind::WriteIdle => self.write_timer.handle,
        }
    }

    // ------------------------------------------------------------------------
    // Server-side lifecycle
    // ------------------------------------------------------------------------

    /// Arms the read watcher and the read idle timer.
    pub(crate) fn start(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        reactor.register(&mut self.stream, self.token, Interest::READABLE)?;
        self.registered = Some(Interest::READABLE);
        self.state = ConnectionState::Active;
        self.read_timer.intent = TimerIntent::Restart;
        self.read_timer
            .apply(reactor, self.token, self.timeouts.read);
        Ok(())
    }

    /// Applies interest and timer changes recorded since the last sync.
    ///
    /// The write watcher and write timer are only armed while the queue holds
    /// data.
    pub(crate) fn sync(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        let wanted = if self.write_queue.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        if self.registered != Some(wanted) {
            reactor.reregister(&mut self.stream, self.token, wanted)?;
            self.registered = Some(wanted);
        }

        if self.write_queue.is_empty() {
            self.write_timer.intent = TimerIntent::Stop;
        }
        self.read_timer
            .apply(reactor, self.token, self.timeouts.read);
        self.write_timer
            .apply(reactor, self.token, self.timeouts.write);
        Ok(())
    }

    /// Disarms every watcher and timer.
    pub(crate) fn stop(&mut self, reactor: &mut Reactor) {
        if self.registered.take().is_some() {
            if let Err(e) = reactor.deregister(&mut self.stream) {
                trace!(fd = self.fd, error = %e, "deregister failed");
            }
        }
        self.read_timer.intent = TimerIntent::Keep;
        self.write_timer.intent = TimerIntent::Keep;
        self.read_timer.cancel(reactor);
        self.write_timer.cancel(reactor);
        self.state = ConnectionState::Stopped;
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    /// Takes the close reason, if a close was requested.
    pub(crate) fn take_close_request(&mut self) -> Option<Option<ConnectionError>> {
        self.close_request.take()
    }

    fn request_close(&mut self, error: Option<ConnectionError>) {
        if self.close_request.is_none() {
            self.close_request = Some(error);
        }
    }

    /// Shuts the socket down and requests a close with `error`.
    fn abort(&mut self, error: ConnectionError) {
        if let Err(e) = self.shutdown(Shutdown::Both) {
            trace!(fd = self.fd, error = %e, "shutdown failed");
        }
        self.request_close(Some(error));
    }

    // ------------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------------

    /// Receives until the socket would block, calling `on_read` for every
    /// successful receive.
    pub(crate) fn handle_readable<H>(&mut self, handler: &mut H)
    where
        H: ConnectionHandler<Session = S>,
    {
        let mut delivered = false;

        loop {
            if self.is_closing() {
                return;
            }
            if self.read_buf.is_full() {
                warn!(
                    server = %self.server,
                    fd = self.fd,
                    capacity = self.read_buf.capacity(),
                    "read buffer full, closing connection"
                );
                self.abort(ConnectionError::BufferFull);
                return;
            }

            match self.stream.read(self.read_buf.spare_mut()) {
                Ok(0) => {
                    trace!(fd = self.fd, "peer closed connection");
                    handler.on_read(self, 0);
                    if let Err(e) = self.shutdown(Shutdown::Both) {
                        trace!(fd = self.fd, error = %e, "shutdown failed");
                    }
                    self.request_close(None);
                    return;
                }
                Ok(n) => {
                    trace!(fd = self.fd, bytes = n, "received");
                    self.read_buf.advance(n);
                    metrics::record_bytes_received(self.server, n);
                    delivered = true;
                    self.read_timer.intent = TimerIntent::Stop;
                    handler.on_read(self, n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(server = %self.server, fd = self.fd, error = %e, "read failed");
                    self.request_close(Some(e.into()));
                    return;
                }
            }
        }

        if !delivered {
            self.read_timer.intent = TimerIntent::Restart;
        }
    }

    // ------------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------------

    /// Tries to send `data` directly. Returns the number of bytes the socket
    /// took, or `None` if the send failed and a close was requested.
    fn send_now(&mut self, data: &[u8]) -> Option<usize> {
        loop {
            match self.stream.write(data) {
                Ok(0) => {
                    self.request_close(Some(write_zero()));
                    return None;
                }
                Ok(n) => {
                    metrics::record_bytes_sent(self.server, n);
                    if n < data.len() {
                        trace!(fd = self.fd, sent = n, len = data.len(), "partial write");
                    }
                    return Some(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Some(0),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(server = %self.server, fd = self.fd, error = %e, "write failed");
                    self.request_close(Some(e.into()));
                    return None;
                }
            }
        }
    }

    /// Queues the first chunk of a backlog: arms the write watcher and the
    /// write timer.
    fn enqueue(&mut self, chunk: Bytes) {
        self.write_timer.intent = TimerIntent::Restart;
        self.append(chunk);
    }

    fn append(&mut self, chunk: Bytes) {
        trace!(fd = self.fd, bytes = chunk.len(), queued = self.write_queue.len(), "write queued");
        metrics::record_write_queued(self.server);
        self.write_queue.push(chunk);
    }

    /// Drains the write queue with gather writes until it is empty or the
    /// socket would block.
    ///
    /// Calling this with an empty queue does nothing.
    pub(crate) fn handle_writable(&mut self) {
        if self.is_closing() || self.write_queue.is_empty() {
            return;
        }
        self.write_timer.intent = TimerIntent::Stop;

        loop {
            let result = {
                let slices = self.write_queue.io_slices(MAX_IOVECS);
                self.stream.write_vectored(&slices)
            };

            match result {
                Ok(0) => {
                    self.request_close(Some(write_zero()));
                    return;
                }
                Ok(n) => {
                    metrics::record_bytes_sent(self.server, n);
                    let consumed = self.write_queue.consume(n);
                    trace!(
                        fd = self.fd,
                        sent = n,
                        chunks = consumed.chunks,
                        partial = consumed.partial,
                        remaining = self.write_queue.queued_bytes(),
                        "drained"
                    );
                    if self.write_queue.is_empty() {
                        return;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.write_timer.intent = TimerIntent::Restart;
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::InvalidInput => {
                    error!(
                        server = %self.server,
                        fd = self.fd,
                        chunks = self.write_queue.len(),
                        error = %e,
                        "gather write rejected its arguments, write queue is corrupt"
                    );
                    std::process::abort();
                }
                Err(e) => {
                    error!(server = %self.server, fd = self.fd, error = %e, "write failed");
                    self.request_close(Some(e.into()));
                    return;
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    /// Handles an expired idle timer. Stale handles are ignored.
    pub(crate) fn handle_timeout(&mut self, kind: TimerKind, handle: TimerHandle) {
        let slot = match kind {
            TimerKind::ReadIdle => &mut self.read_timer,
            TimerKind::WriteIdle => &mut self.write_timer,
        };
        if slot.handle != Some(handle) {
            trace!(fd = self.fd, ?kind, "stale timer");
            return;
        }
        slot.handle = None;

        let error = match kind {
            TimerKind::ReadIdle => ConnectionError::ReadTimeout,
            TimerKind::WriteIdle => ConnectionError::WriteTimeout,
        };
        warn!(server = %self.server, fd = self.fd, peer = %self.peer, %error, "idle timeout");
        self.abort(error);
    }
}

fn write_zero() -> ConnectionError {
    ConnectionError::Io(io::Error::new(
        io::ErrorKind::WriteZero,
        "failed to write to socket",
    ))
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd)
            .field("server", &self.server)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("buffered", &self.read_buf.used())
            .field("queued", &self.write_queue.queued_bytes())
            .field("closing", &self.is_closing())
            .finish_non_exhaustive()
    }
}
