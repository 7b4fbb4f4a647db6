//! # tether-server: embeddable event-driven TCP server
//!
//! This crate multiplexes many connections on a single thread and hands their
//! bytes to an application through the [`ConnectionHandler`] callbacks. It is
//! byte-transparent: framing is left to the handler.
//!
//! ## Architecture
//!
//! The loop uses `mio` for non-blocking I/O with explicit control flow and no
//! async runtime.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                           EventLoop                             │
//! │  ┌───────────┐   ┌───────────┐   ┌─────────────┐   ┌─────────┐ │
//! │  │  Manager  │ → │  Server   │ → │ Connection  │ → │ Handler │ │
//! │  │ (N srvs)  │   │ (listen)  │   │ (buffers)   │   │ (app)   │ │
//! │  └───────────┘   └───────────┘   └─────────────┘   └─────────┘ │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Writes are sent immediately when possible; whatever the kernel does not
//! take is queued and drained with gather writes as the socket becomes
//! writable. Graceful shutdown lets each connection decide whether to close
//! now or later, and reports completion exactly once.
//!
//! ## Usage
//!
//! ```no_run
//! use tether_server::{Connection, ConnectionHandler, EventLoop, Server, ServerConfig};
//!
//! struct Echo;
//!
//! impl ConnectionHandler for Echo {
//!     type Session = ();
//!
//!     fn on_read(&mut self, conn: &mut Connection<()>, n: usize) {
//!         if n > 0 {
//!             let data = conn.read_buffer().filled().to_vec();
//!             conn.read_buffer_mut().clear();
//!             conn.write(&data);
//!         }
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut event_loop = EventLoop::new()?;
//! let config: ServerConfig = ServerConfig::from_host_port("127.0.0.1", "9090")?;
//! let mut server = Server::new(config, Echo);
//! server.start(event_loop.reactor_mut())?;
//! event_loop.run(&mut server)?;
//! # Ok(())
//! # }
//! ```

mod addr;
mod buffer;
mod config;
mod connection;
mod error;
mod handler;
mod manager;
pub mod metrics;
mod reactor;
mod server;
mod socket;
#[cfg(test)]
mod tests;

pub use addr::{ListenAddr, MAX_UNIX_PATH_LEN, PeerAddr, UNIX_PREFIX};
pub use buffer::{Consumed, DEFAULT_READ_BUFFER_SIZE, ReadBuffer, WriteQueue};
pub use config::{DEFAULT_WRITE_TIMEOUT, ManagerConfig, ServerConfig};
pub use connection::{Connection, ConnectionInfo, ConnectionSetup, ConnectionState};
pub use error::{ConnectionError, ServerError, ServerResult};
pub use handler::{ConnectionHandler, ServerContext};
pub use manager::{Manager, ManagerContext, ManagerHandler, ManagerState, Service};
pub use reactor::{
    Dispatch, EventLoop, MAX_TIMER_DELAY, Reactor, Readiness, ServerId, ShutdownHandle,
    TimerHandle, TimerKind,
};
pub use server::{Server, ServerState, StopProgress};
pub use socket::MAX_IOVECS;
