//! Server and connection error types.

use std::io;

use thiserror::Error;

use crate::addr::ListenAddr;
use crate::server::ServerState;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors reported synchronously by server and manager operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The listen address could not be parsed.
    #[error("invalid listen address `{0}`")]
    InvalidAddress(String),

    /// Unix-domain socket path does not fit in `sockaddr_un`.
    #[error("unix socket path is {len} bytes, maximum is {max}")]
    UnixPathTooLong { len: usize, max: usize },

    /// Bind failed.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: ListenAddr,
        source: io::Error,
    },

    /// Listen failed.
    #[error("failed to listen on {addr}: {source}")]
    ListenFailed {
        addr: ListenAddr,
        source: io::Error,
    },

    /// Lifecycle operation issued from the wrong state.
    #[error("cannot {op} while server is {state:?}")]
    InvalidState {
        op: &'static str,
        state: ServerState,
    },

    /// Servers can only be added to an idle manager.
    #[error("servers can only be added while the manager is idle")]
    ManagerStarted,

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Why a connection was torn down.
///
/// Handed to [`ConnectionHandler::on_connection_destroy`](crate::ConnectionHandler::on_connection_destroy).
/// Orderly closes (peer EOF, explicit close, server stop) carry no error.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The read buffer filled up and the read callback did not drain it.
    #[error("read buffer exhausted")]
    BufferFull,

    /// No data arrived within the read idle timeout.
    #[error("read idle timeout")]
    ReadTimeout,

    /// The write queue did not drain within the write idle timeout.
    #[error("write idle timeout")]
    WriteTimeout,

    /// Socket I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    /// Returns the OS error code that best describes this error.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::BufferFull => Some(libc::ENOBUFS),
            Self::ReadTimeout | Self::WriteTimeout => Some(libc::ETIMEDOUT),
            Self::Io(e) => e.raw_os_error(),
        }
    }

    /// Returns true if the error came from an idle timer.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ReadTimeout | Self::WriteTimeout)
    }

    /// Short label used for logging and metrics.
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Self::BufferFull => "buffer_full",
            Self::ReadTimeout => "read_timeout",
            Self::WriteTimeout => "write_timeout",
            Self::Io(_) => "io",
        }
    }
}
