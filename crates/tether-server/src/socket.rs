//! Socket creation, options and the stream/listener wrappers.
//!
//! Listening sockets are built with `socket2` so that bind and listen stay
//! separate steps and every option can be applied before bind. Option
//! failures are logged and ignored; only bind and listen themselves fail.

use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::time::Duration;

use mio::event::Source;
use mio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use tracing::{debug, warn};

use crate::addr::{ListenAddr, PeerAddr};
use crate::error::{ServerError, ServerResult};

/// Maximum number of chunks offered to a single gather write.
pub const MAX_IOVECS: usize = 1024;

// ============================================================================
// Listening Socket
// ============================================================================

/// Creates a non-blocking stream socket for `addr`, applies the server
/// options and binds it.
pub(crate) fn bind_socket(addr: &ListenAddr) -> ServerResult<Socket> {
    let (domain, protocol, sockaddr) = match addr {
        ListenAddr::Tcp(sa) => (Domain::for_address(*sa), Some(Protocol::TCP), SockAddr::from(*sa)),
        ListenAddr::Unix(path) => {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "removed stale unix socket"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "could not remove stale unix socket"),
            }
            let sockaddr = SockAddr::unix(path).map_err(|source| ServerError::BindFailed {
                addr: addr.clone(),
                source,
            })?;
            (Domain::UNIX, None, sockaddr)
        }
    };

    let socket = Socket::new(domain, Type::STREAM, protocol)?;
    socket.set_nonblocking(true)?;

    if let Err(e) = socket.set_reuse_address(true) {
        warn!(%addr, error = %e, "failed to set SO_REUSEADDR");
    }
    if !addr.is_unix() {
        if let Err(e) = socket.set_nodelay(true) {
            warn!(%addr, error = %e, "failed to set TCP_NODELAY");
        }
        set_defer_accept(&socket, addr);
    }
    set_abortive_linger(&socket, addr);

    socket
        .bind(&sockaddr)
        .map_err(|source| ServerError::BindFailed {
            addr: addr.clone(),
            source,
        })?;

    Ok(socket)
}

#[cfg(target_os = "linux")]
fn set_defer_accept(socket: &Socket, addr: &ListenAddr) {
    let seconds: libc::c_int = 1;
    // SAFETY: the descriptor is a live socket owned by `socket`, and the
    // option value points to a c_int whose size is passed alongside it.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_DEFER_ACCEPT,
            (&seconds as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        warn!(%addr, error = %io::Error::last_os_error(), "failed to set TCP_DEFER_ACCEPT");
    }
}

#[cfg(not(target_os = "linux"))]
fn set_defer_accept(_socket: &Socket, _addr: &ListenAddr) {}

fn set_abortive_linger(socket: &Socket, addr: &ListenAddr) {
    if let Err(e) = socket.set_linger(Some(Duration::ZERO)) {
        warn!(%addr, error = %e, "failed to set SO_LINGER");
    }
}

// ============================================================================
// Listener
// ============================================================================

/// A listening socket registered with the reactor.
#[derive(Debug)]
pub(crate) enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Puts a bound socket into listening mode.
    pub(crate) fn listen(socket: Socket, addr: &ListenAddr, backlog: i32) -> ServerResult<Self> {
        socket
            .listen(backlog)
            .map_err(|source| ServerError::ListenFailed {
                addr: addr.clone(),
                source,
            })?;

        Ok(match addr {
            ListenAddr::Tcp(_) => Self::Tcp(TcpListener::from_std(socket.into())),
            ListenAddr::Unix(_) => Self::Unix(UnixListener::from_std(socket.into())),
        })
    }

    /// Accepts one pending connection.
    pub(crate) fn accept(&self) -> io::Result<(Stream, PeerAddr)> {
        let (stream, peer) = match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept()?;
                (Stream::Tcp(stream), PeerAddr::Tcp(peer))
            }
            Self::Unix(listener) => {
                let (stream, peer) = listener.accept()?;
                let path = peer.as_pathname().map(|p| p.to_path_buf());
                (Stream::Unix(stream), PeerAddr::Unix(path))
            }
        };

        if let Err(e) = SockRef::from(&stream).set_linger(Some(Duration::ZERO)) {
            warn!(fd = stream.as_raw_fd(), error = %e, "failed to set SO_LINGER");
        }
        Ok((stream, peer))
    }

    /// Local TCP address, if this is a TCP listener.
    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(listener) => listener.local_addr().ok(),
            Self::Unix(_) => None,
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(l) => l.as_raw_fd(),
            Self::Unix(l) => l.as_raw_fd(),
        }
    }
}

impl Source for Listener {
    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            Self::Tcp(l) => l.register(registry, token, interest),
            Self::Unix(l) => l.register(registry, token, interest),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            Self::Tcp(l) => l.reregister(registry, token, interest),
            Self::Unix(l) => l.reregister(registry, token, interest),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Self::Tcp(l) => l.deregister(registry),
            Self::Unix(l) => l.deregister(registry),
        }
    }
}

// ============================================================================
// Stream
// ============================================================================

/// An accepted, non-blocking connection socket.
#[derive(Debug)]
pub(crate) enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    /// Issues a half or full socket shutdown.
    pub(crate) fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.shutdown(how),
            Self::Unix(s) => s.shutdown(how),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write_vectored(bufs),
            Self::Unix(s) => s.write_vectored(bufs),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(s) => s.as_raw_fd(),
            Self::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl AsFd for Stream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Tcp(s) => s.as_fd(),
            Self::Unix(s) => s.as_fd(),
        }
    }
}

impl Source for Stream {
    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.register(registry, token, interest),
            Self::Unix(s) => s.register(registry, token, interest),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.reregister(registry, token, interest),
            Self::Unix(s) => s.reregister(registry, token, interest),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.deregister(registry),
            Self::Unix(s) => s.deregister(registry),
        }
    }
}
