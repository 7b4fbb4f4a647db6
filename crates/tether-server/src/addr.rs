//! Listen and peer addresses.
//!
//! A server listens either on an IP socket address or on a unix-domain socket
//! path. The textual form of a unix address carries a `unix/` prefix, so both
//! kinds fit in a single `host`/`port` pair or a single string:
//!
//! ```text
//! 127.0.0.1:9090          host = "127.0.0.1", port = "9090"
//! [::1]:9090              host = "::1",       port = "9090"
//! unix//tmp/echo.sock     host = "unix/",     port = "/tmp/echo.sock"
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{ServerError, ServerResult};

/// Prefix selecting a unix-domain socket.
pub const UNIX_PREFIX: &str = "unix/";

/// Longest unix socket path accepted (`sun_path` minus the terminator).
pub const MAX_UNIX_PATH_LEN: usize = 107;

/// Address a server binds to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum ListenAddr {
    /// TCP over IPv4 or IPv6.
    Tcp(SocketAddr),
    /// Unix-domain stream socket at a filesystem path.
    Unix(PathBuf),
}

impl ListenAddr {
    /// Builds an address from separate host and port strings.
    ///
    /// A host starting with `unix/` (any case) makes `port` the socket path.
    pub fn new(host: &str, port: &str) -> ServerResult<Self> {
        if has_unix_prefix(host) {
            return Self::unix(port);
        }

        let ip: IpAddr = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|_| ServerError::InvalidAddress(format!("{host}:{port}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ServerError::InvalidAddress(format!("{host}:{port}")))?;

        Ok(Self::Tcp(SocketAddr::new(ip, port)))
    }

    /// Builds a unix-domain address, rejecting paths that do not fit.
    pub fn unix(path: impl AsRef<Path>) -> ServerResult<Self> {
        let path = path.as_ref();
        let len = path.as_os_str().len();
        if len == 0 {
            return Err(ServerError::InvalidAddress(UNIX_PREFIX.to_string()));
        }
        if len > MAX_UNIX_PATH_LEN {
            return Err(ServerError::UnixPathTooLong {
                len,
                max: MAX_UNIX_PATH_LEN,
            });
        }
        Ok(Self::Unix(path.to_path_buf()))
    }

    /// Returns true for unix-domain addresses.
    pub fn is_unix(&self) -> bool {
        matches!(self, Self::Unix(_))
    }
}

fn has_unix_prefix(s: &str) -> bool {
    s.len() >= UNIX_PREFIX.len()
        && s.as_bytes()[..UNIX_PREFIX.len()].eq_ignore_ascii_case(UNIX_PREFIX.as_bytes())
}

impl FromStr for ListenAddr {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if has_unix_prefix(s) {
            return Self::unix(&s[UNIX_PREFIX.len()..]);
        }
        s.parse::<SocketAddr>()
            .map(Self::Tcp)
            .map_err(|_| ServerError::InvalidAddress(s.to_string()))
    }
}

impl TryFrom<String> for ListenAddr {
    type Error = ServerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SocketAddr> for ListenAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::Tcp(addr)
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "{UNIX_PREFIX}{}", path.display()),
        }
    }
}

/// Address of an accepted peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    /// Remote TCP endpoint.
    Tcp(SocketAddr),
    /// Unix-domain peer; clients rarely bind a path, so it is usually `None`.
    Unix(Option<PathBuf>),
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(Some(path)) => write!(f, "{UNIX_PREFIX}{}", path.display()),
            Self::Unix(None) => f.write_str("unix/(unnamed)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let addr = ListenAddr::new("127.0.0.1", "9090").unwrap();
        assert_eq!(addr, ListenAddr::Tcp("127.0.0.1:9090".parse().unwrap()));
        assert_eq!(addr.to_string(), "127.0.0.1:9090");
    }

    #[test]
    fn parses_bracketed_ipv6_host() {
        let addr = ListenAddr::new("[::1]", "80").unwrap();
        assert_eq!(addr, ListenAddr::Tcp("[::1]:80".parse().unwrap()));
    }

    #[test]
    fn unix_prefix_is_case_insensitive() {
        let addr = ListenAddr::new("UNIX/", "/tmp/a.sock").unwrap();
        assert_eq!(addr, ListenAddr::Unix(PathBuf::from("/tmp/a.sock")));

        let parsed: ListenAddr = "unix//tmp/a.sock".parse().unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(parsed.to_string(), "unix//tmp/a.sock");
    }

    #[test]
    fn rejects_long_unix_paths() {
        let path = format!("/tmp/{}", "x".repeat(MAX_UNIX_PATH_LEN));
        let err = ListenAddr::unix(&path).unwrap_err();
        assert!(matches!(err, ServerError::UnixPathTooLong { max: MAX_UNIX_PATH_LEN, .. }));

        let exact = "y".repeat(MAX_UNIX_PATH_LEN);
        assert!(ListenAddr::unix(&exact).is_ok());
    }

    #[test]
    fn rejects_hostnames_and_bad_ports() {
        assert!(matches!(
            ListenAddr::new("localhost", "80"),
            Err(ServerError::InvalidAddress(_))
        ));
        assert!(matches!(
            ListenAddr::new("127.0.0.1", "http"),
            Err(ServerError::InvalidAddress(_))
        ));
        assert!("127.0.0.1".parse::<ListenAddr>().is_err());
        assert!("unix/".parse::<ListenAddr>().is_err());
    }
}
