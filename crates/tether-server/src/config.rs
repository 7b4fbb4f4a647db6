//! Server configuration.

use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

use crate::addr::ListenAddr;
use crate::buffer::DEFAULT_READ_BUFFER_SIZE;
use crate::error::{ServerError, ServerResult};

/// Default write idle timeout.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Server configuration, frozen once the server is bound.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind to.
    pub addr: ListenAddr,
    /// Pending-connection queue depth passed to `listen(2)`.
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Close connections that stay silent this long. `None` disables.
    #[serde(default, deserialize_with = "timeout_secs")]
    pub read_timeout: Option<Duration>,
    /// Close connections whose queued writes do not drain this long.
    /// `None` disables.
    #[serde(default = "default_write_timeout", deserialize_with = "timeout_secs")]
    pub write_timeout: Option<Duration>,
    /// Try to send immediately on write instead of always queueing.
    #[serde(default = "default_write_now")]
    pub write_now: bool,
    /// Read buffer size for connections created with the default setup.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

fn default_backlog() -> i32 {
    libc::SOMAXCONN
}

fn default_write_timeout() -> Option<Duration> {
    Some(DEFAULT_WRITE_TIMEOUT)
}

fn default_write_now() -> bool {
    true
}

fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}

/// Maps a zero duration to "disabled".
fn non_zero(timeout: Duration) -> Option<Duration> {
    (!timeout.is_zero()).then_some(timeout)
}

/// Timeouts are written as fractional seconds; zero or negative disables.
/// Values a `Duration` cannot hold are rejected.
fn timeout_secs<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    if secs <= 0.0 {
        return Ok(None);
    }
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .map_err(|e| D::Error::custom(format!("invalid timeout {secs}: {e}")))
}

impl ServerConfig {
    /// Creates a configuration with default settings for `addr`.
    pub fn new(addr: impl Into<ListenAddr>) -> Self {
        Self {
            addr: addr.into(),
            backlog: default_backlog(),
            read_timeout: None,
            write_timeout: default_write_timeout(),
            write_now: default_write_now(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    /// Parses `host`/`port` (see [`ListenAddr::new`]) into a configuration.
    pub fn from_host_port(host: &str, port: &str) -> ServerResult<Self> {
        Ok(Self::new(ListenAddr::new(host, port)?))
    }

    /// Sets the listen backlog.
    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Sets the read idle timeout. A zero duration disables it.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = non_zero(timeout);
        self
    }

    /// Disables the read idle timeout.
    pub fn without_read_timeout(mut self) -> Self {
        self.read_timeout = None;
        self
    }

    /// Sets the write idle timeout. A zero duration disables it.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = non_zero(timeout);
        self
    }

    /// Disables the write idle timeout.
    pub fn without_write_timeout(mut self) -> Self {
        self.write_timeout = None;
        self
    }

    /// Chooses between sending immediately and always queueing.
    pub fn with_write_now(mut self, write_now: bool) -> Self {
        self.write_now = write_now;
        self
    }

    /// Sets the default per-connection read buffer size.
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Checks values that would make every connection fail.
    pub fn validate(&self) -> ServerResult<()> {
        if self.read_buffer_size == 0 {
            return Err(ServerError::Config(
                "read_buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.backlog <= 0 {
            return Err(ServerError::Config(format!(
                "backlog must be positive, got {}",
                self.backlog
            )));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(ListenAddr::Tcp(
            std::net::SocketAddr::from(([127, 0, 0, 1], 9090)),
        ))
    }
}

/// Configuration for a set of servers sharing one event loop.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerConfig {
    /// One entry per server, in the order they are started.
    #[serde(default, rename = "server")]
    pub servers: Vec<ServerConfig>,
}

impl ManagerConfig {
    /// Validates every server entry.
    pub fn validate(&self) -> ServerResult<()> {
        self.servers.iter().try_for_each(ServerConfig::validate)
    }
}
