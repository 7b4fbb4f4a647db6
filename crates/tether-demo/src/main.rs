//! `tether-demo`: example servers built on `tether-server`.
//!
//! Provides an echo server, a line-oriented greeter that finishes its
//! conversations during a graceful stop, and a multi-server manager loaded
//! from a TOML file.

use std::io::BufRead;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tether_server::{
    Connection, ConnectionError, ConnectionHandler, ConnectionInfo, ConnectionSetup, EventLoop,
    Manager, ManagerConfig, ManagerContext, ManagerHandler, ReadBuffer, Server, ServerConfig,
    ServerContext, ServerState, ShutdownHandle,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Demo servers built on tether-server.
#[derive(Parser)]
#[command(name = "tether-demo")]
#[command(about = "Demo servers built on tether-server", long_about = None)]
struct Cli {
    /// Begin a graceful stop after this many seconds.
    #[arg(long, global = true)]
    stop_after: Option<f64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Echo every byte back to its sender.
    Echo(ListenArgs),

    /// Greet each client and answer line by line.
    Greet {
        #[command(flatten)]
        listen: ListenArgs,

        /// First line sent to every client.
        #[arg(short, long, default_value = "hello")]
        greeting: String,

        /// Seconds clients get to finish after a graceful stop begins.
        #[arg(long, default_value = "5")]
        grace: f64,
    },

    /// Run several echo servers from a TOML file.
    Multi {
        /// Path to a file with one `[[server]]` table per server.
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Args)]
struct ListenArgs {
    /// Host address, or `unix/` for a unix-domain socket.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port, or socket path when host is `unix/`.
    #[arg(short, long, default_value = "9090")]
    port: String,

    /// Read idle timeout in seconds (0 disables).
    #[arg(long, default_value = "0")]
    read_timeout: f64,

    /// Write idle timeout in seconds (0 disables).
    #[arg(long, default_value = "1")]
    write_timeout: f64,

    /// Always queue writes instead of sending immediately.
    #[arg(long)]
    queue_writes: bool,
}

impl ListenArgs {
    fn to_config(&self) -> Result<ServerConfig> {
        let config = ServerConfig::from_host_port(&self.host, &self.port)
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))?
            .with_read_timeout(seconds(self.read_timeout)?)
            .with_write_timeout(seconds(self.write_timeout)?)
            .with_write_now(!self.queue_writes);
        Ok(config)
    }
}

/// Zero or negative means "disabled".
fn seconds(secs: f64) -> Result<Duration> {
    if secs <= 0.0 {
        return Ok(Duration::ZERO);
    }
    Duration::try_from_secs_f64(secs)
        .with_context(|| format!("{secs} is not a usable number of seconds"))
}

// ============================================================================
// Echo
// ============================================================================

struct Echo;

impl ConnectionHandler for Echo {
    type Session = ();

    fn on_started(&mut self, server: &ServerContext) {
        info!(server = %server.id, addr = %server.addr, "echo server started");
    }

    fn on_read(&mut self, conn: &mut Connection<()>, n: usize) {
        if n == 0 {
            return;
        }
        let data = conn.read_buffer().filled().to_vec();
        conn.read_buffer_mut().clear();
        conn.write(&data);
    }

    fn on_connection_destroy(&mut self, conn: Connection<()>, error: Option<ConnectionError>) {
        if let Some(error) = error {
            warn!(fd = conn.fd(), peer = %conn.peer(), %error, "connection failed");
        }
    }

    fn on_graceful_stop_complete(&mut self, server: &ServerContext) {
        info!(server = %server.id, "echo server stopped");
    }
}

// ============================================================================
// Greeter
// ============================================================================

#[derive(Default)]
struct Conversation {
    lines: usize,
    leaving: bool,
}

struct Greeter {
    greeting: String,
}

impl Greeter {
    fn answer(conn: &mut Connection<Conversation>, line: &str) {
        if line.eq_ignore_ascii_case("quit") {
            conn.write(b"bye\n");
            conn.close();
            return;
        }

        let session = conn.session_mut();
        session.lines += 1;
        let reply = format!("{}: {line}\n", session.lines);
        let leaving = session.leaving;

        conn.write(reply.as_bytes());
        if leaving {
            conn.write(b"server stopped, bye\n");
            conn.close();
        }
    }
}

impl ConnectionHandler for Greeter {
    type Session = Conversation;

    fn on_connection_create(
        &mut self,
        _server: &ServerContext,
        info: &ConnectionInfo,
    ) -> ConnectionSetup<Conversation> {
        info!(fd = info.fd, peer = %info.peer, "new conversation");
        ConnectionSetup::default().with_read_buffer(ReadBuffer::with_capacity(1024))
    }

    fn on_connection_ready(&mut self, conn: &mut Connection<Conversation>) {
        let greeting = format!("{}, {}\n", self.greeting, conn.peer());
        conn.write(greeting.as_bytes());
    }

    fn on_read(&mut self, conn: &mut Connection<Conversation>, n: usize) {
        if n == 0 {
            return;
        }

        let filled = conn.read_buffer().filled();
        let mut lines = Vec::new();
        let mut consumed = 0;
        while let Some(pos) = filled[consumed..].iter().position(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(&filled[consumed..consumed + pos]);
            lines.push(line.trim().to_string());
            consumed += pos + 1;
        }
        conn.read_buffer_mut().consume(consumed);

        for line in lines {
            if conn.is_closing() {
                break;
            }
            Self::answer(conn, &line);
        }
    }

    fn on_graceful_close(&mut self, conn: &mut Connection<Conversation>) -> bool {
        conn.write(b"server is stopping, send your last line\n");
        conn.session_mut().leaving = true;
        false
    }

    fn on_connection_destroy(
        &mut self,
        conn: Connection<Conversation>,
        error: Option<ConnectionError>,
    ) {
        let lines = conn.session().lines;
        match error {
            Some(error) => warn!(fd = conn.fd(), lines, %error, "conversation failed"),
            None => info!(fd = conn.fd(), lines, "conversation finished"),
        }
    }

    fn on_graceful_stop_complete(&mut self, server: &ServerContext) {
        info!(server = %server.id, "greeter stopped");
    }
}

/// Runs the greeter until it stops, closing conversations still open `grace`
/// after a graceful stop began.
fn run_greeter(
    event_loop: &mut EventLoop,
    server: &mut Server<Greeter>,
    grace: Duration,
) -> Result<()> {
    const TICK: Duration = Duration::from_millis(100);
    let mut grace_ends = None;

    while server.state() != ServerState::Stopped {
        event_loop.turn(server, Some(TICK))?;
        if server.state() != ServerState::GracefullyStopping {
            continue;
        }

        let Some(ends) = *grace_ends.get_or_insert_with(|| Instant::now().checked_add(grace)) else {
            continue;
        };
        if Instant::now() < ends {
            continue;
        }
        for fd in server.connection_fds() {
            warn!(fd, "grace period over, closing conversation");
            server.with_connection(event_loop.reactor_mut(), fd, |conn| {
                conn.write(b"out of time, bye\n");
                conn.close();
            });
        }
    }
    Ok(())
}

// ============================================================================
// Manager
// ============================================================================

struct Report;

impl ManagerHandler for Report {
    fn on_started(&mut self, manager: &ManagerContext) {
        info!(
            servers = manager.servers,
            accepting = manager.active_servers,
            "manager started"
        );
    }

    fn on_graceful_stop_complete(&mut self, manager: &ManagerContext) {
        info!(servers = manager.stopped_servers, "all servers stopped");
    }
}

fn load_manager_config(path: &PathBuf) -> Result<ManagerConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: ManagerConfig =
        toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))?;
    config.validate()?;
    if config.servers.is_empty() {
        anyhow::bail!("{} defines no [[server]] tables", path.display());
    }
    Ok(config)
}

// ============================================================================
// Stop Triggers
// ============================================================================

/// Requests a graceful stop after a delay and whenever `stop` is typed.
fn spawn_stop_triggers(handle: &ShutdownHandle, stop_after: Option<Duration>) {
    if let Some(delay) = stop_after {
        let handle = handle.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            info!(?delay, "stop timer elapsed");
            if let Err(e) = handle.request() {
                warn!(error = %e, "failed to request stop");
            }
        });
    }

    let handle = handle.clone();
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                return;
            };
            if line.trim().eq_ignore_ascii_case("stop") {
                info!("stop requested from stdin");
                if let Err(e) = handle.request() {
                    warn!(error = %e, "failed to request stop");
                }
            }
        }
    });
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tether_demo=info,tether_server=info")),
        )
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let stop_after = cli.stop_after.map(seconds).transpose()?;
    let mut event_loop = EventLoop::new().context("failed to create event loop")?;
    spawn_stop_triggers(&event_loop.shutdown_handle(), stop_after);

    match cli.command {
        Commands::Echo(listen) => {
            let mut server = Server::new(listen.to_config()?, Echo);
            server.start(event_loop.reactor_mut())?;
            event_loop.run(&mut server)?;
        }

        Commands::Greet {
            listen,
            greeting,
            grace,
        } => {
            let grace = seconds(grace)?;
            let mut server = Server::new(listen.to_config()?, Greeter { greeting });
            server.start(event_loop.reactor_mut())?;
            run_greeter(&mut event_loop, &mut server, grace)?;
        }

        Commands::Multi { config } => {
            let config = load_manager_config(&config)?;
            let mut manager = Manager::new(Report);
            for server in config.servers {
                manager.add_server(Server::new(server, Echo))?;
            }
            if manager.start(event_loop.reactor_mut()) == 0 {
                anyhow::bail!("no server could be started");
            }
            event_loop.run(&mut manager)?;
        }
    }

    info!("demo finished");
    Ok(())
}
