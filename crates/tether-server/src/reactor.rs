//! Event loop built on `mio`.
//!
//! The loop owns the `mio::Poll` and a set of one-shot timers, and drives a
//! single [`Dispatch`] target (a [`Server`](crate::Server) or a
//! [`Manager`](crate::Manager)) on the calling thread.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        EventLoop                          │
//! │  1. Poll with timeout = earliest timer deadline           │
//! │  2. Route readiness events to the target by token         │
//! │  3. Fire expired timers in deadline order                 │
//! │  4. Deliver shutdown requests from a ShutdownHandle       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Tokens pack the owning server id and the socket descriptor:
//! `(server_id << 32) | fd`. Descriptors are unique within the process, so
//! listeners and connections of many servers share one registry without
//! collisions.

use std::collections::BTreeMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, trace};

/// Maximum events to process per poll iteration.
const MAX_EVENTS: usize = 1024;

/// Token reserved for the shutdown waker.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Longest delay a timer can be scheduled for.
pub const MAX_TIMER_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

// ============================================================================
// Tokens
// ============================================================================

/// Identifies a server within one event loop.
///
/// Standalone servers use id 0; a [`Manager`](crate::Manager) numbers its
/// servers from 1 in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ServerId(pub u32);

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Builds the token for a descriptor owned by `server`.
pub(crate) fn token_for(server: ServerId, fd: RawFd) -> Token {
    Token(((server.0 as usize) << 32) | (fd as u32 as usize))
}

/// Splits a token back into server id and descriptor.
pub(crate) fn split_token(token: Token) -> (ServerId, RawFd) {
    let server = ServerId((token.0 >> 32) as u32);
    let fd = (token.0 & 0xFFFF_FFFF) as u32 as RawFd;
    (server, fd)
}

// ============================================================================
// Readiness and Timers
// ============================================================================

/// Readiness reported for one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    /// Data, EOF or a pending socket error can be read.
    pub readable: bool,
    /// The send buffer has room.
    pub writable: bool,
}

impl Readiness {
    fn from_event(event: &Event) -> Self {
        Self {
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable() || event.is_write_closed(),
        }
    }
}

/// Which idle timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    /// No data arrived in time.
    ReadIdle,
    /// Queued data did not drain in time.
    WriteIdle,
}

/// Handle to a scheduled one-shot timer.
///
/// Handles are unique for the lifetime of the loop, so a stale handle never
/// matches a re-armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle {
    deadline: Instant,
    id: u64,
}

impl TimerHandle {
    /// When the timer fires.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    token: Token,
    kind: TimerKind,
}

// ============================================================================
// Reactor
// ============================================================================

/// Registration and timer capability handed to servers.
///
/// Servers never own the loop; every lifecycle operation that arms or disarms
/// a watcher receives the reactor explicitly.
pub struct Reactor {
    registry: Registry,
    timers: BTreeMap<TimerHandle, TimerEntry>,
    next_timer_id: u64,
    running: bool,
}

impl Reactor {
    /// Arms readiness interest for a source.
    pub fn register<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.registry.register(source, token, interest)
    }

    /// Changes the interest of an armed source.
    pub fn reregister<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.registry.reregister(source, token, interest)
    }

    /// Disarms a source.
    pub fn deregister<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.registry.deregister(source)
    }

    /// Schedules a one-shot timer `after` from now. Delays longer than
    /// [`MAX_TIMER_DELAY`] are clamped to it.
    pub fn schedule(&mut self, token: Token, kind: TimerKind, after: Duration) -> TimerHandle {
        let now = Instant::now();
        let handle = TimerHandle {
            deadline: now.checked_add(after.min(MAX_TIMER_DELAY)).unwrap_or(now),
            id: self.next_timer_id,
        };
        self.next_timer_id += 1;
        self.timers.insert(handle, TimerEntry { token, kind });
        trace!(?token, ?kind, ?after, "timer scheduled");
        handle
    }

    /// Cancels a timer. Cancelling a fired or unknown timer is a no-op.
    pub fn cancel(&mut self, handle: TimerHandle) {
        self.timers.remove(&handle);
    }

    /// Number of timers currently armed.
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Asks [`EventLoop::run`] to return after the current iteration.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Returns false once [`stop`](Self::stop) has been called.
    pub fn is_running(&self) -> bool {
        self.running
    }

    fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.timers
            .keys()
            .next()
            .map(|h| h.deadline.saturating_duration_since(now))
    }

    fn pop_expired(&mut self, now: Instant) -> Option<(TimerHandle, TimerEntry)> {
        let (&handle, _) = self.timers.first_key_value()?;
        if handle.deadline > now {
            return None;
        }
        self.timers.remove_entry(&handle)
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Something the event loop can drive.
pub trait Dispatch {
    /// A registered source became ready.
    fn on_ready(&mut self, reactor: &mut Reactor, token: Token, readiness: Readiness);

    /// A timer scheduled for `token` expired.
    fn on_timer(&mut self, reactor: &mut Reactor, token: Token, kind: TimerKind, handle: TimerHandle);

    /// A [`ShutdownHandle`] asked for a graceful stop.
    fn on_shutdown_requested(&mut self, reactor: &mut Reactor);

    /// Returns true once the target has fully stopped; `run` then returns.
    fn is_stopped(&self) -> bool;
}

// ============================================================================
// Shutdown Handle
// ============================================================================

/// Thread-safe trigger for a graceful stop.
///
/// Clone it into a signal-watching or control thread; calling
/// [`request`](Self::request) wakes the loop, which then calls
/// [`Dispatch::on_shutdown_requested`] on its target.
#[derive(Clone)]
pub struct ShutdownHandle {
    waker: Arc<Waker>,
    requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Requests a graceful stop.
    pub fn request(&self) -> io::Result<()> {
        self.requested.store(true, Ordering::SeqCst);
        self.waker.wake()
    }
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("requested", &self.requested.load(Ordering::SeqCst))
            .finish()
    }
}

// ============================================================================
// Event Loop
// ============================================================================

/// Single-threaded reactor loop.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    reactor: Reactor,
    shutdown: ShutdownHandle,
}

impl EventLoop {
    /// Creates a new loop with its own poll instance.
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Self {
            poll,
            events: Events::with_capacity(MAX_EVENTS),
            reactor: Reactor {
                registry,
                timers: BTreeMap::new(),
                next_timer_id: 0,
                running: false,
            },
            shutdown: ShutdownHandle {
                waker,
                requested: Arc::new(AtomicBool::new(false)),
            },
        })
    }

    /// The reactor, for lifecycle calls made outside of `run`.
    pub fn reactor_mut(&mut self) -> &mut Reactor {
        &mut self.reactor
    }

    /// A handle other threads can use to request a graceful stop.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Runs until the target stops or [`Reactor::stop`] is called.
    pub fn run<D: Dispatch + ?Sized>(&mut self, target: &mut D) -> io::Result<()> {
        self.reactor.running = true;
        debug!("event loop started");

        while self.reactor.running && !target.is_stopped() {
            self.turn(target, None)?;
        }

        self.reactor.running = false;
        debug!("event loop finished");
        Ok(())
    }

    /// Runs one poll iteration, waiting at most `max_wait` (or until the next
    /// timer when `None` and a timer is armed).
    pub fn turn<D: Dispatch + ?Sized>(
        &mut self,
        target: &mut D,
        max_wait: Option<Duration>,
    ) -> io::Result<()> {
        let timeout = match (self.reactor.next_timeout(Instant::now()), max_wait) {
            (Some(t), Some(m)) => Some(t.min(m)),
            (t, m) => t.or(m),
        };

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e);
        }

        for event in &self.events {
            let token = event.token();
            if token == WAKER_TOKEN {
                if self.shutdown.requested.swap(false, Ordering::SeqCst) {
                    debug!("shutdown requested");
                    target.on_shutdown_requested(&mut self.reactor);
                }
                continue;
            }
            target.on_ready(&mut self.reactor, token, Readiness::from_event(event));
        }

        let now = Instant::now();
        while let Some((handle, entry)) = self.reactor.pop_expired(now) {
            trace!(token = ?entry.token, kind = ?entry.kind, "timer fired");
            target.on_timer(&mut self.reactor, entry.token, entry.kind, handle);
        }

        Ok(())
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("pending_timers", &self.reactor.timers.len())
            .field("running", &self.reactor.running)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        fired: Vec<(Token, TimerKind)>,
        shutdowns: usize,
    }

    impl Dispatch for Recorder {
        fn on_ready(&mut self, _: &mut Reactor, _: Token, _: Readiness) {}

        fn on_timer(&mut self, _: &mut Reactor, token: Token, kind: TimerKind, _: TimerHandle) {
            self.fired.push((token, kind));
        }

        fn on_shutdown_requested(&mut self, reactor: &mut Reactor) {
            self.shutdowns += 1;
            reactor.stop();
        }

        fn is_stopped(&self) -> bool {
            false
        }
    }

    #[test]
    fn token_round_trips_server_and_fd() {
        let token = token_for(ServerId(7), 1234);
        assert_eq!(split_token(token), (ServerId(7), 1234));
        assert_ne!(token_for(ServerId(1), 5), token_for(ServerId(2), 5));
    }

    #[test]
    fn timers_fire_in_deadline_order_and_cancel_exactly() {
        let mut event_loop = EventLoop::new().expect("create event loop");
        let reactor = event_loop.reactor_mut();
        let late = reactor.schedule(Token(2), TimerKind::WriteIdle, Duration::from_millis(20));
        let early = reactor.schedule(Token(1), TimerKind::ReadIdle, Duration::from_millis(5));
        let cancelled = reactor.schedule(Token(3), TimerKind::ReadIdle, Duration::from_millis(1));
        reactor.cancel(cancelled);
        assert!(early < late);
        assert_eq!(reactor.pending_timers(), 2);

        let mut recorder = Recorder::default();
        let start = Instant::now();
        while recorder.fired.len() < 2 && start.elapsed() < Duration::from_secs(2) {
            event_loop
                .turn(&mut recorder, Some(Duration::from_millis(50)))
                .expect("event loop turn failed");
        }

        assert_eq!(
            recorder.fired,
            vec![(Token(1), TimerKind::ReadIdle), (Token(2), TimerKind::WriteIdle)]
        );
        assert_eq!(event_loop.reactor_mut().pending_timers(), 0);
    }

    #[test]
    fn oversized_delays_are_clamped() {
        let mut event_loop = EventLoop::new().expect("create event loop");
        let reactor = event_loop.reactor_mut();
        let before = Instant::now();

        let handle = reactor.schedule(Token(1), TimerKind::ReadIdle, Duration::MAX);
        assert_eq!(reactor.pending_timers(), 1);
        assert!(handle.deadline() > before + Duration::from_secs(60));
        assert!(handle.deadline() <= Instant::now() + MAX_TIMER_DELAY);

        // The far deadline must not fire or stall a bounded turn.
        let mut recorder = Recorder::default();
        event_loop
            .turn(&mut recorder, Some(Duration::from_millis(5)))
            .expect("turn with a far timer");
        assert!(recorder.fired.is_empty());
    }

    #[test]
    fn shutdown_handle_wakes_the_loop_from_another_thread() {
        let mut event_loop = EventLoop::new().expect("create event loop");
        let handle = event_loop.shutdown_handle();

        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.request().expect("request shutdown");
        });

        let mut recorder = Recorder::default();
        event_loop.run(&mut recorder).expect("event loop run failed");
        waker.join().expect("waker thread panicked");

        assert_eq!(recorder.shutdowns, 1);
    }
}
