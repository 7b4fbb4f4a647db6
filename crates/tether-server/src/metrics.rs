//! Prometheus metrics for servers and connections.
//!
//! All series are labelled with the server id, so several servers sharing a
//! process (or a [`Manager`](crate::Manager)) stay distinguishable.

use std::sync::OnceLock;

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::reactor::ServerId;

/// Global metrics registry.
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Server metrics collection.
pub struct Metrics {
    /// Registry for all metrics.
    registry: Registry,

    /// Connections accepted.
    pub connections_total: IntCounterVec,
    /// Connections currently in the connection table.
    pub connections_active: IntGaugeVec,
    /// Connections closed, by reason.
    pub connections_closed: IntCounterVec,

    /// Bytes received from peers.
    pub bytes_received: IntCounterVec,
    /// Bytes handed to the kernel for sending.
    pub bytes_sent: IntCounterVec,
    /// Writes that could not be sent immediately and were queued.
    pub writes_queued: IntCounterVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounterVec::new(
            Opts::new("tether_connections_total", "Total number of connections accepted"),
            &["server"],
        )
        .expect("valid metric");

        let connections_active = IntGaugeVec::new(
            Opts::new("tether_connections_active", "Number of active connections"),
            &["server"],
        )
        .expect("valid metric");

        let connections_closed = IntCounterVec::new(
            Opts::new("tether_connections_closed_total", "Connections closed by reason"),
            &["server", "reason"],
        )
        .expect("valid metric");

        let bytes_received = IntCounterVec::new(
            Opts::new("tether_bytes_received_total", "Bytes received from peers"),
            &["server"],
        )
        .expect("valid metric");

        let bytes_sent = IntCounterVec::new(
            Opts::new("tether_bytes_sent_total", "Bytes written to sockets"),
            &["server"],
        )
        .expect("valid metric");

        let writes_queued = IntCounterVec::new(
            Opts::new("tether_writes_queued_total", "Writes deferred to the write queue"),
            &["server"],
        )
        .expect("valid metric");

        registry
            .register(Box::new(connections_total.clone()))
            .expect("register metric");
        registry
            .register(Box::new(connections_active.clone()))
            .expect("register metric");
        registry
            .register(Box::new(connections_closed.clone()))
            .expect("register metric");
        registry
            .register(Box::new(bytes_received.clone()))
            .expect("register metric");
        registry
            .register(Box::new(bytes_sent.clone()))
            .expect("register metric");
        registry
            .register(Box::new(writes_queued.clone()))
            .expect("register metric");

        Self {
            registry,
            connections_total,
            connections_active,
            connections_closed,
            bytes_received,
            bytes_sent,
            writes_queued,
        }
    }

    /// Returns the global metrics instance.
    pub fn global() -> &'static Metrics {
        METRICS.get_or_init(Metrics::new)
    }

    /// Renders metrics in Prometheus text format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_else(|e| format!("# Error encoding metrics: {e}\n"))
    }
}

/// Renders the global registry in Prometheus text format.
pub fn render() -> String {
    Metrics::global().render()
}

fn label(server: ServerId) -> String {
    server.0.to_string()
}

/// Records a new connection.
pub(crate) fn record_connection_accepted(server: ServerId) {
    let metrics = Metrics::global();
    let server = label(server);
    metrics.connections_total.with_label_values(&[server.as_str()]).inc();
    metrics.connections_active.with_label_values(&[server.as_str()]).inc();
}

/// Records a closed connection.
pub(crate) fn record_connection_closed(server: ServerId, reason: &str) {
    let metrics = Metrics::global();
    let server = label(server);
    metrics.connections_active.with_label_values(&[server.as_str()]).dec();
    metrics
        .connections_closed
        .with_label_values(&[server.as_str(), reason])
        .inc();
}

/// Records received bytes.
pub(crate) fn record_bytes_received(server: ServerId, n: usize) {
    Metrics::global()
        .bytes_received
        .with_label_values(&[label(server).as_str()])
        .inc_by(n as u64);
}

/// Records sent bytes.
pub(crate) fn record_bytes_sent(server: ServerId, n: usize) {
    Metrics::global()
        .bytes_sent
        .with_label_values(&[label(server).as_str()])
        .inc_by(n as u64);
}

/// Records a write that went to the queue.
pub(crate) fn record_write_queued(server: ServerId) {
    Metrics::global()
        .writes_queued
        .with_label_values(&[label(server).as_str()])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_connection() {
        let server = ServerId(9001);
        let active = || {
            Metrics::global()
                .connections_active
                .with_label_values(&["9001"])
                .get()
        };

        let initial = active();
        record_connection_accepted(server);
        assert_eq!(active(), initial + 1);
        record_connection_closed(server, "eof");
        assert_eq!(active(), initial);
    }

    #[test]
    fn test_render_contains_series() {
        record_bytes_received(ServerId(9002), 5);
        record_bytes_sent(ServerId(9002), 5);
        let output = render();
        assert!(output.contains("tether_bytes_received_total"));
        assert!(output.contains("tether_bytes_sent_total"));
    }
}
