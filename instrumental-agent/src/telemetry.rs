use std::sync::atomic::{AtomicU64, Ordering};

/// Agent telemetry.
///
/// `Telemetry` is shared between the caller-facing agent, the queue and the delivery worker. Every field is a plain
/// monotonic counter, so relaxed ordering is sufficient: readers only ever want an approximate, point-in-time view.
#[derive(Debug, Default)]
pub(crate) struct Telemetry {
    messages_queued: AtomicU64,
    messages_dropped: AtomicU64,
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    invalid_metrics: AtomicU64,
    invalid_notices: AtomicU64,
}

impl Telemetry {
    pub fn track_queued(&self) {
        self.messages_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn track_dropped(&self, count: u64) {
        self.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn track_sent(&self, bytes_len: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes_len as u64, Ordering::Relaxed);
    }

    pub fn track_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn track_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn track_invalid_metric(&self) {
        self.invalid_metrics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn track_invalid_notice(&self) {
        self.invalid_notices.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            messages_queued: self.messages_queued.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            invalid_metrics: self.invalid_metrics.load(Ordering::Relaxed),
            invalid_notices: self.invalid_notices.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time view of the agent's internal counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Messages accepted into the queue.
    pub messages_queued: u64,

    /// Messages discarded, either because the queue was full or because they were still pending at shutdown.
    pub messages_dropped: u64,

    /// Messages written to a collector connection.
    pub messages_sent: u64,

    /// Bytes written to a collector connection, excluding handshake lines.
    pub bytes_sent: u64,

    /// Sessions that were connected and authenticated.
    pub connections_established: u64,

    /// Failed connect, authenticate or send attempts.
    pub connection_failures: u64,

    /// Calls rejected because of an invalid metric name.
    pub invalid_metrics: u64,

    /// Calls rejected because of an invalid notice message.
    pub invalid_notices: u64,
}

#[cfg(test)]
mod tests {
    use super::{Telemetry, TelemetrySnapshot};

    #[test]
    fn snapshot_reflects_updates() {
        let telemetry = Telemetry::default();
        assert_eq!(telemetry.snapshot(), TelemetrySnapshot::default());

        telemetry.track_queued();
        telemetry.track_queued();
        telemetry.track_dropped(3);
        telemetry.track_sent(12);
        telemetry.track_sent(8);
        telemetry.track_connection_established();
        telemetry.track_connection_failure();
        telemetry.track_invalid_metric();
        telemetry.track_invalid_notice();

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.messages_queued, 2);
        assert_eq!(snapshot.messages_dropped, 3);
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.bytes_sent, 20);
        assert_eq!(snapshot.connections_established, 1);
        assert_eq!(snapshot.connection_failures, 1);
        assert_eq!(snapshot.invalid_metrics, 1);
        assert_eq!(snapshot.invalid_notices, 1);
    }
}
