use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime},
};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::{
    message::Message,
    protocol::{self, FormatError, ValidationError, INVALID_METRIC_NAME},
    queue::{Enqueued, Producer},
    telemetry::{Telemetry, TelemetrySnapshot},
    worker::WorkerHandle,
};

#[derive(Debug, Error)]
enum RecordError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Format(#[from] FormatError),
}

#[derive(Clone, Copy)]
enum MetricCommand {
    Gauge,
    Increment,
}

impl MetricCommand {
    fn line(self, name: &str, value: f64, time: SystemTime) -> Result<String, FormatError> {
        match self {
            MetricCommand::Gauge => protocol::gauge_line(name, value, time),
            MetricCommand::Increment => protocol::increment_line(name, value, time),
        }
    }
}

/// Reports gauges, counters and notices to an Instrumental collector.
///
/// Every reporting method validates its input, formats a protocol line and hands it to a background worker, which
/// owns the connection to the collector. None of them ever fail from the caller's point of view: invalid input,
/// a full queue or an unreachable collector are logged and otherwise ignored.
///
/// An `Agent` is created with [`AgentBuilder`][crate::AgentBuilder], can be shared freely between threads, and stops
/// its worker when dropped or when [`shutdown`][Agent::shutdown] is called.
pub struct Agent {
    producer: RwLock<Option<Producer>>,
    enabled: AtomicBool,
    synchronous: AtomicBool,
    worker: Mutex<Option<WorkerHandle>>,
    telemetry: Arc<Telemetry>,
}

impl Agent {
    pub(crate) fn new(
        producer: Producer,
        worker: Option<WorkerHandle>,
        telemetry: Arc<Telemetry>,
        enabled: bool,
        synchronous: bool,
    ) -> Self {
        Agent {
            producer: RwLock::new(Some(producer)),
            enabled: AtomicBool::new(enabled),
            synchronous: AtomicBool::new(synchronous),
            worker: Mutex::new(worker),
            telemetry,
        }
    }

    /// Returns `true` if the agent is reporting.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Enables or disables reporting. While disabled, every reporting method is a no-op.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Returns `true` if reporting methods wait for their message to be written before returning.
    pub fn is_synchronous(&self) -> bool {
        self.synchronous.load(Ordering::Relaxed)
    }

    /// Sets whether reporting methods wait for their message to be written to the collector connection.
    ///
    /// Waiting ends once the line has been handed to the socket; it does not mean the collector accepted it. Messages
    /// dropped because the queue is full never block.
    pub fn set_synchronous(&self, synchronous: bool) {
        self.synchronous.store(synchronous, Ordering::Relaxed);
    }

    /// Records the current value of `name`, timestamped now.
    pub fn gauge(&self, name: &str, value: f64) {
        self.gauge_at(name, value, SystemTime::now());
    }

    /// Records the value of `name` at `time`.
    pub fn gauge_at(&self, name: &str, value: f64, time: SystemTime) {
        self.metric(MetricCommand::Gauge, name, value, time);
    }

    /// Increments the counter `name` by one, timestamped now.
    pub fn increment(&self, name: &str) {
        self.increment_at(name, 1.0, SystemTime::now());
    }

    /// Increments the counter `name` by `value`, timestamped now.
    pub fn increment_by(&self, name: &str, value: f64) {
        self.increment_at(name, value, SystemTime::now());
    }

    /// Increments the counter `name` by `value` at `time`.
    pub fn increment_at(&self, name: &str, value: f64, time: SystemTime) {
        self.metric(MetricCommand::Increment, name, value, time);
    }

    /// Records a notice, timestamped now, with no duration.
    pub fn notice(&self, message: &str) {
        self.notice_at(message, Duration::ZERO, SystemTime::now());
    }

    /// Records a notice, timestamped now, spanning `duration`.
    pub fn notice_with_duration(&self, message: &str, duration: Duration) {
        self.notice_at(message, duration, SystemTime::now());
    }

    /// Records a notice starting at `time` and spanning `duration`.
    ///
    /// Messages containing a carriage return or line feed are rejected.
    pub fn notice_at(&self, message: &str, duration: Duration, time: SystemTime) {
        if !self.is_enabled() {
            return;
        }

        let result = protocol::validate_notice(message)
            .map_err(RecordError::from)
            .and_then(|()| Ok(protocol::notice_line(time, duration, message)?));

        match result {
            Ok(line) => self.send(line),
            Err(RecordError::Validation(e)) => {
                self.telemetry.track_invalid_notice();
                warn!(error = %e, "Invalid notice message.");
            }
            Err(RecordError::Format(e)) => error!(error = %e, "Failed to format notice."),
        }
    }

    /// Runs `action` and records how long it took, in seconds, as a gauge named `name`.
    ///
    /// The gauge is recorded even if `action` panics, and the result of `action` is returned unchanged.
    pub fn time<T>(&self, name: &str, action: impl FnOnce() -> T) -> T {
        self.time_with_multiplier(name, 1.0, action)
    }

    /// Runs `action` and records how long it took, in milliseconds, as a gauge named `name`.
    pub fn time_ms<T>(&self, name: &str, action: impl FnOnce() -> T) -> T {
        self.time_with_multiplier(name, 1000.0, action)
    }

    /// Runs `action` and records how long it took, in seconds multiplied by `multiplier`, as a gauge named `name`.
    pub fn time_with_multiplier<T>(&self, name: &str, multiplier: f64, action: impl FnOnce() -> T) -> T {
        let _timer = Timer { agent: self, name, multiplier, start: Instant::now() };
        action()
    }

    /// Returns a snapshot of the agent's internal counters.
    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Stops the agent.
    ///
    /// New reports are ignored from this point on. The background worker is asked to flush what is still queued,
    /// within its shutdown timeout, and this call blocks until it has exited or the timeout has passed. Calling
    /// `shutdown` more than once is harmless.
    pub fn shutdown(&self) {
        // Waits for in-progress enqueues, so nothing can land in the queue after the worker's final drain.
        drop(self.producer.write().take());

        if let Some(mut worker) = self.worker.lock().take() {
            worker.shutdown();
        }
    }

    fn metric(&self, command: MetricCommand, name: &str, value: f64, time: SystemTime) {
        if !self.is_enabled() {
            return;
        }

        if let Err(e) = protocol::validate_metric_name(name) {
            self.telemetry.track_invalid_metric();
            self.increment(INVALID_METRIC_NAME);
            warn!(error = %e, "Invalid metric name.");
            return;
        }

        let result = protocol::validate_value(value)
            .map_err(RecordError::from)
            .and_then(|()| Ok(command.line(name, value, time)?));

        match result {
            Ok(line) => self.send(line),
            Err(RecordError::Validation(e)) => warn!(metric_name = name, error = %e, "Invalid metric value."),
            Err(RecordError::Format(e)) => error!(metric_name = name, error = %e, "Failed to format metric."),
        }
    }

    fn send(&self, line: String) {
        let synchronous = self.is_synchronous();

        let receipt = {
            let guard = self.producer.read();
            let Some(producer) = guard.as_ref() else {
                debug!(payload = line.as_str(), "Agent is shut down. Dropping message.");
                return;
            };

            debug!(payload = line.as_str(), "Queueing message.");
            if synchronous {
                let (message, receipt) = Message::synchronous(line);
                match producer.enqueue(message) {
                    Enqueued::Accepted => Some(receipt),
                    Enqueued::Dropped => None,
                }
            } else {
                producer.enqueue(Message::new(line));
                None
            }
        };

        // Wait outside the lock so that a concurrent shutdown is never held up by a blocked caller.
        if let Some(receipt) = receipt {
            if let Err(e) = receipt.wait() {
                debug!(error = %e, "Synchronous message was not written.");
            }
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Timer<'a> {
    agent: &'a Agent,
    name: &'a str,
    multiplier: f64,
    start: Instant,
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_secs_f64();
        self.agent.gauge(self.name, elapsed * self.multiplier);
    }
}
