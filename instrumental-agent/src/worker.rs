use std::{
    io,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use once_cell::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::{
    backoff::Backoff,
    connection::{ConnectionManager, ConnectionState, Connector, DeliveryError},
    message::Message,
    queue::{Consumer, Dequeued},
    telemetry::Telemetry,
};

/// Default time allowed for flushing pending messages at shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// How long past the shutdown deadline to wait for the worker to notice it before detaching the thread.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// Delivery worker configuration.
#[derive(Clone, Debug)]
pub(crate) struct WorkerConfiguration {
    /// Upper bound on the delay between reconnection attempts.
    pub max_reconnect_delay: Duration,

    /// Base unit of the quadratic backoff.
    pub backoff_unit: Duration,

    /// Time allowed for flushing pending messages once shutdown is requested.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfiguration {
    fn default() -> Self {
        WorkerConfiguration {
            max_reconnect_delay: crate::backoff::DEFAULT_MAX_RECONNECT_DELAY,
            backoff_unit: Duration::from_secs(1),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

enum SessionEnd {
    Shutdown,
    Closed,
}

/// Drains the message queue into the collector, reconnecting with backoff whenever the session fails.
pub(crate) struct DeliveryWorker<C: Connector> {
    manager: ConnectionManager<C>,
    consumer: Consumer,
    shutdown: Receiver<()>,
    backoff: Backoff,
    // The message whose send failed, retried ahead of anything still queued.
    retained: Option<Message>,
    // Whether the last failure happened on an established session, which makes a reconnect worth trying at shutdown.
    reconnect_on_drain: bool,
    deadline: Arc<OnceCell<Instant>>,
    shutdown_timeout: Duration,
    telemetry: Arc<Telemetry>,
}

impl<C: Connector> DeliveryWorker<C> {
    fn new(
        manager: ConnectionManager<C>,
        consumer: Consumer,
        shutdown: Receiver<()>,
        deadline: Arc<OnceCell<Instant>>,
        config: &WorkerConfiguration,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        DeliveryWorker {
            manager,
            consumer,
            shutdown,
            backoff: Backoff::with_unit(config.max_reconnect_delay, config.backoff_unit),
            retained: None,
            reconnect_on_drain: true,
            deadline,
            shutdown_timeout: config.shutdown_timeout,
            telemetry,
        }
    }

    /// Runs the worker until shutdown is requested or every producer is gone.
    pub fn run(mut self) {
        loop {
            match self.run_session() {
                Ok(SessionEnd::Shutdown) => {
                    self.drain();
                    break;
                }
                Ok(SessionEnd::Closed) => break,
                Err(e) => {
                    self.manager.teardown();
                    self.telemetry.track_connection_failure();
                    self.reconnect_on_drain =
                        !matches!(e, DeliveryError::Connect { .. } | DeliveryError::Authenticate { .. });

                    let delay = self.backoff.next_delay();
                    error!(
                        error = %e,
                        failures = self.backoff.consecutive_failures(),
                        ?delay,
                        "Disconnected from collector. Reconnecting after delay."
                    );

                    match self.shutdown.recv_timeout(delay) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                            self.drain();
                            break;
                        }
                    }
                }
            }
        }

        self.manager.teardown();
        debug!("Delivery worker stopped.");
    }

    fn run_session(&mut self) -> Result<SessionEnd, DeliveryError> {
        if self.manager.state() != ConnectionState::Streaming {
            self.manager.establish()?;
            self.backoff.reset();
        }

        loop {
            let message = match self.retained.take() {
                Some(message) => message,
                None => match self.consumer.dequeue_or_shutdown(&self.shutdown) {
                    Dequeued::Message(message) => message,
                    Dequeued::Shutdown => return Ok(SessionEnd::Shutdown),
                    Dequeued::Closed => return Ok(SessionEnd::Closed),
                },
            };

            if let Err(e) = self.manager.send_next(&message) {
                self.retained = Some(message);
                return Err(e);
            }
        }
    }

    /// Flushes whatever is still pending, giving up once the shutdown deadline has passed.
    ///
    /// A lost session is re-established at most once, and only if the collector was reachable before, with the
    /// connection attempt bounded by the time left.
    fn drain(&mut self) {
        let pending = usize::from(self.retained.is_some()) + self.consumer.len();
        if pending == 0 {
            return;
        }

        // Set by the handle before signalling; absent only if the worker was stopped some other way.
        let deadline = *self.deadline.get_or_init(|| Instant::now() + self.shutdown_timeout);
        let remaining = deadline.saturating_duration_since(Instant::now());
        info!(pending, ?remaining, "Flushing pending messages before shutdown.");

        if self.manager.state() != ConnectionState::Streaming {
            if remaining.is_zero() || !self.reconnect_on_drain {
                warn!(pending, "Collector is unavailable. Dropping pending messages.");
                self.drop_pending();
                return;
            }

            if let Err(e) = self.manager.establish_within(remaining) {
                warn!(error = %e, "Could not reconnect to collector to flush pending messages.");
                self.drop_pending();
                return;
            }
        }

        // Only flush what was pending when shutdown began.
        for _ in 0..pending {
            if Instant::now() >= deadline {
                warn!("Shutdown timeout elapsed before all pending messages were flushed.");
                break;
            }

            let Some(message) = self.retained.take().or_else(|| self.consumer.try_dequeue()) else {
                break;
            };

            if let Err(e) = self.manager.send_next(&message) {
                warn!(error = %e, "Failed to flush pending message during shutdown.");
                self.retained = Some(message);
                break;
            }
        }

        self.drop_pending();
    }

    fn drop_pending(&mut self) {
        let mut dropped = u64::from(self.retained.take().is_some());
        for _ in 0..self.consumer.len() {
            if self.consumer.try_dequeue().is_none() {
                break;
            }
            dropped += 1;
        }

        if dropped > 0 {
            warn!(dropped, "Dropped pending messages at shutdown.");
            self.telemetry.track_dropped(dropped);
        }
    }
}

/// Handle to a running delivery worker thread.
pub(crate) struct WorkerHandle {
    shutdown: Option<Sender<()>>,
    deadline: Arc<OnceCell<Instant>>,
    shutdown_timeout: Duration,
    exited: Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawns a delivery worker on a dedicated background thread.
    pub fn spawn<C: Connector>(
        manager: ConnectionManager<C>,
        consumer: Consumer,
        config: &WorkerConfiguration,
        telemetry: Arc<Telemetry>,
    ) -> io::Result<Self> {
        // Nothing is ever sent on these channels: dropping the sender is the signal.
        let (shutdown_tx, shutdown_rx) = bounded(0);
        let (exited_tx, exited_rx) = bounded::<()>(0);
        let deadline = Arc::new(OnceCell::new());
        let worker = DeliveryWorker::new(manager, consumer, shutdown_rx, Arc::clone(&deadline), config, telemetry);

        let thread = std::thread::Builder::new()
            .name("instrumental-agent-worker".to_string())
            .spawn(move || {
                let _exited = exited_tx;
                worker.run();
            })?;

        Ok(WorkerHandle {
            shutdown: Some(shutdown_tx),
            deadline,
            shutdown_timeout: config.shutdown_timeout,
            exited: exited_rx,
            thread: Some(thread),
        })
    }

    /// Signals the worker to stop and waits for it to finish flushing.
    ///
    /// Waits no longer than the shutdown timeout, plus a short grace period. A worker stuck in a connection attempt
    /// past that point is detached: it drops whatever is still pending and exits on its own once the attempt ends.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        let deadline = Instant::now() + self.shutdown_timeout;
        let _ = self.deadline.set(deadline);
        drop(self.shutdown.take());

        match self.exited.recv_deadline(deadline + SHUTDOWN_GRACE) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if thread.join().is_err() {
                    error!("Delivery worker panicked.");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout = ?self.shutdown_timeout, "Delivery worker did not stop in time. Detaching it.");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
