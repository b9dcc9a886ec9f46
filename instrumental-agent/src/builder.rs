use std::{sync::Arc, time::Duration};

use thiserror::Error;

use crate::{
    agent::Agent,
    backoff::DEFAULT_MAX_RECONNECT_DELAY,
    connection::{ConnectionManager, Connector, TcpConnector, DEFAULT_CONNECT_TIMEOUT, DEFAULT_WRITE_TIMEOUT},
    protocol::DEFAULT_ENDPOINT,
    queue::{self, DEFAULT_QUEUE_CAPACITY},
    recorder::InstrumentalRecorder,
    telemetry::Telemetry,
    worker::{WorkerConfiguration, WorkerHandle, DEFAULT_SHUTDOWN_TIMEOUT},
};

/// Errors that could occur while building an agent.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The API key is empty or cannot be sent on a single protocol line.
    #[error("invalid API key: must be non-empty and contain no whitespace")]
    InvalidApiKey,

    /// The collector endpoint is not in `<host>:<port>` form.
    #[error("invalid collector endpoint '{endpoint}': {reason}")]
    InvalidEndpoint {
        /// The rejected endpoint.
        endpoint: String,

        /// Details about the parsing failure.
        reason: String,
    },

    /// The queue capacity is zero.
    #[error("queue capacity must be greater than zero")]
    InvalidQueueCapacity,

    /// A timeout was set to zero.
    #[error("{name} must be greater than zero")]
    InvalidTimeout {
        /// Which timeout was rejected.
        name: &'static str,
    },

    /// Failed to spawn the background delivery thread.
    #[error("failed to spawn background thread for delivery worker")]
    Backend,

    /// Failed to install the recorder due to an existing global recorder already being installed.
    #[error("failed to install recorder as global recorder")]
    FailedToInstall,
}

/// Builder for an [`Agent`].
pub struct AgentBuilder {
    api_key: String,
    endpoint: String,
    queue_capacity: usize,
    max_reconnect_delay: Duration,
    connect_timeout: Duration,
    write_timeout: Duration,
    shutdown_timeout: Duration,
    enabled: bool,
    synchronous: bool,
}

impl AgentBuilder {
    /// Creates a builder that authenticates with the given project API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        AgentBuilder {
            api_key: api_key.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_reconnect_delay: DEFAULT_MAX_RECONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            enabled: true,
            synchronous: false,
        }
    }

    /// Sets the collector endpoint, in the form `<host>:<port>`.
    ///
    /// The host is resolved on every connection attempt, so resolution failures are retried like any other connection
    /// failure rather than reported here.
    ///
    /// Defaults to `collector.instrumentalapp.com:8000`.
    ///
    /// # Errors
    ///
    /// If the endpoint is not in `<host>:<port>` form, an error will be returned indicating the reason.
    pub fn with_endpoint<A>(mut self, endpoint: A) -> Result<Self, BuildError>
    where
        A: AsRef<str>,
    {
        let endpoint = endpoint.as_ref();
        parse_endpoint(endpoint).map_err(|reason| BuildError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        })?;
        self.endpoint = endpoint.to_string();
        Ok(self)
    }

    /// Sets how many messages may wait for delivery before new ones are dropped.
    ///
    /// Defaults to 5,000.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the upper bound on the delay between reconnection attempts.
    ///
    /// Delays grow quadratically with the number of consecutive failures: 0s, 1s, 4s, 9s, and so on, up to this limit.
    ///
    /// Defaults to 15 seconds.
    #[must_use]
    pub fn with_max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.max_reconnect_delay = delay;
        self
    }

    /// Sets the timeout for establishing a connection to the collector.
    ///
    /// Defaults to 10 seconds.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the timeout for a single write to the collector. A write that times out counts as a disconnect, and the
    /// message is retried on the next connection.
    ///
    /// Defaults to 10 seconds.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets how long shutdown may spend flushing messages that are still queued.
    ///
    /// Defaults to 5 seconds.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets whether the agent starts out reporting. See [`Agent::set_enabled`].
    ///
    /// Defaults to `true`.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets whether the agent starts out in synchronous mode. See [`Agent::set_synchronous`].
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn with_synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    /// Builds the agent, connecting to the configured collector endpoint over TCP.
    ///
    /// The background delivery worker is spawned immediately and starts connecting right away.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, or the background thread cannot be spawned, an error will be returned.
    pub fn build(self) -> Result<Agent, BuildError> {
        if self.connect_timeout.is_zero() {
            return Err(BuildError::InvalidTimeout { name: "connect timeout" });
        }
        if self.write_timeout.is_zero() {
            return Err(BuildError::InvalidTimeout { name: "write timeout" });
        }

        let connector = TcpConnector::new(self.endpoint.clone())
            .with_connect_timeout(self.connect_timeout)
            .with_write_timeout(self.write_timeout);
        self.build_with_connector(connector)
    }

    /// Builds the agent, using `connector` to open connections to the collector.
    ///
    /// This allows delivering over a custom transport, such as an in-memory stream in tests. The endpoint and
    /// timeouts configured on this builder are not used.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, or the background thread cannot be spawned, an error will be returned.
    pub fn build_with_connector<C: Connector>(self, connector: C) -> Result<Agent, BuildError> {
        if self.api_key.is_empty() || self.api_key.contains(char::is_whitespace) {
            return Err(BuildError::InvalidApiKey);
        }
        if self.queue_capacity == 0 {
            return Err(BuildError::InvalidQueueCapacity);
        }

        let worker_config = self.worker_config();
        let telemetry = Arc::new(Telemetry::default());
        let (producer, consumer) = queue::with_telemetry(self.queue_capacity, Arc::clone(&telemetry));
        let manager = ConnectionManager::with_telemetry(connector, self.api_key, Arc::clone(&telemetry));

        let worker = WorkerHandle::spawn(manager, consumer, &worker_config, Arc::clone(&telemetry))
            .map_err(|_| BuildError::Backend)?;

        Ok(Agent::new(producer, Some(worker), telemetry, self.enabled, self.synchronous))
    }

    /// Builds the agent and installs an [`InstrumentalRecorder`] backed by it as the global `metrics` recorder.
    ///
    /// The agent is returned so that it can also be used directly, or shut down explicitly.
    ///
    /// # Errors
    ///
    /// If the agent cannot be built, or if a global recorder is already installed, an error will be returned.
    pub fn install(self) -> Result<Arc<Agent>, BuildError> {
        let agent = Arc::new(self.build()?);
        let recorder = InstrumentalRecorder::new(Arc::clone(&agent));

        metrics::set_global_recorder(recorder).map_err(|_| BuildError::FailedToInstall)?;
        Ok(agent)
    }

    fn worker_config(&self) -> WorkerConfiguration {
        WorkerConfiguration {
            max_reconnect_delay: self.max_reconnect_delay,
            shutdown_timeout: self.shutdown_timeout,
            ..WorkerConfiguration::default()
        }
    }
}

fn parse_endpoint(endpoint: &str) -> Result<(&str, u16), &'static str> {
    let (host, port) = endpoint.rsplit_once(':').ok_or("missing port")?;
    if host.is_empty() {
        return Err("missing host");
    }
    let port = port.parse::<u16>().map_err(|_| "port is not a number between 0 and 65535")?;
    if port == 0 {
        return Err("port must be non-zero");
    }
    Ok((host, port))
}
