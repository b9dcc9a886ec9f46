//! Collector connection management.
//!
//! A [`ConnectionManager`] owns at most one session with the collector at a time. Each session walks through the
//! states `Disconnected → Connecting → Authenticating → Streaming`, and any failure along the way tears the session
//! down and returns it to `Disconnected`. Deciding when to try again is left to the caller.
use std::{
    io::{self, Read as _, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs as _},
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::{
    message::Message,
    protocol::{authenticate_line, HELLO_LINE},
    telemetry::Telemetry,
};

/// Default timeout for establishing a TCP connection to the collector.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for a single write to the collector.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised while talking to the collector.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The connection could not be opened.
    #[error("failed to connect to collector: {source}")]
    Connect {
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The handshake or authentication lines could not be written.
    #[error("failed to authenticate with collector: {source}")]
    Authenticate {
        /// Underlying I/O error.
        source: io::Error,
    },

    /// A message could not be written, or the liveness probe failed.
    #[error("I/O error while streaming to collector: {source}")]
    Io {
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The collector closed the connection.
    #[error("collector closed the connection")]
    Disconnected,

    /// An operation required a session in a state it was not in.
    #[error("no collector session in the required state (currently {state:?})")]
    NotConnected {
        /// The state the manager was in.
        state: ConnectionState,
    },
}

/// A byte stream to the collector.
pub trait Stream: Write {
    /// Checks, without blocking, whether the remote end has closed the connection.
    ///
    /// Any bytes the collector has sent are consumed and discarded, since the protocol never interprets them.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe itself fails.
    fn peer_closed(&mut self) -> io::Result<bool>;

    /// Closes the stream. Errors are ignored by callers.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream could not be shut down cleanly.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Opens streams to the collector.
pub trait Connector: Send + 'static {
    /// The stream type produced by this connector. Streams are owned by the background delivery thread.
    type Stream: Stream + Send;

    /// Opens a new stream.
    ///
    /// When `timeout` is given, the attempt should give up once it has elapsed, even if the connector is configured
    /// with a longer timeout of its own.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream could not be opened.
    fn connect(&mut self, timeout: Option<Duration>) -> io::Result<Self::Stream>;

    /// Returns a description of where this connector connects to, used for logging.
    fn describe(&self) -> String;
}

/// Connects to the collector over plaintext TCP.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    endpoint: String,
    connect_timeout: Duration,
    write_timeout: Duration,
}

impl TcpConnector {
    /// Creates a connector for the given `<host>:<port>` endpoint using the default timeouts.
    pub fn new(endpoint: impl Into<String>) -> Self {
        TcpConnector {
            endpoint: endpoint.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Sets the timeout for establishing a connection.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the timeout for each write.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&mut self, timeout: Option<Duration>) -> io::Result<TcpStream> {
        let connect_timeout = timeout.map_or(self.connect_timeout, |timeout| timeout.min(self.connect_timeout));
        if connect_timeout.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no time left to connect to collector"));
        }

        // Resolve on every attempt so that DNS changes are picked up across reconnects.
        let mut last_error = None;
        for addr in self.endpoint.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, connect_timeout) {
                Ok(stream) => {
                    stream.set_write_timeout(Some(self.write_timeout))?;
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => {
                    trace!(%addr, error = %e, "Failed to connect to resolved address.");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "collector endpoint did not resolve to any address")
        }))
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}

impl Stream for TcpStream {
    fn peer_closed(&mut self) -> io::Result<bool> {
        self.set_nonblocking(true)?;
        let result = drain_readable(self);
        self.set_nonblocking(false)?;
        result
    }

    fn close(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

fn drain_readable(stream: &mut TcpStream) -> io::Result<bool> {
    let mut scratch = [0u8; 512];
    loop {
        match stream.read(&mut scratch) {
            // Readable, but with nothing to read: the collector hung up.
            Ok(0) => return Ok(true),
            Ok(n) => trace!(bytes = n, "Discarding data sent by collector."),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
                ) =>
            {
                return Ok(true)
            }
            Err(e) => return Err(e),
        }
    }
}

/// Where a [`ConnectionManager`] is in the lifecycle of its current session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session exists.
    Disconnected,

    /// A connection attempt is in progress.
    Connecting,

    /// Connected, but the handshake has not been written yet.
    Authenticating,

    /// Connected and authenticated; messages can be sent.
    Streaming,
}

struct Session<S> {
    stream: S,
    authenticated: bool,
}

/// Owns the single outbound collector session.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    api_key: String,
    state: ConnectionState,
    session: Option<Session<C::Stream>>,
    write_buf: Vec<u8>,
    telemetry: Arc<Telemetry>,
}

impl<C: Connector> ConnectionManager<C> {
    /// Creates a disconnected manager.
    pub fn new(connector: C, api_key: impl Into<String>) -> Self {
        Self::with_telemetry(connector, api_key.into(), Arc::default())
    }

    pub(crate) fn with_telemetry(connector: C, api_key: String, telemetry: Arc<Telemetry>) -> Self {
        ConnectionManager {
            connector,
            api_key,
            state: ConnectionState::Disconnected,
            session: None,
            write_buf: Vec::with_capacity(256),
            telemetry,
        }
    }

    /// Returns the current session state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Opens a new connection, replacing any existing session.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Connect`] if the connection could not be opened.
    pub fn connect(&mut self) -> Result<(), DeliveryError> {
        self.open(None)
    }

    /// Opens a new connection like [`connect`][Self::connect], giving up once `timeout` has elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Connect`] if the connection could not be opened in time.
    pub fn connect_within(&mut self, timeout: Duration) -> Result<(), DeliveryError> {
        self.open(Some(timeout))
    }

    fn open(&mut self, timeout: Option<Duration>) -> Result<(), DeliveryError> {
        self.teardown();

        self.state = ConnectionState::Connecting;
        info!(collector = %self.connector.describe(), ?timeout, "Connecting to collector.");
        match self.connector.connect(timeout) {
            Ok(stream) => {
                self.session = Some(Session { stream, authenticated: false });
                self.state = ConnectionState::Authenticating;
                info!("Connected to collector.");
                Ok(())
            }
            Err(source) => {
                self.state = ConnectionState::Disconnected;
                Err(DeliveryError::Connect { source })
            }
        }
    }

    /// Writes the handshake and authentication lines on the current session.
    ///
    /// No response is awaited: a rejected API key only becomes visible when the collector closes the connection, which
    /// is picked up by the liveness probe in [`send_next`][Self::send_next].
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::NotConnected`] if there is no unauthenticated session, or
    /// [`DeliveryError::Authenticate`] if the lines could not be written. On error, the session is torn down.
    pub fn authenticate(&mut self) -> Result<(), DeliveryError> {
        let session = match self.session.as_mut() {
            Some(session) if !session.authenticated => session,
            _ => return Err(DeliveryError::NotConnected { state: self.state }),
        };

        self.write_buf.clear();
        self.write_buf.extend_from_slice(HELLO_LINE.as_bytes());
        self.write_buf.push(b'\n');
        self.write_buf.extend_from_slice(authenticate_line(&self.api_key).as_bytes());
        self.write_buf.push(b'\n');

        let result = session.stream.write_all(&self.write_buf).and_then(|()| session.stream.flush());
        match result {
            Ok(()) => {
                session.authenticated = true;
                self.state = ConnectionState::Streaming;
                debug!("Sent handshake and authentication to collector.");
                Ok(())
            }
            Err(source) => {
                self.teardown();
                Err(DeliveryError::Authenticate { source })
            }
        }
    }

    /// Connects and authenticates.
    ///
    /// # Errors
    ///
    /// Returns an error if either step fails.
    pub fn establish(&mut self) -> Result<(), DeliveryError> {
        self.connect()?;
        self.finish_establish()
    }

    /// Connects and authenticates, giving up on the connection attempt once `timeout` has elapsed.
    ///
    /// # Errors
    ///
    /// Returns an error if either step fails.
    pub fn establish_within(&mut self, timeout: Duration) -> Result<(), DeliveryError> {
        self.connect_within(timeout)?;
        self.finish_establish()
    }

    fn finish_establish(&mut self) -> Result<(), DeliveryError> {
        self.authenticate()?;
        self.telemetry.track_connection_established();
        Ok(())
    }

    /// Writes a single message to the collector, signalling its completion once written.
    ///
    /// Before writing, the session is probed for liveness. If the collector has closed the connection, the message is
    /// not written and [`DeliveryError::Disconnected`] is returned so that the caller can retry it on a new session.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no streaming session, the collector hung up, or the write failed. On error, the
    /// session is torn down and the message's completion is left pending.
    pub fn send_next(&mut self, message: &Message) -> Result<(), DeliveryError> {
        let session = match self.session.as_mut() {
            Some(session) if session.authenticated => session,
            _ => return Err(DeliveryError::NotConnected { state: self.state }),
        };

        match session.stream.peer_closed() {
            Ok(false) => {}
            Ok(true) => {
                self.teardown();
                return Err(DeliveryError::Disconnected);
            }
            Err(source) => {
                self.teardown();
                return Err(DeliveryError::Io { source });
            }
        }

        self.write_buf.clear();
        self.write_buf.extend_from_slice(message.payload().as_bytes());
        self.write_buf.push(b'\n');

        trace!(payload = message.payload(), "Sending message.");
        match session.stream.write_all(&self.write_buf).and_then(|()| session.stream.flush()) {
            Ok(()) => {
                self.telemetry.track_sent(self.write_buf.len());
                message.complete();
                Ok(())
            }
            Err(source) => {
                self.teardown();
                Err(DeliveryError::Io { source })
            }
        }
    }

    /// Closes the current session, if any. Close errors are ignored.
    pub fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.stream.close() {
                trace!(error = %e, "Error while closing collector connection.");
            }
            debug!("Closed collector connection.");
        }
        self.state = ConnectionState::Disconnected;
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        self.teardown();
    }
}
