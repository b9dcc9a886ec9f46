use std::{
    io::{self, BufRead as _, BufReader, Write},
    net::{SocketAddr, TcpListener},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use instrumental_agent::{
    connection::{Connector, Stream},
    AgentBuilder,
};
use parking_lot::Mutex;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A collector that accepts `sessions.len()` connections in turn, reading the given number of lines from each before
/// hanging up.
fn spawn_collector(sessions: Vec<usize>) -> (SocketAddr, JoinHandle<Vec<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        sessions
            .into_iter()
            .map(|line_count| {
                let (conn, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(conn);
                (0..line_count)
                    .map(|_| {
                        let mut line = String::new();
                        reader.read_line(&mut line).unwrap();
                        line.trim_end_matches('\n').to_string()
                    })
                    .collect()
            })
            .collect()
    });

    (addr, handle)
}

#[test]
fn synchronous_gauge_over_tcp() {
    init_tracing();
    let (addr, collector) = spawn_collector(vec![4]);

    let agent = AgentBuilder::new("test-api-key")
        .with_endpoint(addr.to_string())
        .unwrap()
        .with_synchronous(true)
        .build()
        .unwrap();

    agent.gauge("app.load", 1.5);
    // Synchronous calls return only once the line has been written.
    assert_eq!(agent.telemetry().messages_sent, 1);
    agent.increment_by("app.hits", 2.0);

    let sessions = collector.join().unwrap();
    assert_eq!(sessions.len(), 1);
    let lines = &sessions[0];
    assert_eq!(lines[0], "hello version 1.0");
    assert_eq!(lines[1], "authenticate test-api-key");
    assert!(lines[2].starts_with("gauge app.load 1.5 "), "unexpected line: {}", lines[2]);
    assert!(lines[3].starts_with("increment app.hits 2 "), "unexpected line: {}", lines[3]);

    agent.shutdown();
}

#[test]
fn reconnects_after_collector_hangs_up() {
    init_tracing();
    let (addr, collector) = spawn_collector(vec![3, 3]);

    let agent = AgentBuilder::new("test-api-key")
        .with_endpoint(addr.to_string())
        .unwrap()
        .with_synchronous(true)
        .build()
        .unwrap();

    agent.increment("app.first");

    // Let the collector read the line and hang up; the next send notices the closed connection, reconnects without
    // delay and is written on the new session.
    thread::sleep(Duration::from_millis(200));
    agent.increment("app.second");

    let sessions = collector.join().unwrap();
    assert_eq!(sessions.len(), 2);
    for (session, metric) in sessions.iter().zip(["app.first", "app.second"]) {
        assert_eq!(session[..2], ["hello version 1.0", "authenticate test-api-key"]);
        assert!(session[2].starts_with(&format!("increment {metric} 1 ")), "unexpected line: {}", session[2]);
    }

    let telemetry = agent.telemetry();
    assert_eq!(telemetry.connections_established, 2);
    assert_eq!(telemetry.connection_failures, 1);
    assert_eq!(telemetry.messages_sent, 2);
}

/// An in-memory transport recording every line written across all connections.
#[derive(Clone, Default)]
struct MemoryConnector {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemoryConnector {
    fn metric_lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|line| !line.starts_with("hello ") && !line.starts_with("authenticate "))
            .cloned()
            .collect()
    }
}

struct MemoryStream {
    lines: Arc<Mutex<Vec<String>>>,
    buf: Vec<u8>,
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.lines.lock().push(String::from_utf8_lossy(&line[..pos]).into_owned());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Stream for MemoryStream {
    fn peer_closed(&mut self) -> io::Result<bool> {
        Ok(false)
    }
}

impl Connector for MemoryConnector {
    type Stream = MemoryStream;

    fn connect(&mut self, _timeout: Option<Duration>) -> io::Result<MemoryStream> {
        Ok(MemoryStream { lines: Arc::clone(&self.lines), buf: Vec::new() })
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[test]
fn synchronous_call_returns_after_transport_records_write() {
    init_tracing();
    let connector = MemoryConnector::default();
    let agent =
        AgentBuilder::new("test-api-key").with_synchronous(true).build_with_connector(connector.clone()).unwrap();

    for i in 0..5 {
        agent.gauge(&format!("app.step{i}"), f64::from(i));
        assert_eq!(connector.metric_lines().len(), i as usize + 1);
    }
}

#[test]
fn time_is_reported_even_when_the_action_fails() {
    init_tracing();
    let connector = MemoryConnector::default();
    let agent =
        AgentBuilder::new("test-api-key").with_synchronous(true).build_with_connector(connector.clone()).unwrap();

    let result: Result<u32, String> = agent.time_ms("app.job_ms", || {
        thread::sleep(Duration::from_millis(15));
        Err("job failed".to_string())
    });
    assert_eq!(result, Err("job failed".to_string()));

    let lines = connector.metric_lines();
    assert_eq!(lines.len(), 1);
    let fields: Vec<&str> = lines[0].split(' ').collect();
    assert_eq!(fields[..2], ["gauge", "app.job_ms"]);
    let elapsed_ms: f64 = fields[2].parse().unwrap();
    assert!((15.0..5000.0).contains(&elapsed_ms), "unexpected duration {elapsed_ms}");
}

#[test]
fn shutdown_flushes_everything_in_order() {
    init_tracing();
    let connector = MemoryConnector::default();
    let agent = AgentBuilder::new("test-api-key").build_with_connector(connector.clone()).unwrap();

    for i in 0..200 {
        agent.increment_by("app.events", f64::from(i));
    }
    agent.shutdown();

    let values: Vec<u32> =
        connector.metric_lines().iter().map(|line| line.split(' ').nth(2).unwrap().parse().unwrap()).collect();
    assert_eq!(values, (0..200).collect::<Vec<u32>>());
    assert_eq!(agent.telemetry().messages_sent, 200);
}

#[test]
fn invalid_input_never_reaches_the_transport() {
    init_tracing();
    let connector = MemoryConnector::default();
    let agent =
        AgentBuilder::new("test-api-key").with_synchronous(true).build_with_connector(connector.clone()).unwrap();

    agent.gauge("not-dotted", 1.0);
    agent.notice("two\nlines");

    let lines = connector.metric_lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("increment agent.invalid_metric 1 "));

    let telemetry = agent.telemetry();
    assert_eq!(telemetry.invalid_metrics, 1);
    assert_eq!(telemetry.invalid_notices, 1);
}

#[test]
fn shutdown_gives_up_on_an_unreachable_collector() {
    init_tracing();
    // Bind and drop a listener to find a port nobody is listening on.
    let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();

    let agent = AgentBuilder::new("test-api-key")
        .with_endpoint(addr.to_string())
        .unwrap()
        .with_connect_timeout(Duration::from_millis(200))
        .with_shutdown_timeout(Duration::from_millis(200))
        .build()
        .unwrap();

    for _ in 0..10 {
        agent.increment("app.lost");
    }

    let started = Instant::now();
    agent.shutdown();
    assert!(started.elapsed() < Duration::from_secs(10));

    let telemetry = agent.telemetry();
    assert_eq!(telemetry.messages_queued, 10);
    assert_eq!(telemetry.messages_dropped, 10);
    assert_eq!(telemetry.messages_sent, 0);
}

/// A transport whose connection attempts hang, ignoring any timeout, before failing.
struct StalledConnector {
    stall: Duration,
}

impl Connector for StalledConnector {
    type Stream = MemoryStream;

    fn connect(&mut self, _timeout: Option<Duration>) -> io::Result<MemoryStream> {
        thread::sleep(self.stall);
        Err(io::Error::new(io::ErrorKind::TimedOut, "connection attempt timed out"))
    }

    fn describe(&self) -> String {
        "stalled".to_string()
    }
}

#[test]
fn shutdown_returns_within_its_timeout_while_connecting() {
    init_tracing();
    let agent = AgentBuilder::new("test-api-key")
        .with_shutdown_timeout(Duration::from_millis(100))
        .build_with_connector(StalledConnector { stall: Duration::from_secs(1) })
        .unwrap();

    for _ in 0..5 {
        agent.increment("app.stalled");
    }

    // Shut down while the worker is stuck in its first connection attempt.
    thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    agent.shutdown();
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(700), "shutdown took {elapsed:?}");

    // The detached worker drops the pending messages once its attempt gives up.
    let deadline = Instant::now() + Duration::from_secs(5);
    while agent.telemetry().messages_dropped < 5 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(agent.telemetry().messages_dropped, 5);
    assert_eq!(agent.telemetry().messages_sent, 0);
}
