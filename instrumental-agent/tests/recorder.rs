use std::{
    io::{BufRead as _, BufReader},
    net::TcpListener,
    thread,
};

use instrumental_agent::AgentBuilder;

#[test]
fn installed_recorder_reports_through_agent() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let collector = thread::spawn(move || {
        let (conn, _) = listener.accept().unwrap();
        BufReader::new(conn).lines().take(4).collect::<Result<Vec<String>, _>>().unwrap()
    });

    let agent = AgentBuilder::new("test-api-key")
        .with_endpoint(addr.to_string())
        .unwrap()
        .with_synchronous(true)
        .install()
        .unwrap();

    metrics::counter!("app.requests").increment(3);
    metrics::gauge!("app.queue_depth").set(7.0);

    let lines = collector.join().unwrap();
    assert_eq!(lines[..2], ["hello version 1.0", "authenticate test-api-key"]);
    assert!(lines[2].starts_with("increment app.requests 3 "), "unexpected line: {}", lines[2]);
    assert!(lines[3].starts_with("gauge app.queue_depth 7 "), "unexpected line: {}", lines[3]);

    // A second global recorder cannot be installed.
    let second = AgentBuilder::new("test-api-key")
        .with_endpoint(addr.to_string())
        .unwrap()
        .with_shutdown_timeout(std::time::Duration::from_millis(10))
        .install();
    assert!(second.is_err());

    agent.shutdown();
}
