use std::time::{Duration, Instant};

use instrumental_agent::AgentBuilder;
use metrics::{counter, gauge, histogram};

fn main() {
    tracing_subscriber::fmt::init();

    let api_key = std::env::var("INSTRUMENTAL_API_KEY").expect("INSTRUMENTAL_API_KEY must be set");
    let agent = AgentBuilder::new(api_key)
        .with_endpoint("localhost:8000")
        .expect("failed to parse collector endpoint")
        .install()
        .expect("failed to install Instrumental recorder");

    let server_loops = counter!("demo.server_loops");
    let loop_delta_secs = histogram!("demo.loop_delta_secs");
    let in_flight = gauge!("demo.in_flight");

    let mut last = Instant::now();
    for i in 0..60u32 {
        server_loops.increment(1);
        loop_delta_secs.record(last.elapsed().as_secs_f64());
        last = Instant::now();

        if i % 3 == 0 {
            in_flight.increment(1.0);
        } else {
            in_flight.decrement(0.5);
        }

        std::thread::sleep(Duration::from_millis(500));
    }

    agent.shutdown();
}
