use std::time::Duration;

use instrumental_agent::AgentBuilder;

fn main() {
    tracing_subscriber::fmt::init();

    let api_key = std::env::var("INSTRUMENTAL_API_KEY").expect("INSTRUMENTAL_API_KEY must be set");
    let agent = AgentBuilder::new(api_key)
        .with_endpoint("localhost:8000")
        .expect("failed to parse collector endpoint")
        .build()
        .expect("failed to build agent");

    agent.notice("demo started");

    for i in 0..30u32 {
        agent.increment("demo.loops");
        agent.gauge("demo.iteration", f64::from(i));
        agent.time_ms("demo.work_ms", || std::thread::sleep(Duration::from_millis(u64::from(i % 5) * 10)));

        std::thread::sleep(Duration::from_secs(1));
    }

    agent.notice_with_duration("demo finished", Duration::from_secs(30));
    println!("{:?}", agent.telemetry());
    agent.shutdown();
}
