use std::sync::{
    atomic::{
        AtomicU64,
        Ordering::{AcqRel, Relaxed, Release},
    },
    Arc,
};

use metrics::{
    Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder, SharedString, Unit,
};
use metrics_util::registry::{Registry, Storage};

use crate::agent::Agent;

/// A [`metrics`] recorder that reports through an [`Agent`].
///
/// Every update is sent to the collector as it happens:
///
/// - counter increments become `increment` commands
/// - absolute counter values, gauge updates and histogram samples become `gauge` commands
///
/// Gauges remember their current value, so incrementing or decrementing a gauge reports the resulting value. Labels
/// have no representation in the Instrumental protocol and are ignored. Metric names must still be valid Instrumental
/// names (at least two dot-separated segments), which can be ensured for any name by configuring a prefix.
pub struct InstrumentalRecorder {
    registry: Registry<Key, AgentStorage>,
}

impl InstrumentalRecorder {
    /// Creates a recorder that reports metrics under their own names.
    pub fn new(agent: Arc<Agent>) -> Self {
        InstrumentalRecorder { registry: Registry::new(AgentStorage { agent, prefix: None }) }
    }

    /// Creates a recorder that reports every metric as `<prefix>.<name>`.
    pub fn with_prefix(agent: Arc<Agent>, prefix: impl Into<String>) -> Self {
        InstrumentalRecorder { registry: Registry::new(AgentStorage { agent, prefix: Some(prefix.into()) }) }
    }
}

impl Recorder for InstrumentalRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        self.registry.get_or_create_counter(key, |existing| Counter::from_arc(Arc::clone(existing)))
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        self.registry.get_or_create_gauge(key, |existing| Gauge::from_arc(Arc::clone(existing)))
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        self.registry.get_or_create_histogram(key, |existing| Histogram::from_arc(Arc::clone(existing)))
    }
}

struct AgentStorage {
    agent: Arc<Agent>,
    prefix: Option<String>,
}

impl AgentStorage {
    fn metric_name(&self, key: &Key) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}.{}", key.name()),
            None => key.name().to_string(),
        }
    }
}

impl Storage<Key> for AgentStorage {
    type Counter = Arc<AgentCounter>;
    type Gauge = Arc<AgentGauge>;
    type Histogram = Arc<AgentHistogram>;

    fn counter(&self, key: &Key) -> Self::Counter {
        Arc::new(AgentCounter { agent: Arc::clone(&self.agent), name: self.metric_name(key) })
    }

    fn gauge(&self, key: &Key) -> Self::Gauge {
        Arc::new(AgentGauge {
            agent: Arc::clone(&self.agent),
            name: self.metric_name(key),
            value: AtomicU64::new(0.0f64.to_bits()),
        })
    }

    fn histogram(&self, key: &Key) -> Self::Histogram {
        Arc::new(AgentHistogram { agent: Arc::clone(&self.agent), name: self.metric_name(key) })
    }
}

struct AgentCounter {
    agent: Arc<Agent>,
    name: String,
}

impl CounterFn for AgentCounter {
    fn increment(&self, value: u64) {
        self.agent.increment_by(&self.name, value as f64);
    }

    fn absolute(&self, value: u64) {
        self.agent.gauge(&self.name, value as f64);
    }
}

struct AgentGauge {
    agent: Arc<Agent>,
    name: String,
    value: AtomicU64,
}

impl AgentGauge {
    fn update(&self, op: impl Fn(f64) -> f64) -> f64 {
        let previous = self
            .value
            .fetch_update(AcqRel, Relaxed, |current| Some(op(f64::from_bits(current)).to_bits()))
            .unwrap_or_else(|current| current);
        op(f64::from_bits(previous))
    }
}

impl GaugeFn for AgentGauge {
    fn increment(&self, value: f64) {
        let current = self.update(|current| current + value);
        self.agent.gauge(&self.name, current);
    }

    fn decrement(&self, value: f64) {
        let current = self.update(|current| current - value);
        self.agent.gauge(&self.name, current);
    }

    fn set(&self, value: f64) {
        self.value.store(value.to_bits(), Release);
        self.agent.gauge(&self.name, value);
    }
}

struct AgentHistogram {
    agent: Arc<Agent>,
    name: String,
}

impl HistogramFn for AgentHistogram {
    fn record(&self, value: f64) {
        self.agent.gauge(&self.name, value);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use metrics::{counter, gauge, histogram, with_local_recorder};

    use super::InstrumentalRecorder;
    use crate::{
        agent::Agent,
        queue::{self, Consumer},
        telemetry::Telemetry,
    };

    fn recorder(prefix: Option<&str>) -> (InstrumentalRecorder, Consumer) {
        let telemetry = Arc::new(Telemetry::default());
        let (producer, consumer) = queue::with_telemetry(64, Arc::clone(&telemetry));
        let agent = Arc::new(Agent::new(producer, None, telemetry, true, false));
        let recorder = match prefix {
            Some(prefix) => InstrumentalRecorder::with_prefix(agent, prefix),
            None => InstrumentalRecorder::new(agent),
        };
        (recorder, consumer)
    }

    /// Returns each queued line without its trailing timestamp.
    fn commands(consumer: &Consumer) -> Vec<String> {
        std::iter::from_fn(|| consumer.try_dequeue())
            .map(|m| m.payload().rsplit_once(' ').unwrap().0.to_string())
            .collect()
    }

    #[test]
    fn counters() {
        let (recorder, consumer) = recorder(None);
        with_local_recorder(&recorder, || {
            counter!("app.requests").increment(1);
            counter!("app.requests", "route" => "/health").increment(4);
            counter!("app.total").absolute(99);
        });

        assert_eq!(
            commands(&consumer),
            ["increment app.requests 1", "increment app.requests 4", "gauge app.total 99"]
        );
    }

    #[test]
    fn gauges_report_their_current_value() {
        let (recorder, consumer) = recorder(None);
        with_local_recorder(&recorder, || {
            gauge!("app.connections").set(10.0);
            gauge!("app.connections").increment(2.5);
            gauge!("app.connections").decrement(0.5);
        });

        assert_eq!(
            commands(&consumer),
            ["gauge app.connections 10", "gauge app.connections 12.5", "gauge app.connections 12"]
        );
    }

    #[test]
    fn histograms_report_each_sample() {
        let (recorder, consumer) = recorder(None);
        with_local_recorder(&recorder, || {
            let latency = histogram!("app.latency");
            latency.record(0.25);
            latency.record(3.0);
        });

        assert_eq!(commands(&consumer), ["gauge app.latency 0.25", "gauge app.latency 3"]);
    }

    #[test]
    fn prefix_makes_names_valid() {
        let (recorder, consumer) = recorder(Some("myapp"));
        with_local_recorder(&recorder, || {
            counter!("requests_total").increment(1);
        });

        assert_eq!(commands(&consumer), ["increment myapp.requests_total 1"]);
    }

    #[test]
    fn invalid_names_are_reported_as_invalid_metrics() {
        let (recorder, consumer) = recorder(None);
        with_local_recorder(&recorder, || {
            counter!("requests_total").increment(1);
        });

        assert_eq!(commands(&consumer), ["increment agent.invalid_metric 1"]);
    }
}
