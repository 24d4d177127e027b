//! Maintaining and outputting metrics.
//!
//! Relevant sources for selecting metrics, metric names, and labels:
//! - https://prometheus.io/docs/practices/naming/
//! - https://prometheus.io/docs/practices/instrumentation/

use std::sync::Mutex;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

//------------ Module Configuration ------------------------------------------

/// The application prefix to use in the names of Prometheus metrics.
const PROMETHEUS_PREFIX: &str = "zonewall";

//------------ Metrics -------------------------------------------------------

/// The daemon-wide metrics collection.
///
/// Individual metrics are cheap handles; units update them directly.  The
/// registry is only locked when the API plane scrapes.
#[derive(Debug)]
pub struct Metrics {
    registry: Mutex<Registry>,

    /// The id of the live generation.
    pub live_generation: Gauge,

    /// Rulesets committed since start.
    pub applies: Counter,

    /// Rollbacks since start (kernel rejections, expired pending applies).
    pub rollbacks: Counter,

    /// External ruleset mutations the integrity monitor restored.
    pub tamper_events: Counter,

    /// 1 while the daemon is in safe mode.
    pub safe_mode: Gauge,

    /// API plane crashes counted by the supervisor.
    pub child_crashes: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix(PROMETHEUS_PREFIX);

        let live_generation = Gauge::default();
        registry.register(
            "live_generation",
            "The id of the live ruleset generation",
            live_generation.clone(),
        );

        let applies = Counter::default();
        registry.register(
            "applies",
            "Ruleset generations committed since start",
            applies.clone(),
        );

        let rollbacks = Counter::default();
        registry.register(
            "rollbacks",
            "Ruleset rollbacks since start",
            rollbacks.clone(),
        );

        let tamper_events = Counter::default();
        registry.register(
            "tamper_events",
            "External ruleset mutations that were restored",
            tamper_events.clone(),
        );

        let safe_mode = Gauge::default();
        registry.register("safe_mode", "Whether safe mode is active", safe_mode.clone());

        let child_crashes = Counter::default();
        registry.register(
            "child_crashes",
            "API plane crashes observed by the supervisor",
            child_crashes.clone(),
        );

        Self {
            registry: Mutex::new(registry),
            live_generation,
            applies,
            rollbacks,
            tamper_events,
            safe_mode,
            child_crashes,
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn assemble(&self) -> String {
        let mut out = String::new();
        let registry = self.registry.lock().unwrap();
        if let Err(err) = encode(&mut out, &registry) {
            tracing::error!("Failed to encode metrics: {err}");
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_render_with_the_prefix() {
        let metrics = Metrics::new();
        metrics.applies.inc();
        metrics.live_generation.set(3);

        let text = metrics.assemble();
        assert!(text.contains("zonewall_applies_total 1"));
        assert!(text.contains("zonewall_live_generation 3"));
    }
}
