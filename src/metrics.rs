use metrics::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use std::time::Duration;
use tracing::info;

/// Gateway and session counters.
///
/// Handles are bound to whatever recorder is installed when [`Metrics::new`]
/// runs, so install the exporter first. Without one every call is a no-op.
pub struct Metrics {
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub parse_failures: Counter,
    pub renders: Counter,
    pub render_failures: Counter,
    pub render_duration: Histogram,
    pub engine_launches: Counter,
    pub engine_launch_failures: Counter,
    pub evictions: Counter,
    pub eviction_failures: Counter,
    pub live_sessions: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            cache_hits: register_counter!("render_gateway_cache_hits_total"),
            cache_misses: register_counter!("render_gateway_cache_misses_total"),
            parse_failures: register_counter!("render_gateway_parse_failures_total"),
            renders: register_counter!("render_gateway_renders_total"),
            render_failures: register_counter!("render_gateway_render_failures_total"),
            render_duration: register_histogram!("render_gateway_render_duration_seconds"),
            engine_launches: register_counter!("render_gateway_engine_launches_total"),
            engine_launch_failures: register_counter!(
                "render_gateway_engine_launch_failures_total"
            ),
            evictions: register_counter!("render_gateway_evictions_total"),
            eviction_failures: register_counter!("render_gateway_eviction_failures_total"),
            live_sessions: register_gauge!("render_gateway_live_sessions"),
        }
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.increment(1);
        } else {
            self.cache_misses.increment(1);
        }
    }

    pub fn record_render(&self, duration: Duration, success: bool) {
        if success {
            self.renders.increment(1);
        } else {
            self.render_failures.increment(1);
        }

        self.render_duration.record(duration.as_secs_f64());
    }

    pub fn record_launch(&self, success: bool) {
        if success {
            self.engine_launches.increment(1);
            self.live_sessions.increment(1.0);
        } else {
            self.engine_launch_failures.increment(1);
        }
    }

    pub fn record_eviction(&self, success: bool) {
        self.evictions.increment(1);
        self.live_sessions.decrement(1.0);

        if !success {
            self.eviction_failures.increment(1);
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PrometheusExporter {
    port: u16,
}

impl PrometheusExporter {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    /// Installs the global recorder and serves `/metrics` on the configured port.
    pub fn install(&self) -> Result<(), metrics_exporter_prometheus::BuildError> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], self.port))
            .install()?;

        info!("Prometheus metrics listening on port {}", self.port);
        Ok(())
    }
}
