use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder,
    register_gauge_vec_with_registry, register_gauge_with_registry,
    register_int_counter_vec_with_registry,
};
use lazy_static::lazy_static;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub struct MetricsRegistry {
    registry: Registry,

    // Gauge metrics
    pub agent_info: GaugeVec,
    pub sibling_processes: Gauge,
    pub last_heartbeat_timestamp: Gauge,
    pub last_update_check_timestamp: Gauge,

    // Counter metrics
    pub heartbeats: IntCounterVec,
    pub update_checks: IntCounterVec,
    pub drained_processes: IntCounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let registry = Registry::new();

        let agent_info = register_gauge_vec_with_registry!(
            Opts::new("sentinel_agent_info", "Agent build information"),
            &["version", "device_id"],
            registry
        ).unwrap();

        let sibling_processes = register_gauge_with_registry!(
            Opts::new("sentinel_agent_sibling_processes", "Other agent instances seen by the last discovery"),
            registry
        ).unwrap();

        let last_heartbeat_timestamp = register_gauge_with_registry!(
            Opts::new("sentinel_agent_last_heartbeat_timestamp_seconds", "Unix timestamp of last successful heartbeat"),
            registry
        ).unwrap();

        let last_update_check_timestamp = register_gauge_with_registry!(
            Opts::new("sentinel_agent_last_update_check_timestamp_seconds", "Unix timestamp of last update check"),
            registry
        ).unwrap();

        let heartbeats = register_int_counter_vec_with_registry!(
            Opts::new("sentinel_agent_heartbeats_total", "Heartbeats sent, by result"),
            &["result"],
            registry
        ).unwrap();

        let update_checks = register_int_counter_vec_with_registry!(
            Opts::new("sentinel_agent_update_checks_total", "Update passes, by outcome"),
            &["result"],
            registry
        ).unwrap();

        let drained_processes = register_int_counter_vec_with_registry!(
            Opts::new("sentinel_agent_drained_processes_total", "Signals delivered to old instances, by signal"),
            &["signal"],
            registry
        ).unwrap();

        Self {
            registry,
            agent_info,
            sibling_processes,
            last_heartbeat_timestamp,
            last_update_check_timestamp,
            heartbeats,
            update_checks,
            drained_processes,
        }
    }

    pub fn render(&self) -> Result<String, Box<dyn std::error::Error>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn set_agent_info(&self, version: &str, device_id: &str) {
        self.agent_info.reset();
        self.agent_info.with_label_values(&[version, device_id]).set(1.0);
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

lazy_static! {
    pub static ref METRICS: Arc<MetricsRegistry> = Arc::new(MetricsRegistry::new());
}
