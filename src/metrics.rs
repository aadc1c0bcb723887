use lazy_static::lazy_static;
use prometheus::{
    register_gauge_vec, register_int_counter, register_int_gauge, Encoder, GaugeVec, IntCounter,
    IntGauge, TextEncoder,
};
use serde::Deserialize;

lazy_static! {
    pub static ref TASKS_ACTIVE: IntGauge = register_int_gauge!(
        "vodhls_tasks_active",
        "Transcode tasks currently queued, starting, running or ready"
    )
    .unwrap();
    pub static ref ENCODER_LAUNCHES: IntCounter = register_int_counter!(
        "vodhls_encoder_launches_total",
        "Encoder processes spawned, including restarts after seeks"
    )
    .unwrap();
    pub static ref ADMISSION_REJECTIONS: IntCounter = register_int_counter!(
        "vodhls_admission_rejections_total",
        "Start requests rejected because the concurrency ceiling was reached"
    )
    .unwrap();
    pub static ref SEGMENTS_SKIPPED: IntCounter = register_int_counter!(
        "vodhls_segments_skipped_total",
        "Segment requests answered with the skip signal"
    )
    .unwrap();
    pub static ref ENCODER_CPU_USAGE: GaugeVec = register_gauge_vec!(
        "vodhls_encoder_cpu_usage_percent",
        "Current CPU usage of the encoder process per task (0-100+)",
        &["task_id"]
    )
    .unwrap();
}

pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitoringConfig {
    #[serde(default = "default_monitoring_enabled")]
    pub enabled: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: default_monitoring_enabled(),
        }
    }
}

fn default_monitoring_enabled() -> bool {
    true
}
