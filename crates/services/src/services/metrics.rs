use lazy_static::lazy_static;
use prometheus::{
    Histogram, IntCounter, IntCounterVec, TextEncoder, register_histogram,
    register_int_counter, register_int_counter_vec,
};

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";
pub const STATUS_NOOP: &str = "noop";

lazy_static! {
    pub static ref SYNC_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gitsync_sync_total",
        "Sync attempts, labeled success/error/noop",
        &["status"]
    )
    .unwrap();
    pub static ref FETCH_TOTAL: IntCounter = register_int_counter!(
        "gitsync_fetch_total",
        "Fetches issued against the upstream repository"
    )
    .unwrap();
    pub static ref ASKPASS_TOTAL: IntCounter = register_int_counter!(
        "gitsync_askpass_calls_total",
        "Calls made to the askpass URL"
    )
    .unwrap();
    pub static ref SYNC_DURATION: Histogram = register_histogram!(
        "gitsync_sync_duration_seconds",
        "Wall time of sync attempts"
    )
    .unwrap();
}

/// Render the default registry in Prometheus text format.
pub fn render() -> String {
    let metric_families = prometheus::gather();
    TextEncoder::new()
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_counters() {
        SYNC_TOTAL.with_label_values(&[STATUS_SUCCESS]).inc();
        FETCH_TOTAL.inc();
        let text = render();
        assert!(text.contains("gitsync_sync_total"));
        assert!(text.contains("gitsync_fetch_total"));
    }
}
