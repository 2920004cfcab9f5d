use lazy_static::lazy_static;
use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, Encoder, GaugeVec,
    HistogramVec, IntCounterVec, TextEncoder,
};
use std::collections::BTreeMap;
use std::sync::Mutex;

lazy_static! {
    pub static ref ACTIVE_CONNECTIONS: GaugeVec = register_gauge_vec!(
        "tlsgate_active_connections",
        "Current number of active connections per server name",
        &["server_name"]
    )
    .unwrap();

    pub static ref TOTAL_CONNECTIONS: IntCounterVec = register_int_counter_vec!(
        "tlsgate_connections_total",
        "Total number of connections dispatched",
        &["server_name"]
    )
    .unwrap();

    // direction: "client_in" = client -> upstream, "client_out" = upstream -> client
    pub static ref TRAFFIC_BYTES: IntCounterVec = register_int_counter_vec!(
        "tlsgate_traffic_bytes_total",
        "Total bytes transferred",
        &["server_name", "direction"]
    )
    .unwrap();

    pub static ref CONNECTION_DURATION: HistogramVec = register_histogram_vec!(
        "tlsgate_connection_duration_seconds",
        "Duration of connections in seconds",
        &["server_name"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
    )
    .unwrap();
}

pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("metrics encoding error: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Proxy-scoped counter table keyed by stable event strings. The console
/// page renders it; tests assert on it.
#[derive(Debug, Default)]
pub struct Events {
    counts: Mutex<BTreeMap<String, u64>>,
}

impl Events {
    pub fn record(&self, tag: impl Into<String>) {
        let mut counts = self.counts.lock().unwrap();
        *counts.entry(tag.into()).or_insert(0) += 1;
    }

    pub fn count(&self, tag: &str) -> u64 {
        self.counts.lock().unwrap().get(tag).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<(String, u64)> {
        self.counts
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_count_and_snapshot() {
        let events = Events::default();
        events.record("no SNI");
        events.record("no SNI");
        events.record("dial error");
        assert_eq!(events.count("no SNI"), 2);
        assert_eq!(events.count("missing"), 0);
        let snap = events.snapshot();
        assert_eq!(snap.len(), 2);
    }
}
