//! Prometheus metrics
//!
//! SFU gauges are refreshed from [`Sfu::collect_stats`] on every scrape, so
//! the endpoint always reflects the live registry.

use axum::{extract::State, http::header, response::IntoResponse, routing::get, Router};
use minisfu_sfu::{Sfu, SfuStats};
use prometheus::{
    register_int_counter_vec_with_registry, register_int_gauge_with_registry, Encoder,
    IntCounterVec, IntGauge, Registry, TextEncoder,
};
use std::sync::{Arc, LazyLock};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Signaling requests by method and outcome
pub static SIGNALING_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "minisfu_signaling_requests_total",
        "Signaling requests handled, by method and outcome",
        &["method", "outcome"],
        REGISTRY.clone()
    )
    .expect("Failed to register SIGNALING_REQUESTS")
});

/// Open signaling connections
pub static SIGNALING_CONNECTIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "minisfu_signaling_connections",
        "Current number of open signaling connections",
        REGISTRY.clone()
    )
    .expect("Failed to register SIGNALING_CONNECTIONS")
});

/// SFU state, mirrored from the registry at scrape time
pub mod sfu {
    use super::{register_int_gauge_with_registry, IntGauge, LazyLock, REGISTRY};

    pub static SESSIONS: LazyLock<IntGauge> = LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "minisfu_sessions",
            "Current number of sessions",
            REGISTRY.clone()
        )
        .expect("Failed to register SESSIONS")
    });

    pub static PEERS: LazyLock<IntGauge> = LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "minisfu_peers",
            "Current number of peers across all sessions",
            REGISTRY.clone()
        )
        .expect("Failed to register PEERS")
    });

    pub static AUDIO_TRACKS: LazyLock<IntGauge> = LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "minisfu_audio_tracks",
            "Current number of published audio tracks",
            REGISTRY.clone()
        )
        .expect("Failed to register AUDIO_TRACKS")
    });

    pub static VIDEO_TRACKS: LazyLock<IntGauge> = LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "minisfu_video_tracks",
            "Current number of published video tracks",
            REGISTRY.clone()
        )
        .expect("Failed to register VIDEO_TRACKS")
    });

    pub static PACKETS_RELAYED: LazyLock<IntGauge> = LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "minisfu_packets_relayed",
            "Packets delivered to subscribers by live routers",
            REGISTRY.clone()
        )
        .expect("Failed to register PACKETS_RELAYED")
    });

    pub static BYTES_RELAYED: LazyLock<IntGauge> = LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "minisfu_bytes_relayed",
            "Bytes received from publishers by live routers",
            REGISTRY.clone()
        )
        .expect("Failed to register BYTES_RELAYED")
    });

    pub static PACKETS_DROPPED: LazyLock<IntGauge> = LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "minisfu_packets_dropped",
            "Packets dropped by slow subscribers of live routers",
            REGISTRY.clone()
        )
        .expect("Failed to register PACKETS_DROPPED")
    });
}

fn to_gauge(value: impl TryInto<i64>) -> i64 {
    value.try_into().unwrap_or(i64::MAX)
}

/// Copy a stats snapshot into the SFU gauges
pub fn update_sfu_metrics(stats: &SfuStats) {
    sfu::SESSIONS.set(to_gauge(stats.active_sessions));
    sfu::PEERS.set(to_gauge(stats.total_peers));
    sfu::AUDIO_TRACKS.set(to_gauge(stats.total_audio_tracks));
    sfu::VIDEO_TRACKS.set(to_gauge(stats.total_video_tracks));
    sfu::PACKETS_RELAYED.set(to_gauge(stats.total_packets_relayed));
    sfu::BYTES_RELAYED.set(to_gauge(stats.total_bytes_relayed));
    sfu::PACKETS_DROPPED.set(to_gauge(stats.total_packets_dropped));
}

pub fn record_request(method: &str, outcome: &str) {
    SIGNALING_REQUESTS.with_label_values(&[method, outcome]).inc();
}

/// Force registration so every metric shows up before its first update
pub fn init() {
    LazyLock::force(&SIGNALING_REQUESTS);
    LazyLock::force(&SIGNALING_CONNECTIONS);
    update_sfu_metrics(&SfuStats::default());
}

/// Render all metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

async fn metrics_handler(State(sfu): State<Arc<Sfu>>) -> impl IntoResponse {
    update_sfu_metrics(&sfu.collect_stats());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        gather_metrics(),
    )
}

/// Router serving `/metrics`
pub fn router(sfu: Arc<Sfu>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(sfu)
}
