use actix_web::{http::header, HttpResponse};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};

pub static ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "relay_active_connections",
        "Live WebSocket connections held by this process",
    )
    .expect("failed to create relay_active_connections");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register relay_active_connections");
    gauge
});

pub static FRAMES_DELIVERED: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "relay_frames_delivered_total",
            "Server frames queued to local connections",
        ),
        &["kind", "source"],
    )
    .expect("failed to create relay_frames_delivered_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register relay_frames_delivered_total");
    counter
});

pub static BROKER_PUBLISH_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "relay_broker_publish_failures_total",
        "Broker publishes that failed and were dropped",
    )
    .expect("failed to create relay_broker_publish_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register relay_broker_publish_failures_total");
    counter
});

pub static BROKER_SELF_ECHO_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "relay_broker_self_echo_dropped_total",
        "Inbound broker messages dropped because this process published them",
    )
    .expect("failed to create relay_broker_self_echo_dropped_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register relay_broker_self_echo_dropped_total");
    counter
});

pub static BROKER_TOPICS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "relay_broker_topics",
        "Fleet-level topic subscriptions held by this process",
    )
    .expect("failed to create relay_broker_topics");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register relay_broker_topics");
    gauge
});

pub static PRESENCE_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "relay_presence_transitions_total",
            "Online/offline presence broadcasts emitted",
        ),
        &["transition"],
    )
    .expect("failed to create relay_presence_transitions_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register relay_presence_transitions_total");
    counter
});

pub async fn metrics_handler() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, encoder.format_type()))
        .body(buffer)
}
