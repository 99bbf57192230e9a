use axum::http::StatusCode;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static MESSAGES_ADDED: OnceLock<IntCounterVec> = OnceLock::new();
static SEARCHES: OnceLock<IntCounterVec> = OnceLock::new();
static ACTIVE_SESSIONS: OnceLock<IntGauge> = OnceLock::new();
static COMPRESSION_TIME: OnceLock<Histogram> = OnceLock::new();
static SEARCH_TIME: OnceLock<Histogram> = OnceLock::new();

pub fn init_metrics() {
    let messages_added = MESSAGES_ADDED.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("messages_added_total", "Messages ingested per role"),
            &["role"],
        )
        .unwrap()
    });

    let searches = SEARCHES.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("searches_total", "Search requests per path taken"),
            &["search_type"],
        )
        .unwrap()
    });

    let active_sessions = ACTIVE_SESSIONS.get_or_init(|| {
        IntGauge::new("active_sessions", "Sessions with an active working set").unwrap()
    });

    let compression_time = COMPRESSION_TIME.get_or_init(|| {
        Histogram::with_opts(prometheus::HistogramOpts::new(
            "compression_seconds",
            "Time spent in a compression run",
        ))
        .unwrap()
    });

    let search_time = SEARCH_TIME.get_or_init(|| {
        Histogram::with_opts(prometheus::HistogramOpts::new(
            "search_seconds",
            "Time spent answering a search request",
        ))
        .unwrap()
    });

    REGISTRY.register(Box::new(messages_added.clone())).ok();
    REGISTRY.register(Box::new(searches.clone())).ok();
    REGISTRY.register(Box::new(active_sessions.clone())).ok();
    REGISTRY.register(Box::new(compression_time.clone())).ok();
    REGISTRY.register(Box::new(search_time.clone())).ok();
}

pub fn inc_messages_added(role: &str) {
    if let Some(counter) = MESSAGES_ADDED.get() {
        counter.with_label_values(&[role]).inc();
    }
}

pub fn inc_search(search_type: &str) {
    if let Some(counter) = SEARCHES.get() {
        counter.with_label_values(&[search_type]).inc();
    }
}

pub fn set_active_sessions(count: usize) {
    if let Some(gauge) = ACTIVE_SESSIONS.get() {
        gauge.set(count as i64);
    }
}

pub fn observe_compression(duration: f64) {
    if let Some(histogram) = COMPRESSION_TIME.get() {
        histogram.observe(duration);
    }
}

pub fn observe_search(duration: f64) {
    if let Some(histogram) = SEARCH_TIME.get() {
        histogram.observe(duration);
    }
}

pub async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
}
