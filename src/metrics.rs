//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Activity Metrics
    pub static ref ACTIVITIES_DISPATCHED: IntCounterVec = IntCounterVec::new(
        Opts::new("agora_activities_dispatched_total", "Total number of dispatched activities"),
        &["verb", "origin", "outcome"]
    ).expect("metric can be created");
    pub static ref ACTIVITIES_REJECTED: IntCounterVec = IntCounterVec::new(
        Opts::new("agora_activities_rejected_total", "Activities rejected before dispatch"),
        &["reason"]
    ).expect("metric can be created");

    // Federation Metrics
    pub static ref OUTBOX_DELIVERIES: IntCounterVec = IntCounterVec::new(
        Opts::new("agora_outbox_deliveries_total", "Outbox delivery attempts by result"),
        &["status"]
    ).expect("metric can be created");
    pub static ref INBOX_PROCESSED: IntCounterVec = IntCounterVec::new(
        Opts::new("agora_inbox_processed_total", "Inbox items processed by result"),
        &["status"]
    ).expect("metric can be created");
    pub static ref QUEUE_DEPTH: IntGaugeVec = IntGaugeVec::new(
        Opts::new("agora_queue_depth", "Items waiting in a federation queue"),
        &["queue"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "agora_federation_request_duration_seconds",
            "Federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["direction"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("agora_errors_total", "Total number of errors returned to callers"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(ACTIVITIES_DISPATCHED.clone()))
        .expect("ACTIVITIES_DISPATCHED can be registered");
    REGISTRY
        .register(Box::new(ACTIVITIES_REJECTED.clone()))
        .expect("ACTIVITIES_REJECTED can be registered");
    REGISTRY
        .register(Box::new(OUTBOX_DELIVERIES.clone()))
        .expect("OUTBOX_DELIVERIES can be registered");
    REGISTRY
        .register(Box::new(INBOX_PROCESSED.clone()))
        .expect("INBOX_PROCESSED can be registered");
    REGISTRY
        .register(Box::new(QUEUE_DEPTH.clone()))
        .expect("QUEUE_DEPTH can be registered");
    REGISTRY
        .register(Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone()))
        .expect("FEDERATION_REQUEST_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
