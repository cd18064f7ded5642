//! Prometheus instruments
//!
//! Registered on a crate-local registry; hosts that want exposition can
//! gather from `REGISTRY` alongside their own.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry};

lazy_static! {
    /// Crate-local Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Inbound federation requests by surface and response status
    pub static ref FEDERATION_REQUESTS_TOTAL: IntCounterVec = {
        let counter = IntCounterVec::new(
            Opts::new(
                "fedistry_federation_requests_total",
                "Total number of inbound federation requests",
            ),
            &["surface", "status"],
        )
        .expect("metric can be created");
        REGISTRY
            .register(Box::new(counter.clone()))
            .expect("metric can be registered");
        counter
    };

    /// Outbound activity deliveries by outcome
    pub static ref OUTBOUND_DELIVERIES_TOTAL: IntCounterVec = {
        let counter = IntCounterVec::new(
            Opts::new(
                "fedistry_outbound_deliveries_total",
                "Total number of outbound activity deliveries",
            ),
            &["outcome"],
        )
        .expect("metric can be created");
        REGISTRY
            .register(Box::new(counter.clone()))
            .expect("metric can be registered");
        counter
    };

    /// Outbound delivery duration in seconds
    pub static ref DELIVERY_DURATION_SECONDS: Histogram = {
        let histogram = Histogram::with_opts(
            HistogramOpts::new(
                "fedistry_delivery_duration_seconds",
                "Outbound delivery duration in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )
        .expect("metric can be created");
        REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("metric can be registered");
        histogram
    };
}
