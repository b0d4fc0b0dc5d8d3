use std::sync::LazyLock;

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry,
};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static OUTGOING_REQUESTS_COUNTER: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "banipd_outgoing_requests",
        "Requests sent to remote firewall APIs",
        &["destination", "path"],
        &REGISTRY
    )
    .expect("metric can be registered")
});

pub static REQUESTS_RECEIVED_COUNTER: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "banipd_requests_received",
        "Decoded requests read from the queue",
        &["kind"],
        &REGISTRY
    )
    .expect("metric can be registered")
});

pub static MALFORMED_REQUESTS_COUNTER: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter_with_registry!(
        "banipd_malformed_requests",
        "Queue messages dropped because they could not be decoded",
        &REGISTRY
    )
    .expect("metric can be registered")
});

pub static BANS_APPLIED_COUNTER: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter_with_registry!(
        "banipd_bans_applied",
        "Firewall rules added",
        &REGISTRY
    )
    .expect("metric can be registered")
});

pub static BANS_LIFTED_COUNTER: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "banipd_bans_lifted",
        "Firewall rules removed",
        &["cause"],
        &REGISTRY
    )
    .expect("metric can be registered")
});

pub static BACKEND_ERRORS_COUNTER: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "banipd_backend_errors",
        "Firewall operations that failed after all retries",
        &["operation"],
        &REGISTRY
    )
    .expect("metric can be registered")
});

pub static ACTIVE_BANS: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge_with_registry!("banipd_active_bans", "Entries in the ban table", &REGISTRY)
        .expect("metric can be registered")
});
