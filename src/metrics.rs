use prometheus::{register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};
use std::sync::LazyLock;

pub static ORDERS_CREATED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "checkout_orders_created_total",
        "Orders created",
        &["result"]
    )
    .unwrap()
});

pub static PAYMENTS_INITIATED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "checkout_payments_initiated_total",
        "Payment initiations",
        &["result"]
    )
    .unwrap()
});

pub static CALLBACKS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "checkout_callbacks_total",
        "Payment callbacks by verification outcome",
        &["outcome"]
    )
    .unwrap()
});

pub static NOTIFICATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "checkout_notifications_total",
        "Order notifications",
        &["result"]
    )
    .unwrap()
});

pub static ORDERS_SWEPT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "checkout_orders_swept_total",
        "Expired orders reclaimed by the sweeper",
        &["kind"]
    )
    .unwrap()
});

pub fn metrics_output() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
