//! Prometheus metrics for queue operations.

use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, Opts, Registry, TextEncoder};

/// Metric name prefix for all Pezzottify metrics
const PREFIX: &str = "pezzottify";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref JOBS_PUSHED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_pushed_total"), "Jobs inserted into a queue"),
        &["queue"]
    ).expect("Failed to create jobs_pushed_total metric");

    pub static ref JOBS_RESERVED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_reserved_total"), "Jobs reserved by a pop"),
        &["queue"]
    ).expect("Failed to create jobs_reserved_total metric");

    pub static ref JOBS_RECLAIMED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_jobs_reclaimed_total"),
            "Jobs reserved again after their previous reservation expired"
        ),
        &["queue"]
    ).expect("Failed to create jobs_reclaimed_total metric");

    pub static ref JOBS_RELEASED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_released_total"), "Jobs released back onto a queue"),
        &["queue"]
    ).expect("Failed to create jobs_released_total metric");

    pub static ref JOBS_DELETED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_deleted_total"), "Jobs deleted from a queue"),
        &["queue"]
    ).expect("Failed to create jobs_deleted_total metric");

    pub static ref JOBS_LOST_RESERVATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_jobs_lost_reservations_total"),
            "Release or delete attempts on a reservation that was no longer current"
        ),
        &["queue"]
    ).expect("Failed to create jobs_lost_reservations_total metric");
}

/// Registers all metrics with [`REGISTRY`].
pub fn init_metrics() {
    // Errors mean already registered
    let _ = REGISTRY.register(Box::new(JOBS_PUSHED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_RESERVED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_RECLAIMED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_RELEASED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_DELETED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_LOST_RESERVATIONS_TOTAL.clone()));

    tracing::debug!("Queue metrics registered");
}

pub fn record_pushed(queue: &str, count: usize) {
    JOBS_PUSHED_TOTAL
        .with_label_values(&[queue])
        .inc_by(count as f64);
}

pub fn record_reserved(queue: &str, reclaimed: bool) {
    JOBS_RESERVED_TOTAL.with_label_values(&[queue]).inc();
    if reclaimed {
        JOBS_RECLAIMED_TOTAL.with_label_values(&[queue]).inc();
    }
}

pub fn record_released(queue: &str) {
    JOBS_RELEASED_TOTAL.with_label_values(&[queue]).inc();
}

pub fn record_deleted(queue: &str) {
    JOBS_DELETED_TOTAL.with_label_values(&[queue]).inc();
}

pub fn record_lost_reservation(queue: &str) {
    JOBS_LOST_RESERVATIONS_TOTAL
        .with_label_values(&[queue])
        .inc();
}

/// Renders the registered metrics in the Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_counters_show_up_in_gathered_output() {
        init_metrics();
        record_pushed("metrics-test-queue", 3);
        record_reserved("metrics-test-queue", true);

        let output = gather_metrics().unwrap();
        assert!(output.contains("pezzottify_jobs_pushed_total"));
        assert!(output.contains("pezzottify_jobs_reclaimed_total"));
        assert!(output.contains("metrics-test-queue"));
    }

    #[test]
    fn test_reserved_without_reclaim_leaves_reclaimed_untouched() {
        let queue = "metrics-no-reclaim";
        record_reserved(queue, false);
        assert_eq!(JOBS_RESERVED_TOTAL.with_label_values(&[queue]).get(), 1.0);
        assert_eq!(JOBS_RECLAIMED_TOTAL.with_label_values(&[queue]).get(), 0.0);
    }
}
