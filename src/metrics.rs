use std::sync::LazyLock;

use prometheus::{Histogram, IntCounter, IntGaugeVec, Registry};

/* ============================= REGISTRY ============================= */

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static RECONCILE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "store_reconcile_total",
        "Total store reconciliation handler runs",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static RECONCILE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "store_reconcile_errors_total",
        "Total store reconciliation handler errors",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static TRANSIENT_REQUEUES: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "store_transient_requeues_total",
        "Total transient-failure requeues scheduled by the worker pool",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static DRIFT_DETECTED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "store_drift_detected_total",
        "Total drift detections across all stores",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static STORES_BY_PHASE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new("store_phase_count", "Stores per lifecycle phase"),
        &["phase"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

pub static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "store_reconcile_duration_seconds",
        "Duration of each reconciliation handler run in seconds",
    ))
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

/// Force-init all metrics so they appear on /metrics before first use.
pub fn force_init() {
    LazyLock::force(&RECONCILE_TOTAL);
    LazyLock::force(&RECONCILE_ERRORS);
    LazyLock::force(&TRANSIENT_REQUEUES);
    LazyLock::force(&DRIFT_DETECTED_TOTAL);
    LazyLock::force(&STORES_BY_PHASE);
    LazyLock::force(&RECONCILE_DURATION);
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registered() {
        force_init();
        let families = REGISTRY.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        for expected in [
            "store_reconcile_total",
            "store_reconcile_errors_total",
            "store_transient_requeues_total",
            "store_drift_detected_total",
            "store_phase_count",
            "store_reconcile_duration_seconds",
        ] {
            assert!(names.contains(&expected), "{expected} should be registered");
        }
    }

    #[test]
    fn test_phase_gauge_labels() {
        force_init();
        STORES_BY_PHASE.with_label_values(&["Ready"]).set(2);
        assert_eq!(STORES_BY_PHASE.with_label_values(&["Ready"]).get(), 2);
    }
}
