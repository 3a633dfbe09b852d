mod common;

use std::collections::HashMap;

use common::make_pod;
use k8s_openapi::api::core::v1::Pod;
use store_operator::cluster::Replicas;
use store_operator::config::OperatorConfig;
use store_operator::crd::{StorePhase, StoreStatus};
use store_operator::error::Requeue;
use store_operator::reconciler::{
    DriftProbe, drift_reasons, helm_values, pods_all_ready, store_urls,
};
use store_operator::status::{append_activity, now, upsert_condition};

// ══════════════════════════════════════════════════════════════════
// Operator integration tests (no cluster required)
//
// Exercises the provisioning decision pipeline: readiness gates over
// pod sets, URL derivation, status construction, drift detection and
// the retry policy boundaries.
// ══════════════════════════════════════════════════════════════════

/// Run the three readiness gates in order over per-component pod sets,
/// building the status a real handler would, and return the final
/// status plus the first blocking reason (if any).
fn simulate_readiness_gates(
    pods_by_component: &HashMap<&str, Vec<Pod>>,
    domain_suffix: &str,
) -> (StoreStatus, Option<String>) {
    let mut status = StoreStatus {
        phase: StorePhase::Provisioning,
        ..Default::default()
    };
    upsert_condition(
        &mut status.conditions,
        "NamespaceReady",
        "True",
        "Created",
        "Namespace store-demo exists",
    );
    upsert_condition(
        &mut status.conditions,
        "HelmInstalled",
        "True",
        "Installed",
        "Helm chart installed successfully",
    );

    let gates = [
        ("postgres", "DatabaseReady", "PostgreSQL"),
        ("medusa-backend", "BackendReady", "Medusa backend"),
        ("storefront", "StorefrontReady", "Storefront"),
    ];
    for (component, condition, display) in gates {
        let empty = Vec::new();
        let pods = pods_by_component.get(component).unwrap_or(&empty);
        let (ready, reason) = pods_all_ready(pods);
        if !ready {
            upsert_condition(&mut status.conditions, condition, "False", "NotReady", &reason);
            return (status, Some(format!("{display} not ready: {reason}")));
        }
        upsert_condition(
            &mut status.conditions,
            condition,
            "True",
            "Running",
            &format!("{display} is running"),
        );
    }

    let (url, admin_url) = store_urls("demo", domain_suffix);
    status.phase = StorePhase::Ready;
    status.url = Some(url.clone());
    status.admin_url = Some(admin_url);
    status.message = "Store is ready".to_string();
    status.retry_count = 0;
    status.last_updated = Some(now());
    append_activity(
        &mut status.activity_log,
        "STORE_READY",
        &format!("Store ready at {url}"),
    );
    (status, None)
}

fn all_components_running() -> HashMap<&'static str, Vec<Pod>> {
    HashMap::from([
        ("postgres", vec![make_pod("postgres-0", "Running", true, None)]),
        (
            "medusa-backend",
            vec![make_pod("medusa-backend-7d9", "Running", true, None)],
        ),
        (
            "storefront",
            vec![make_pod("storefront-5c4", "Running", true, None)],
        ),
    ])
}

/* ============================= HAPPY PATH ============================= */

#[test]
fn test_happy_path_reaches_ready_with_urls() {
    let (status, blocked) = simulate_readiness_gates(&all_components_running(), "local.urumi");

    assert_eq!(blocked, None);
    assert_eq!(status.phase, StorePhase::Ready);
    assert_eq!(status.url.as_deref(), Some("http://demo.local.urumi"));
    assert_eq!(
        status.admin_url.as_deref(),
        Some("http://demo.local.urumi/app")
    );
    assert_eq!(status.message, "Store is ready");
    assert_eq!(status.retry_count, 0);

    for condition in [
        "NamespaceReady",
        "HelmInstalled",
        "DatabaseReady",
        "BackendReady",
        "StorefrontReady",
    ] {
        let found = status
            .conditions
            .iter()
            .find(|c| c.type_ == condition)
            .unwrap_or_else(|| panic!("{condition} should be present"));
        assert_eq!(found.status, "True", "{condition} should be True");
    }
}

#[test]
fn test_ready_implies_urls_derivable_from_name_and_suffix() {
    let (status, _) = simulate_readiness_gates(&all_components_running(), "shops.example.com");
    assert_eq!(status.url.as_deref(), Some("http://demo.shops.example.com"));
    assert_eq!(
        status.admin_url.as_deref(),
        Some("http://demo.shops.example.com/app")
    );
}

#[test]
fn test_condition_types_unique_after_full_run() {
    let (status, _) = simulate_readiness_gates(&all_components_running(), "local.urumi");
    let mut types: Vec<_> = status.conditions.iter().map(|c| c.type_.clone()).collect();
    let total = types.len();
    types.sort();
    types.dedup();
    assert_eq!(types.len(), total, "condition types must be unique");
}

#[test]
fn test_rerunning_gates_is_idempotent() {
    let pods = all_components_running();
    let (first, _) = simulate_readiness_gates(&pods, "local.urumi");
    let (second, _) = simulate_readiness_gates(&pods, "local.urumi");

    assert_eq!(first.phase, second.phase);
    assert_eq!(first.url, second.url);
    assert_eq!(first.conditions.len(), second.conditions.len());
}

/* ============================= GATE ORDER & BLOCKING ============================= */

#[test]
fn test_database_gate_blocks_first() {
    let mut pods = all_components_running();
    pods.insert("postgres", vec![make_pod("postgres-0", "Pending", false, None)]);
    // Backend is also broken, but the database gate is checked first.
    pods.insert(
        "medusa-backend",
        vec![make_pod("medusa-backend-7d9", "Pending", false, None)],
    );

    let (status, blocked) = simulate_readiness_gates(&pods, "local.urumi");
    assert_eq!(
        blocked.as_deref(),
        Some("PostgreSQL not ready: Pod postgres-0 is Pending")
    );
    assert_eq!(status.phase, StorePhase::Provisioning);
    assert!(status.url.is_none());

    let db = status
        .conditions
        .iter()
        .find(|c| c.type_ == "DatabaseReady")
        .expect("DatabaseReady condition");
    assert_eq!(db.status, "False");
    assert_eq!(db.reason, "NotReady");
    // The backend gate never ran.
    assert!(!status.conditions.iter().any(|c| c.type_ == "BackendReady"));
}

#[test]
fn test_crashloop_reason_surfaces_in_condition() {
    let mut pods = all_components_running();
    pods.insert(
        "medusa-backend",
        vec![make_pod(
            "medusa-backend-7d9",
            "Running",
            false,
            Some("CrashLoopBackOff"),
        )],
    );

    let (status, blocked) = simulate_readiness_gates(&pods, "local.urumi");
    assert_eq!(
        blocked.as_deref(),
        Some("Medusa backend not ready: Pod medusa-backend-7d9: CrashLoopBackOff")
    );
    let backend = status
        .conditions
        .iter()
        .find(|c| c.type_ == "BackendReady")
        .expect("BackendReady condition");
    assert!(backend.message.contains("CrashLoopBackOff"));
}

#[test]
fn test_missing_pods_block_storefront_gate() {
    let mut pods = all_components_running();
    pods.remove("storefront");

    let (_, blocked) = simulate_readiness_gates(&pods, "local.urumi");
    assert_eq!(
        blocked.as_deref(),
        Some("Storefront not ready: No pods found")
    );
}

/* ============================= RETRY POLICY ============================= */

#[test]
fn test_not_ready_requeue_does_not_consume_budget() {
    let rq = Requeue::not_ready("Storefront not ready: No pods found");
    assert_eq!(rq.delay.as_secs(), 15);
    assert!(!rq.counted);
}

#[test]
fn test_infra_requeue_consumes_budget_with_30s_delay() {
    let rq = Requeue::after_error("helm install failed (rc=1)");
    assert_eq!(rq.delay.as_secs(), 30);
    assert!(rq.counted);
}

#[test]
fn test_retry_budget_boundary() {
    // Mirrors the handler's decision: retry while the incremented count
    // stays under 3; the third failure leaves the store Failed.
    const MAX_RETRIES: u32 = 3;
    let retries_scheduled: Vec<bool> = (0u32..4)
        .map(|previous| previous + 1 < MAX_RETRIES)
        .collect();
    assert_eq!(retries_scheduled, vec![true, true, false, false]);
}

/* ============================= DRIFT ============================= */

fn healthy_probe() -> DriftProbe {
    DriftProbe {
        backend_deployment: true,
        storefront_deployment: true,
        postgres_statefulset: true,
        backend_service: true,
        storefront_service: true,
        postgres_service: true,
        backend_replicas: Some(Replicas {
            desired: 1,
            ready: 1,
        }),
    }
}

#[test]
fn test_externally_deleted_service_detected_and_heals() {
    // A user deletes the backend Service out from under the store.
    let drifted = DriftProbe {
        backend_service: false,
        ..healthy_probe()
    };
    let reasons = drift_reasons(&drifted);
    assert_eq!(reasons, vec!["Service 'medusa-backend' missing"]);

    // After the self-heal upgrade restores it, the next probe is clean.
    let healed = healthy_probe();
    assert!(drift_reasons(&healed).is_empty());
}

#[test]
fn test_drift_reasons_join_for_condition_message() {
    let drifted = DriftProbe {
        backend_deployment: false,
        backend_service: false,
        ..healthy_probe()
    };
    let joined = drift_reasons(&drifted).join("; ");
    assert_eq!(
        joined,
        "Deployment 'medusa-backend' missing; Service 'medusa-backend' missing"
    );
}

/* ============================= HELM VALUES ============================= */

#[test]
fn test_helm_values_wire_ingress_host_from_spec_suffix() {
    let config = OperatorConfig::default();
    let values = helm_values(&config, "demo", "local.urumi");
    assert_eq!(
        values.get("ingress.host").map(String::as_str),
        Some("demo.local.urumi")
    );
    assert_eq!(values.get("storeName").map(String::as_str), Some("demo"));
}
