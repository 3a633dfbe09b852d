use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{error, info, warn};

use crate::cluster::{ClusterClient, Replicas};
use crate::config::OperatorConfig;
use crate::crd::{Engine, Store, StorePhase, StoreStatus};
use crate::error::{Error, Requeue};
use crate::events::EventPublisher;
use crate::helm::Helm;
use crate::metrics;
use crate::quota::{self, QuotaLimits};
use crate::status::{append_activity, now, truncate, upsert_condition};

/// Counted provisioning attempts before a store stays Failed.
const MAX_RETRIES: u32 = 3;

/* ============================= CONTEXT ============================= */

/// Shared state handed to every handler, initialized once at startup.
pub struct Context {
    pub cluster: ClusterClient,
    pub helm: Helm,
    pub publisher: EventPublisher,
    pub config: OperatorConfig,
}

impl Context {
    fn quota_limits(&self) -> QuotaLimits {
        QuotaLimits {
            per_owner: self.config.max_stores_per_owner,
            global: self.config.max_stores_global,
        }
    }
}

/* ============================= PURE HELPERS ============================= */

/// Storefront and admin URLs derived from the store name and DNS suffix.
pub fn store_urls(name: &str, domain_suffix: &str) -> (String, String) {
    let url = format!("http://{name}.{domain_suffix}");
    let admin_url = format!("{url}/app");
    (url, admin_url)
}

/// Chart values for install and upgrade.
pub fn helm_values(
    config: &OperatorConfig,
    name: &str,
    domain_suffix: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("storeName".to_string(), name.to_string()),
        ("medusa.image".to_string(), config.medusa_image.clone()),
        (
            "storefront.image".to_string(),
            config.storefront_image.clone(),
        ),
        (
            "ingress.host".to_string(),
            format!("{name}.{domain_suffix}"),
        ),
        (
            "ingress.className".to_string(),
            config.ingress_class.clone(),
        ),
        (
            "postgres.storageClass".to_string(),
            config.storage_class.clone(),
        ),
    ])
}

/// Whether every pod in the slice is Running with all containers ready.
/// Returns the first blocking reason otherwise; a container stuck in a
/// Waiting state surfaces its reason (e.g. CrashLoopBackOff).
pub fn pods_all_ready(pods: &[Pod]) -> (bool, String) {
    if pods.is_empty() {
        return (false, "No pods found".to_string());
    }
    for pod in pods {
        let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown");
        if phase != "Running" {
            return (false, format!("Pod {pod_name} is {phase}"));
        }
        let statuses = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref());
        for cs in statuses.into_iter().flatten() {
            if !cs.ready {
                if let Some(reason) = cs
                    .state
                    .as_ref()
                    .and_then(|s| s.waiting.as_ref())
                    .and_then(|w| w.reason.as_deref())
                {
                    return (false, format!("Pod {pod_name}: {reason}"));
                }
                return (false, format!("Pod {pod_name} container not ready"));
            }
        }
    }
    (true, "All pods running and ready".to_string())
}

/* ============================= DRIFT ============================= */

/// Observed existence of the critical per-store resources.
#[derive(Debug, Default)]
pub struct DriftProbe {
    pub backend_deployment: bool,
    pub storefront_deployment: bool,
    pub postgres_statefulset: bool,
    pub backend_service: bool,
    pub storefront_service: bool,
    pub postgres_service: bool,
    pub backend_replicas: Option<Replicas>,
}

/// Drift reasons for a probe; empty means no drift. The replica check
/// only runs when every resource exists, and only covers the backend.
pub fn drift_reasons(probe: &DriftProbe) -> Vec<String> {
    let mut reasons = Vec::new();
    if !probe.backend_deployment {
        reasons.push("Deployment 'medusa-backend' missing".to_string());
    }
    if !probe.storefront_deployment {
        reasons.push("Deployment 'storefront' missing".to_string());
    }
    if !probe.postgres_statefulset {
        reasons.push("StatefulSet 'postgres' missing".to_string());
    }
    if !probe.backend_service {
        reasons.push("Service 'medusa-backend' missing".to_string());
    }
    if !probe.storefront_service {
        reasons.push("Service 'storefront' missing".to_string());
    }
    if !probe.postgres_service {
        reasons.push("Service 'postgres' missing".to_string());
    }
    if reasons.is_empty() {
        if let Some(replicas) = probe.backend_replicas {
            if replicas.desired != replicas.ready {
                reasons.push(format!(
                    "medusa-backend: {}/{} replicas ready",
                    replicas.ready, replicas.desired
                ));
            }
        }
    }
    reasons
}

async fn probe_drift(ctx: &Context, namespace: &str) -> Result<DriftProbe, Error> {
    let backend = ctx
        .cluster
        .deployment_replicas(namespace, "medusa-backend")
        .await?;
    let storefront = ctx
        .cluster
        .deployment_replicas(namespace, "storefront")
        .await?;
    Ok(DriftProbe {
        backend_deployment: backend.is_some(),
        storefront_deployment: storefront.is_some(),
        postgres_statefulset: ctx.cluster.statefulset_exists(namespace, "postgres").await?,
        backend_service: ctx
            .cluster
            .service_exists(namespace, "medusa-backend")
            .await?,
        storefront_service: ctx.cluster.service_exists(namespace, "storefront").await?,
        postgres_service: ctx.cluster.service_exists(namespace, "postgres").await?,
        backend_replicas: backend,
    })
}

/* ============================= PROVISION ============================= */

enum StepFailure {
    /// Pods still coming up: surfaced as a 15s uncounted requeue.
    NotReady(String),
    /// Kubernetes or installer failure: counted against the budget.
    Infra(Error),
}

async fn patch_status(ctx: &Context, name: &str, status: &StoreStatus) -> Result<(), Requeue> {
    ctx.cluster
        .patch_store_status(name, status)
        .await
        .map_err(|e| Requeue::uncounted(format!("status patch failed: {e}")))
}

/// Reconcile a store toward Ready. Idempotent: every step checks before
/// acting, so redundant events converge to the same state.
pub async fn provision(ctx: &Context, store: &Store) -> Result<(), Requeue> {
    let name = store.name_any();
    let owner = store.spec.owner.clone();
    let domain_suffix = store
        .spec
        .domain_suffix
        .clone()
        .unwrap_or_else(|| ctx.config.domain_suffix.clone());
    let mut status = store.status.clone().unwrap_or_default();
    let current_phase = status.phase;

    // WooCommerce stub: park in ComingSoon, never touch the cluster.
    if store.spec.engine == Engine::Woocommerce {
        upsert_condition(
            &mut status.conditions,
            "EngineReady",
            "False",
            "ComingSoon",
            "WooCommerce engine is coming soon",
        );
        status.phase = StorePhase::ComingSoon;
        status.message =
            "WooCommerce engine is coming soon. Only MedusaJS is currently supported.".to_string();
        status.last_updated = Some(now());
        append_activity(
            &mut status.activity_log,
            "ENGINE_STUB",
            "WooCommerce engine stubbed (coming soon)",
        );
        patch_status(ctx, &name, &status).await?;
        info!(store = %name, "woocommerce_stubbed");
        ctx.publisher
            .publish(
                &name,
                "ENGINE_STUB",
                "WooCommerce coming soon",
                StorePhase::ComingSoon.as_str(),
            )
            .await;
        return Ok(());
    }

    // Quota re-check against racing admissions, skipped once the store
    // is past admission and provisioning is underway.
    if !matches!(
        current_phase,
        StorePhase::Provisioning | StorePhase::Ready
    ) {
        let stores = ctx
            .cluster
            .list_stores()
            .await
            .map_err(|e| Requeue::uncounted(format!("store list failed: {e}")))?;
        if let quota::Verdict::OwnerQuotaExceeded { count, limit, .. } =
            quota::reconcile_verdict(&stores, &owner, ctx.quota_limits())
        {
            upsert_condition(
                &mut status.conditions,
                "QuotaCheck",
                "False",
                "QuotaExceeded",
                &format!("Owner {owner} exceeds max stores ({limit})"),
            );
            status.phase = StorePhase::Failed;
            status.message = format!("Quota exceeded: max {limit} stores per owner");
            status.last_updated = Some(now());
            append_activity(
                &mut status.activity_log,
                "QUOTA_EXCEEDED",
                &format!("Owner {owner} exceeds max stores ({limit})"),
            );
            patch_status(ctx, &name, &status).await?;
            warn!(store = %name, %owner, count, "quota_exceeded");
            ctx.publisher
                .publish(
                    &name,
                    "QUOTA_EXCEEDED",
                    &format!("Quota exceeded for {owner}"),
                    StorePhase::Failed.as_str(),
                )
                .await;
            return Ok(());
        }
    }

    // Drift detection for Ready stores belongs to the timer.
    if current_phase == StorePhase::Ready {
        info!(store = %name, "already_ready_skip_reconcile");
        return Ok(());
    }

    status.phase = StorePhase::Provisioning;
    status.message = "Creating store resources...".to_string();
    if status.created_at.is_none() {
        status.created_at = Some(now());
    }
    status.last_updated = Some(now());
    append_activity(
        &mut status.activity_log,
        "PROVISIONING_START",
        "Store provisioning started",
    );
    ctx.publisher
        .publish(
            &name,
            "PROVISIONING_START",
            "Store provisioning started",
            StorePhase::Provisioning.as_str(),
        )
        .await;

    match provision_steps(ctx, store, &mut status, &domain_suffix).await {
        Ok(()) => {
            patch_status(ctx, &name, &status).await?;
            let url = status.url.clone().unwrap_or_default();
            info!(store = %name, %url, "store_ready");
            ctx.publisher
                .publish(
                    &name,
                    "STORE_READY",
                    &format!("Store ready at {url}"),
                    StorePhase::Ready.as_str(),
                )
                .await;
            Ok(())
        }
        Err(StepFailure::NotReady(reason)) => {
            status.last_updated = Some(now());
            patch_status(ctx, &name, &status).await?;
            info!(store = %name, %reason, "waiting_for_readiness");
            Err(Requeue::not_ready(reason))
        }
        Err(StepFailure::Infra(err)) => {
            let detail = err.to_string();
            let retry_count = status.retry_count + 1;
            upsert_condition(
                &mut status.conditions,
                "Provisioning",
                "False",
                "Error",
                &truncate(&detail, 200),
            );
            status.phase = StorePhase::Failed;
            status.message = format!("Provisioning failed: {}", truncate(&detail, 200));
            status.retry_count = retry_count;
            status.last_updated = Some(now());
            append_activity(
                &mut status.activity_log,
                "PROVISION_FAILED",
                &format!("Attempt {retry_count}: {}", truncate(&detail, 150)),
            );
            patch_status(ctx, &name, &status).await?;
            error!(store = %name, attempt = retry_count, error = %detail, "provision_failed");
            ctx.publisher
                .publish(
                    &name,
                    "PROVISION_FAILED",
                    &format!("Attempt {retry_count}: {}", truncate(&detail, 150)),
                    StorePhase::Failed.as_str(),
                )
                .await;

            if retry_count < MAX_RETRIES {
                Err(Requeue::after_error(format!(
                    "retrying ({retry_count}/{MAX_RETRIES}): {}",
                    truncate(&detail, 150)
                )))
            } else {
                // Retries exhausted: stays Failed until a spec change or
                // manual intervention.
                Ok(())
            }
        }
    }
}

async fn provision_steps(
    ctx: &Context,
    store: &Store,
    status: &mut StoreStatus,
    domain_suffix: &str,
) -> Result<(), StepFailure> {
    let name = store.name_any();
    let namespace = store.namespace_name();
    let release = store.release_name();

    // Step 1/5: namespace
    info!(store = %name, %namespace, "step_ensure_namespace");
    append_activity(
        &mut status.activity_log,
        "NAMESPACE_CREATE",
        &format!("Creating namespace {namespace}"),
    );
    ctx.publisher
        .publish(
            &name,
            "NAMESPACE_CREATE",
            &format!("Creating namespace {namespace}"),
            StorePhase::Provisioning.as_str(),
        )
        .await;
    ctx.cluster
        .ensure_namespace(&namespace, &name, store.spec.engine)
        .await
        .map_err(StepFailure::Infra)?;
    upsert_condition(
        &mut status.conditions,
        "NamespaceReady",
        "True",
        "Created",
        &format!("Namespace {namespace} exists"),
    );
    append_activity(
        &mut status.activity_log,
        "NAMESPACE_READY",
        &format!("Namespace {namespace} ready"),
    );
    ctx.publisher
        .publish(
            &name,
            "NAMESPACE_READY",
            &format!("Namespace {namespace} ready"),
            StorePhase::Provisioning.as_str(),
        )
        .await;

    // Step 2/5: helm install / upgrade
    info!(store = %name, "step_helm_install");
    append_activity(
        &mut status.activity_log,
        "HELM_INSTALL",
        "Installing Helm chart",
    );
    ctx.publisher
        .publish(
            &name,
            "HELM_INSTALL",
            "Installing Helm chart",
            StorePhase::Provisioning.as_str(),
        )
        .await;
    let values = helm_values(&ctx.config, &name, domain_suffix);
    ctx.helm
        .install(&release, &namespace, &values)
        .await
        .map_err(StepFailure::Infra)?;
    upsert_condition(
        &mut status.conditions,
        "HelmInstalled",
        "True",
        "Installed",
        "Helm chart installed successfully",
    );
    append_activity(
        &mut status.activity_log,
        "HELM_READY",
        "Helm chart installed successfully",
    );
    ctx.publisher
        .publish(
            &name,
            "HELM_READY",
            "Helm chart installed",
            StorePhase::Provisioning.as_str(),
        )
        .await;

    // Steps 3-5: readiness gates in strict order.
    let gates = [
        (
            "postgres",
            "DatabaseReady",
            "PostgreSQL",
            "DB_READY",
            "PostgreSQL database ready",
        ),
        (
            "medusa-backend",
            "BackendReady",
            "Medusa backend",
            "BACKEND_READY",
            "Medusa backend ready",
        ),
        (
            "storefront",
            "StorefrontReady",
            "Storefront",
            "STOREFRONT_READY",
            "Storefront ready",
        ),
    ];
    for (component, condition, display, event, ready_message) in gates {
        info!(store = %name, %component, "step_verify_readiness");
        let selector = format!("app.kubernetes.io/name={component}");
        let pods = ctx
            .cluster
            .list_pods(&namespace, Some(&selector))
            .await
            .map_err(StepFailure::Infra)?;
        let (ready, reason) = pods_all_ready(&pods);
        if !ready {
            upsert_condition(&mut status.conditions, condition, "False", "NotReady", &reason);
            return Err(StepFailure::NotReady(format!(
                "{display} not ready: {reason}"
            )));
        }
        upsert_condition(
            &mut status.conditions,
            condition,
            "True",
            "Running",
            &format!("{display} is running"),
        );
        append_activity(&mut status.activity_log, event, ready_message);
        ctx.publisher
            .publish(&name, event, ready_message, StorePhase::Provisioning.as_str())
            .await;
    }

    // All gates passed: the store is Ready.
    let (url, admin_url) = store_urls(&name, domain_suffix);
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
    Ok(())
}

/* ============================= HEALTH / DRIFT ============================= */

/// Periodic health check for Ready stores: detect drift in the critical
/// resources, self-heal via a Helm upgrade, and surface pod degradation.
pub async fn check_health(ctx: &Context, store: &Store) {
    if store.phase() != StorePhase::Ready {
        return;
    }
    if store.spec.engine == Engine::Woocommerce {
        return;
    }

    let name = store.name_any();
    let namespace = store.namespace_name();
    let release = store.release_name();
    let domain_suffix = store
        .spec
        .domain_suffix
        .clone()
        .unwrap_or_else(|| ctx.config.domain_suffix.clone());
    let mut status = store.status.clone().unwrap_or_default();

    let probe = match probe_drift(ctx, &namespace).await {
        Ok(probe) => probe,
        Err(e) if e.is_not_found() => {
            // The delete flow will converge; nothing to do here.
            warn!(store = %name, %namespace, "namespace_missing_during_health_check");
            return;
        }
        Err(e) => {
            error!(store = %name, error = %e, "health_check_failed");
            return;
        }
    };

    let reasons = drift_reasons(&probe);
    if !reasons.is_empty() {
        let joined = reasons.join("; ");
        warn!(store = %name, drift = %joined, "drift_detected");
        metrics::DRIFT_DETECTED_TOTAL.inc();
        upsert_condition(
            &mut status.conditions,
            "DriftDetected",
            "True",
            "ResourceDrift",
            &joined,
        );
        append_activity(
            &mut status.activity_log,
            "DRIFT_DETECTED",
            &format!("Drift: {joined}"),
        );
        ctx.publisher
            .publish(
                &name,
                "DRIFT_DETECTED",
                &format!("Drift: {joined}"),
                StorePhase::Ready.as_str(),
            )
            .await;

        info!(store = %name, "self_healing_via_helm_upgrade");
        append_activity(
            &mut status.activity_log,
            "SELF_HEAL",
            "Triggering Helm upgrade to restore resources",
        );
        ctx.publisher
            .publish(
                &name,
                "SELF_HEAL",
                "Self-healing via Helm upgrade",
                StorePhase::Ready.as_str(),
            )
            .await;

        let values = helm_values(&ctx.config, &name, &domain_suffix);
        if let Err(e) = ctx.helm.install(&release, &namespace, &values).await {
            error!(store = %name, error = %e, "self_heal_failed");
            status.last_updated = Some(now());
            if let Err(e) = ctx.cluster.patch_store_status(&name, &status).await {
                warn!(store = %name, error = %e, "health_status_patch_failed");
            }
            return;
        }

        upsert_condition(
            &mut status.conditions,
            "DriftDetected",
            "False",
            "Healed",
            "Resources restored via Helm upgrade",
        );
        append_activity(
            &mut status.activity_log,
            "SELF_HEALED",
            "Resources restored successfully",
        );
        ctx.publisher
            .publish(
                &name,
                "SELF_HEALED",
                "Resources restored",
                StorePhase::Ready.as_str(),
            )
            .await;

        status.last_updated = Some(now());
        if let Err(e) = ctx.cluster.patch_store_status(&name, &status).await {
            warn!(store = %name, error = %e, "health_status_patch_failed");
        }
        return;
    }

    // No drift: sweep pod health.
    let pods = match ctx.cluster.list_pods(&namespace, None).await {
        Ok(pods) => pods,
        Err(e) if e.is_not_found() => {
            warn!(store = %name, %namespace, "namespace_missing_during_health_check");
            return;
        }
        Err(e) => {
            error!(store = %name, error = %e, "health_check_failed");
            return;
        }
    };

    let mut degraded = false;
    for pod in &pods {
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown");
        if phase != "Running" && phase != "Succeeded" {
            let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
            warn!(store = %name, pod = %pod_name, %phase, "pod_degraded");
            upsert_condition(
                &mut status.conditions,
                "HealthCheck",
                "False",
                "PodDegraded",
                &format!("Pod {pod_name} is {phase}"),
            );
            degraded = true;
            break;
        }
    }
    if !degraded {
        upsert_condition(
            &mut status.conditions,
            "HealthCheck",
            "True",
            "Healthy",
            "All pods healthy",
        );
    }

    status.last_updated = Some(now());
    if let Err(e) = ctx.cluster.patch_store_status(&name, &status).await {
        warn!(store = %name, error = %e, "health_status_patch_failed");
    }
}

/* ============================= TEARDOWN ============================= */

/// Clean up all cluster resources for a store. Every step is best-effort
/// and not-found is success, so a restarted operator can resume a
/// half-finished teardown and still converge. The finalizer is removed
/// by the worker pool only after this returns.
pub async fn teardown(ctx: &Context, store: &Store) {
    let name = store.name_any();
    let namespace = store.namespace_name();
    let release = store.release_name();

    if store.spec.engine == Engine::Woocommerce {
        info!(store = %name, "woocommerce_stub_nothing_to_clean");
        ctx.publisher
            .publish(
                &name,
                "DELETE_SKIP",
                "WooCommerce stub, nothing to clean up",
                StorePhase::Deleting.as_str(),
            )
            .await;
        return;
    }

    info!(store = %name, %namespace, "deleting_store");
    ctx.publisher
        .publish(
            &name,
            "DELETE_START",
            &format!("Deleting store {name}"),
            StorePhase::Deleting.as_str(),
        )
        .await;

    // Step 1: helm uninstall (the release may not exist if provisioning
    // failed part-way).
    ctx.publisher
        .publish(
            &name,
            "HELM_UNINSTALL",
            "Uninstalling Helm release",
            StorePhase::Deleting.as_str(),
        )
        .await;
    match ctx.helm.uninstall(&release, &namespace).await {
        Ok(()) => {
            ctx.publisher
                .publish(
                    &name,
                    "HELM_UNINSTALLED",
                    "Helm release uninstalled",
                    StorePhase::Deleting.as_str(),
                )
                .await;
        }
        Err(e) => {
            warn!(store = %name, error = %e, "helm_uninstall_non_fatal");
            ctx.publisher
                .publish(
                    &name,
                    "HELM_UNINSTALL_WARN",
                    &format!("Helm uninstall warning: {}", truncate(&e.to_string(), 100)),
                    StorePhase::Deleting.as_str(),
                )
                .await;
        }
    }

    // Step 2: delete PVCs explicitly before the namespace cascade, in
    // case the storage class does not reclaim on namespace deletion.
    match ctx.cluster.list_pvcs(&namespace).await {
        Ok(pvcs) => {
            let total = pvcs.len();
            for pvc in pvcs {
                let pvc_name = pvc.metadata.name.unwrap_or_default();
                if let Err(e) = ctx.cluster.delete_pvc(&namespace, &pvc_name).await {
                    warn!(store = %name, pvc = %pvc_name, error = %e, "pvc_cleanup_non_fatal");
                }
            }
            ctx.publisher
                .publish(
                    &name,
                    "PVC_CLEANUP",
                    &format!("Cleaned up {total} PVCs"),
                    StorePhase::Deleting.as_str(),
                )
                .await;
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => warn!(store = %name, error = %e, "pvc_cleanup_non_fatal"),
    }

    // Step 3: delete the namespace (cascades to everything inside).
    ctx.publisher
        .publish(
            &name,
            "NAMESPACE_DELETE",
            &format!("Deleting namespace {namespace}"),
            StorePhase::Deleting.as_str(),
        )
        .await;
    match ctx.cluster.delete_namespace(&namespace).await {
        Ok(()) => {
            ctx.publisher
                .publish(
                    &name,
                    "NAMESPACE_DELETED",
                    &format!("Namespace {namespace} deleted"),
                    StorePhase::Deleting.as_str(),
                )
                .await;
        }
        Err(e) => {
            warn!(store = %name, error = %e, "namespace_delete_non_fatal");
            ctx.publisher
                .publish(
                    &name,
                    "NAMESPACE_DELETE_WARN",
                    &format!("Namespace delete warning: {}", truncate(&e.to_string(), 100)),
                    StorePhase::Deleting.as_str(),
                )
                .await;
        }
    }

    // Step 4: drop the per-store event stream.
    ctx.publisher.delete_stream(&name).await;

    ctx.publisher
        .publish(
            &name,
            "DELETE_COMPLETE",
            &format!("Store {name} cleanup complete"),
            StorePhase::Deleted.as_str(),
        )
        .await;
    info!(store = %name, "store_cleanup_complete");
}

/* ============================= TESTS ============================= */
