use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

use crate::crd::{ANNOTATION_PREFIX, Engine, FINALIZER, Store, StoreStatus};
use crate::error::{Error, Result};

/// Field manager recorded on every patch issued by the operator.
const PATCH_MANAGER: &str = "store-operator";

/* ============================= FINALIZER ============================= */

pub fn has_finalizer(store: &Store) -> bool {
    store
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == FINALIZER))
}

/* ============================= WORKLOAD PROBES ============================= */

/// Spec and ready replica counts of a Deployment, `None` when absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replicas {
    pub desired: i32,
    pub ready: i32,
}

/* ============================= GATEWAY ============================= */

/// Typed, idempotent access to the Kubernetes API.
///
/// Every mutation is guarded so the authoritative server response (409 on
/// create, 404 on delete) is what decides "already done", not a list scan.
#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
}

impl ClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// The underlying client, for components that drive their own APIs.
    pub fn raw(&self) -> Client {
        self.client.clone()
    }

    /* ── Namespaces ── */

    /// Create the store namespace idempotently. Returns `true` if this
    /// call created it, `false` if it already existed (409).
    pub async fn ensure_namespace(
        &self,
        name: &str,
        store_name: &str,
        engine: Engine,
    ) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let labels = BTreeMap::from([
            (
                "app.kubernetes.io/managed-by".to_string(),
                "store-operator".to_string(),
            ),
            (
                "store.platform.urumi.ai/name".to_string(),
                store_name.to_string(),
            ),
            (
                "store.platform.urumi.ai/engine".to_string(),
                engine.to_string(),
            ),
        ]);
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        };

        match api.create(&PostParams::default(), &namespace).await {
            Ok(_) => {
                info!(namespace = %name, "namespace_created");
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                info!(namespace = %name, "namespace_already_exists");
                Ok(false)
            }
            Err(e) => Err(Error::from_kube(&format!("namespace {name}"), e)),
        }
    }

    /// Delete a namespace; 404 is success.
    pub async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(namespace = %name, "namespace_deletion_initiated");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                info!(namespace = %name, "namespace_already_gone");
                Ok(())
            }
            Err(e) => Err(Error::from_kube(&format!("namespace {name}"), e)),
        }
    }

    /* ── Workloads ── */

    /// Replica counts of a Deployment, `None` if it does not exist.
    pub async fn deployment_replicas(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Replicas>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deployment = api
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(&format!("deployment {namespace}/{name}"), e))?;
        Ok(deployment.map(|d| Replicas {
            desired: d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0),
            ready: d
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0),
        }))
    }

    pub async fn service_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let service = api
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(&format!("service {namespace}/{name}"), e))?;
        Ok(service.is_some())
    }

    pub async fn statefulset_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let sts = api
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(&format!("statefulset {namespace}/{name}"), e))?;
        Ok(sts.is_some())
    }

    /// List pods in a namespace, optionally filtered by label selector.
    pub async fn list_pods(&self, namespace: &str, selector: Option<&str>) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut params = ListParams::default();
        if let Some(selector) = selector {
            params = params.labels(selector);
        }
        let list = api
            .list(&params)
            .await
            .map_err(|e| Error::from_kube(&format!("pods in {namespace}"), e))?;
        Ok(list.items)
    }

    /* ── Volume claims ── */

    pub async fn list_pvcs(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::from_kube(&format!("pvcs in {namespace}"), e))?;
        Ok(list.items)
    }

    /// Delete a PVC; 404 is success.
    pub async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(pvc = %name, namespace = %namespace, "pvc_deleted");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::from_kube(&format!("pvc {namespace}/{name}"), e)),
        }
    }

    /* ── Stores ── */

    pub async fn list_stores(&self) -> Result<Vec<Store>> {
        let api: Api<Store> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::from_kube("stores", e))?;
        Ok(list.items)
    }

    pub async fn get_store(&self, name: &str) -> Result<Option<Store>> {
        let api: Api<Store> = Api::all(self.client.clone());
        api.get_opt(name)
            .await
            .map_err(|e| Error::from_kube(&format!("store {name}"), e))
    }

    /// Merge-patch the status subresource. A version conflict is retried
    /// once before surfacing.
    pub async fn patch_store_status(&self, name: &str, status: &StoreStatus) -> Result<()> {
        let api: Api<Store> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "status": status });

        let mut attempts = 0;
        loop {
            attempts += 1;
            match api
                .patch_status(
                    name,
                    &PatchParams::apply(PATCH_MANAGER),
                    &Patch::Merge(&patch),
                )
                .await
            {
                Ok(_) => {
                    debug!(store = %name, phase = %status.phase, "status_updated");
                    return Ok(());
                }
                Err(kube::Error::Api(ae)) if ae.code == 409 && attempts == 1 => {
                    debug!(store = %name, "status_patch_conflict_retry");
                    continue;
                }
                Err(e) => return Err(Error::from_kube(&format!("store {name} status"), e)),
            }
        }
    }

    pub async fn add_finalizer(&self, store: &Store) -> Result<()> {
        let name = store.name_any();
        let api: Api<Store> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": [FINALIZER]
            }
        });
        api.patch(
            &name,
            &PatchParams::apply(PATCH_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| Error::from_kube(&format!("store {name}"), e))?;
        info!(store = %name, "finalizer_added");
        Ok(())
    }

    pub async fn remove_finalizer(&self, store: &Store) -> Result<()> {
        let name = store.name_any();
        let api: Api<Store> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": []
            }
        });
        api.patch(
            &name,
            &PatchParams::apply(PATCH_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| Error::from_kube(&format!("store {name}"), e))?;
        info!(store = %name, "finalizer_removed");
        Ok(())
    }

    /// Record a harness progress annotation (`platform.urumi.ai/{key}`).
    pub async fn annotate_store(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let api: Api<Store> = Api::all(self.client.clone());
        let annotation = format!("{ANNOTATION_PREFIX}/{key}");
        let patch = serde_json::json!({
            "metadata": {
                "annotations": {
                    annotation: value
                }
            }
        });
        api.patch(
            name,
            &PatchParams::apply(PATCH_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| Error::from_kube(&format!("store {name}"), e))?;
        Ok(())
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::StoreSpec;

    #[test]
    fn test_has_finalizer_when_present() {
        let mut store = Store::new("demo", StoreSpec::default());
        store.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        assert!(has_finalizer(&store));
    }

    #[test]
    fn test_has_finalizer_when_absent() {
        let store = Store::new("demo", StoreSpec::default());
        assert!(!has_finalizer(&store));
    }

    #[test]
    fn test_has_finalizer_with_other_finalizers() {
        let mut store = Store::new("demo", StoreSpec::default());
        store.metadata.finalizers = Some(vec!["some-other/finalizer".to_string()]);
        assert!(!has_finalizer(&store));
    }

    #[test]
    fn test_has_finalizer_empty_list() {
        let mut store = Store::new("demo", StoreSpec::default());
        store.metadata.finalizers = Some(vec![]);
        assert!(!has_finalizer(&store));
    }

    #[test]
    fn test_replicas_equality() {
        let a = Replicas {
            desired: 1,
            ready: 1,
        };
        let b = Replicas {
            desired: 1,
            ready: 0,
        };
        assert_ne!(a, b);
        assert_eq!(a, a);
    }
}
