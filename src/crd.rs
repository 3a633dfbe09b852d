use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= CONSTANTS ============================= */

pub const CRD_GROUP: &str = "platform.urumi.ai";
pub const CRD_VERSION: &str = "v1";
pub const CRD_PLURAL: &str = "stores";

/// Blocks Store removal from storage until teardown completes.
pub const FINALIZER: &str = "stores.platform.urumi.ai/finalizer";

/// Annotation prefix for harness progress bookkeeping.
pub const ANNOTATION_PREFIX: &str = "platform.urumi.ai";

/// Activity log max entries in CRD status (etcd size constraint).
pub const ACTIVITY_LOG_MAX: usize = 15;

/* ============================= ENGINE ============================= */

/// E-commerce engine backing a store.
///
/// Only MedusaJS is fully supported; WooCommerce is a stub that parks the
/// store in `ComingSoon` without touching the cluster.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    Medusa,
    Woocommerce,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Medusa => "medusa",
            Engine::Woocommerce => "woocommerce",
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/* ============================= PHASE ============================= */

/// Lifecycle phase of a store, owned exclusively by the operator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum StorePhase {
    #[default]
    Pending,
    Provisioning,
    Ready,
    Failed,
    ComingSoon,
    Deleting,
    Deleted,
}

impl StorePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorePhase::Pending => "Pending",
            StorePhase::Provisioning => "Provisioning",
            StorePhase::Ready => "Ready",
            StorePhase::Failed => "Failed",
            StorePhase::ComingSoon => "ComingSoon",
            StorePhase::Deleting => "Deleting",
            StorePhase::Deleted => "Deleted",
        }
    }
}

impl std::fmt::Display for StorePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/* ============================= STATUS TYPES ============================= */

/// A single typed condition on a Store, keyed by `type`.
///
/// `last_transition_time` is refreshed on every write, not only on real
/// transitions, matching the platform's existing consumers.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoreCondition {
    #[serde(rename = "type")]
    pub type_: String,

    /// "True", "False" or "Unknown".
    pub status: String,

    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub last_transition_time: String,
}

/// One entry in the bounded per-store activity log.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityLogEntry {
    pub timestamp: String,
    pub event: String,
    pub message: String,
}

/* ============================= SPEC ============================= */

fn default_owner() -> String {
    "default".to_string()
}

/// Store defines the desired state of one tenant store.
///
/// The spec is owned by the Intent API / user; the operator only reads it.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "platform.urumi.ai",
    version = "v1",
    kind = "Store",
    plural = "stores",
    status = "StoreStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct StoreSpec {
    /// E-commerce engine: `medusa` (default) or `woocommerce` (stub).
    #[serde(default)]
    pub engine: Engine,

    /// Owner identifier used for quota accounting.
    #[serde(default = "default_owner")]
    pub owner: String,

    /// DNS label suffix for the store's ingress host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_suffix: Option<String>,
}

/* ============================= STATUS ============================= */

/// StoreStatus reports the observed provisioning state.
///
/// Written exclusively by the operator, one merge patch per handler run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatus {
    #[serde(default)]
    pub phase: StorePhase,

    /// Public storefront URL, set when the store reaches `Ready`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Admin dashboard URL, set when the store reaches `Ready`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_url: Option<String>,

    /// Human-readable summary of the current state.
    #[serde(default)]
    pub message: String,

    /// Stamped once, on the first transition out of `Pending`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,

    /// Counted provisioning attempts; reset to 0 on `Ready`.
    #[serde(default)]
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<StoreCondition>,

    /// Bounded ring buffer of lifecycle events (max 15 entries).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub activity_log: Vec<ActivityLogEntry>,
}

/* ============================= DERIVED NAMES ============================= */

impl Store {
    /// The namespace holding all cluster resources for this store.
    pub fn namespace_name(&self) -> String {
        format!("store-{}", self.metadata.name.as_deref().unwrap_or_default())
    }

    /// The packaged-release name, identical to the namespace name.
    pub fn release_name(&self) -> String {
        self.namespace_name()
    }

    pub fn phase(&self) -> StorePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}

/* ============================= NAME VALIDATION ============================= */

/// Validate a store name: lowercase DNS label, 3 to 40 chars,
/// `^[a-z][a-z0-9-]*[a-z0-9]$`.
pub fn validate_store_name(name: &str) -> Result<(), String> {
    if name.len() < 3 || name.len() > 40 {
        return Err(format!(
            "store name must be 3-40 characters, got {}",
            name.len()
        ));
    }
    let bytes = name.as_bytes();
    if !bytes[0].is_ascii_lowercase() {
        return Err("store name must start with a lowercase letter".to_string());
    }
    if !(bytes[bytes.len() - 1].is_ascii_lowercase() || bytes[bytes.len() - 1].is_ascii_digit()) {
        return Err("store name must end with a letter or digit".to_string());
    }
    for &b in bytes {
        if !(b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-') {
            return Err(format!(
                "store name may only contain lowercase letters, digits and hyphens, got '{}'",
                b as char
            ));
        }
    }
    Ok(())
}

/* ============================= TESTS ============================= */
