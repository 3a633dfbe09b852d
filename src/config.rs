use std::time::Duration;

/* ============================= DEFAULTS ============================= */

const DEFAULT_HELM_CHART_PATH: &str = "/charts/store-medusa";
const DEFAULT_DOMAIN_SUFFIX: &str = "local.urumi";
const DEFAULT_MAX_STORES_GLOBAL: u32 = 10;
const DEFAULT_MAX_STORES_PER_OWNER: u32 = 5;
const DEFAULT_PROVISION_TIMEOUT_SECS: u64 = 300;
const DEFAULT_MEDUSA_IMAGE: &str = "medusa-store:latest";
const DEFAULT_STOREFRONT_IMAGE: &str = "store-storefront:latest";
const DEFAULT_STORAGE_CLASS: &str = "standard";
const DEFAULT_INGRESS_CLASS: &str = "nginx";
const DEFAULT_MAX_PARALLEL_PROVISIONS: usize = 3;

/* ============================= CONFIG ============================= */

/// Operator configuration, loaded from the environment exactly once at
/// startup and passed around inside the shared reconciler context.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub helm_chart_path: String,
    pub domain_suffix: String,
    pub max_stores_global: u32,
    pub max_stores_per_owner: u32,
    pub provision_timeout: Duration,
    pub medusa_image: String,
    pub storefront_image: String,
    pub storage_class: String,
    pub ingress_class: String,
    /// Empty or unset REDIS_URL disables the event publisher.
    pub redis_url: Option<String>,
    pub max_parallel_provisions: usize,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            helm_chart_path: DEFAULT_HELM_CHART_PATH.to_string(),
            domain_suffix: DEFAULT_DOMAIN_SUFFIX.to_string(),
            max_stores_global: DEFAULT_MAX_STORES_GLOBAL,
            max_stores_per_owner: DEFAULT_MAX_STORES_PER_OWNER,
            provision_timeout: Duration::from_secs(DEFAULT_PROVISION_TIMEOUT_SECS),
            medusa_image: DEFAULT_MEDUSA_IMAGE.to_string(),
            storefront_image: DEFAULT_STOREFRONT_IMAGE.to_string(),
            storage_class: DEFAULT_STORAGE_CLASS.to_string(),
            ingress_class: DEFAULT_INGRESS_CLASS.to_string(),
            redis_url: None,
            max_parallel_provisions: DEFAULT_MAX_PARALLEL_PROVISIONS,
        }
    }
}

impl OperatorConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary lookup function.
    /// Unparseable numeric values fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let redis_url = lookup("REDIS_URL").filter(|url| !url.is_empty());

        Self {
            helm_chart_path: string("HELM_CHART_PATH", &defaults.helm_chart_path),
            domain_suffix: string("DOMAIN_SUFFIX", &defaults.domain_suffix),
            max_stores_global: lookup("MAX_STORES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_stores_global),
            max_stores_per_owner: lookup("MAX_STORES_PER_OWNER")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_stores_per_owner),
            provision_timeout: lookup("PROVISION_TIMEOUT")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.provision_timeout),
            medusa_image: string("MEDUSA_IMAGE", &defaults.medusa_image),
            storefront_image: string("STOREFRONT_IMAGE", &defaults.storefront_image),
            storage_class: string("STORAGE_CLASS", &defaults.storage_class),
            ingress_class: string("INGRESS_CLASS", &defaults.ingress_class),
            redis_url,
            max_parallel_provisions: lookup("MAX_PARALLEL_PROVISIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_parallel_provisions),
        }
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(map: &'a HashMap<&str, &str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn test_defaults() {
        let cfg = OperatorConfig::from_lookup(|_| None);
        assert_eq!(cfg.helm_chart_path, "/charts/store-medusa");
        assert_eq!(cfg.domain_suffix, "local.urumi");
        assert_eq!(cfg.max_stores_global, 10);
        assert_eq!(cfg.max_stores_per_owner, 5);
        assert_eq!(cfg.provision_timeout, Duration::from_secs(300));
        assert_eq!(cfg.medusa_image, "medusa-store:latest");
        assert_eq!(cfg.storefront_image, "store-storefront:latest");
        assert_eq!(cfg.storage_class, "standard");
        assert_eq!(cfg.ingress_class, "nginx");
        assert_eq!(cfg.redis_url, None);
        assert_eq!(cfg.max_parallel_provisions, 3);
    }

    #[test]
    fn test_env_overrides() {
        let map = HashMap::from([
            ("HELM_CHART_PATH", "/opt/charts/store"),
            ("DOMAIN_SUFFIX", "shops.example.com"),
            ("MAX_STORES", "50"),
            ("MAX_STORES_PER_OWNER", "8"),
            ("PROVISION_TIMEOUT", "120"),
            ("MAX_PARALLEL_PROVISIONS", "5"),
            ("REDIS_URL", "redis://localhost:6379"),
        ]);
        let cfg = OperatorConfig::from_lookup(lookup_from(&map));
        assert_eq!(cfg.helm_chart_path, "/opt/charts/store");
        assert_eq!(cfg.domain_suffix, "shops.example.com");
        assert_eq!(cfg.max_stores_global, 50);
        assert_eq!(cfg.max_stores_per_owner, 8);
        assert_eq!(cfg.provision_timeout, Duration::from_secs(120));
        assert_eq!(cfg.max_parallel_provisions, 5);
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://localhost:6379"));
    }

    #[test]
    fn test_empty_redis_url_disables_publisher() {
        let map = HashMap::from([("REDIS_URL", "")]);
        let cfg = OperatorConfig::from_lookup(lookup_from(&map));
        assert_eq!(cfg.redis_url, None);
    }

    #[test]
    fn test_unparseable_numbers_fall_back_to_defaults() {
        let map = HashMap::from([("MAX_STORES", "lots"), ("PROVISION_TIMEOUT", "-3")]);
        let cfg = OperatorConfig::from_lookup(lookup_from(&map));
        assert_eq!(cfg.max_stores_global, 10);
        assert_eq!(cfg.provision_timeout, Duration::from_secs(300));
    }
}
