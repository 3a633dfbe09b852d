use crate::crd::Store;

/* ============================= LIMITS ============================= */

/// Quota thresholds. Admission rejects at the threshold (`>=` on the
/// pre-create count); the reconciler's defense-in-depth re-check rejects
/// past it (`>`, the listed set already contains the store being
/// reconciled). The asymmetry is deliberate and matches the platform's
/// admission layer.
#[derive(Debug, Clone, Copy)]
pub struct QuotaLimits {
    pub per_owner: u32,
    pub global: u32,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            per_owner: 5,
            global: 10,
        }
    }
}

/* ============================= VERDICT ============================= */

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    OwnerQuotaExceeded { owner: String, count: u32, limit: u32 },
    GlobalQuotaExceeded { count: u32, limit: u32 },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

/* ============================= COUNTING ============================= */

/// Count stores whose spec.owner matches `owner`.
pub fn count_for_owner(stores: &[Store], owner: &str) -> u32 {
    stores.iter().filter(|s| s.spec.owner == owner).count() as u32
}

/// Admission-time verdict over the pre-create store set: reject when the
/// owner or global count has already reached its threshold.
pub fn admission_verdict(stores: &[Store], owner: &str, limits: QuotaLimits) -> Verdict {
    let total = stores.len() as u32;
    if total >= limits.global {
        return Verdict::GlobalQuotaExceeded {
            count: total,
            limit: limits.global,
        };
    }
    let owned = count_for_owner(stores, owner);
    if owned >= limits.per_owner {
        return Verdict::OwnerQuotaExceeded {
            owner: owner.to_string(),
            count: owned,
            limit: limits.per_owner,
        };
    }
    Verdict::Allowed
}

/// Reconcile-time re-check against racing admissions. The store under
/// reconciliation is already part of `stores`, so the owner count may
/// equal the limit without breaching it.
pub fn reconcile_verdict(stores: &[Store], owner: &str, limits: QuotaLimits) -> Verdict {
    let owned = count_for_owner(stores, owner);
    if owned > limits.per_owner {
        return Verdict::OwnerQuotaExceeded {
            owner: owner.to_string(),
            count: owned,
            limit: limits.per_owner,
        };
    }
    Verdict::Allowed
}

/* ============================= TESTS ============================= */
