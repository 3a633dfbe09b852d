use std::time::Duration;

use thiserror::Error;

/* ============================= GATEWAY ERRORS ============================= */

/// Failures raised by the cluster gateway and the installer wrapper.
///
/// The reconciler is the only component that classifies these into a
/// retry / fail / ignore decision; lower layers never write status.
#[derive(Debug, Error)]
pub enum Error {
    /// The referenced object does not exist (HTTP 404). Treated as
    /// success during teardown.
    #[error("{0} not found")]
    NotFound(String),

    /// Infrastructure hiccup worth retrying (429, 5xx, transport).
    #[error("transient failure: {0}")]
    Transient(String),

    /// Everything else. Requires a spec change or manual intervention
    /// once the retry budget is exhausted.
    #[error("{0}")]
    Fatal(String),
}

impl Error {
    /// Classify a kube client error for `what` (a short object description).
    pub fn from_kube(what: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(what.to_string()),
            kube::Error::Api(ae) if ae.code == 429 || ae.code >= 500 => {
                Error::Transient(format!("{what}: {}", ae.message))
            }
            kube::Error::HyperError(e) => Error::Transient(format!("{what}: {e}")),
            kube::Error::Service(e) => Error::Transient(format!("{what}: {e}")),
            other => Error::Fatal(format!("{what}: {other}")),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/* ============================= HANDLER OUTCOME ============================= */

/// A non-fatal handler outcome asking the worker pool to run the same
/// reconciliation again after `delay`. Never raised as a panic or used
/// for control flow inside a handler; returned as a value and scheduled
/// by the harness.
#[derive(Debug, Error)]
#[error("requeue in {delay:?}: {reason}")]
pub struct Requeue {
    pub reason: String,
    pub delay: Duration,
    /// Whether this requeue consumed one attempt of the retry budget.
    pub counted: bool,
}

impl Requeue {
    /// Pods still coming up: retry in 15s without touching the budget.
    pub fn not_ready(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            delay: Duration::from_secs(15),
            counted: false,
        }
    }

    /// Infrastructure failure: retry in 30s, one attempt consumed.
    pub fn after_error(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            delay: Duration::from_secs(30),
            counted: true,
        }
    }

    /// Infrastructure failure outside the provisioning steps (store list,
    /// finalizer patch): retry in 30s without consuming the budget.
    pub fn uncounted(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            delay: Duration::from_secs(30),
            counted: false,
        }
    }
}

/* ============================= TESTS ============================= */
