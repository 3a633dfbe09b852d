use chrono::Utc;

use crate::crd::{ACTIVITY_LOG_MAX, ActivityLogEntry, StoreCondition};

/* ============================= TIME ============================= */

/// Current UTC time, RFC3339 with second precision ("YYYY-MM-DDTHH:MM:SSZ").
pub fn now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/* ============================= CONDITIONS ============================= */

/// Upsert a condition, keyed by type. `last_transition_time` is refreshed
/// on every write regardless of whether the status value changed; the
/// platform's dashboards rely on it as a liveness signal.
pub fn upsert_condition(
    conditions: &mut Vec<StoreCondition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
) {
    for c in conditions.iter_mut() {
        if c.type_ == type_ {
            c.status = status.to_string();
            c.reason = reason.to_string();
            c.message = message.to_string();
            c.last_transition_time = now();
            return;
        }
    }
    conditions.push(StoreCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: now(),
    });
}

/* ============================= ACTIVITY LOG ============================= */

/// Append an entry and evict from the front until the log holds at most
/// `ACTIVITY_LOG_MAX` entries (etcd object size protection).
pub fn append_activity(log: &mut Vec<ActivityLogEntry>, event: &str, message: &str) {
    log.push(ActivityLogEntry {
        timestamp: now(),
        event: event.to_string(),
        message: message.to_string(),
    });
    while log.len() > ACTIVITY_LOG_MAX {
        log.remove(0);
    }
}

/* ============================= MESSAGES ============================= */

/// Truncate a message at a char boundary for status fields.
pub fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

/* ============================= TESTS ============================= */
