use redis::aio::ConnectionManager;
use tracing::{debug, info, warn};

use crate::status;

/// Per-store stream cap; old entries are trimmed by the server.
const STREAM_MAXLEN: usize = 100;

/// Global pub/sub channel for dashboard subscriptions.
const GLOBAL_CHANNEL: &str = "store:events";

fn stream_key(store: &str) -> String {
    format!("store:events:{store}")
}

/* ============================= PUBLISHER ============================= */

/// Best-effort fan-out of lifecycle events to a Redis stream + pub/sub
/// channel. Publishing never blocks or fails the reconciler: without a
/// configured URL every call is a no-op, and any Redis error is logged
/// at debug level and swallowed.
#[derive(Clone)]
pub struct EventPublisher {
    conn: Option<ConnectionManager>,
}

impl EventPublisher {
    pub fn disabled() -> Self {
        Self { conn: None }
    }

    /// Connect to Redis if a URL is configured. Connection failure is
    /// non-fatal and yields a disabled publisher.
    pub async fn connect(url: Option<&str>) -> Self {
        let Some(url) = url else {
            return Self::disabled();
        };

        let client = match redis::Client::open(url) {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "redis_unavailable_non_fatal");
                return Self::disabled();
            }
        };
        match ConnectionManager::new(client).await {
            Ok(mut conn) => match redis::cmd("PING").query_async::<_, String>(&mut conn).await {
                Ok(_) => {
                    info!(%url, "redis_connected");
                    Self { conn: Some(conn) }
                }
                Err(e) => {
                    warn!(error = %e, "redis_unavailable_non_fatal");
                    Self::disabled()
                }
            },
            Err(e) => {
                warn!(error = %e, "redis_unavailable_non_fatal");
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.conn.is_some()
    }

    /// Append to the per-store stream and publish on the global channel.
    pub async fn publish(&self, store: &str, event_type: &str, message: &str, phase: &str) {
        let Some(conn) = &self.conn else { return };
        let mut conn = conn.clone();
        let timestamp = status::now();

        let added: Result<redis::Value, _> = redis::cmd("XADD")
            .arg(stream_key(store))
            .arg("MAXLEN")
            .arg("~")
            .arg(STREAM_MAXLEN)
            .arg("*")
            .arg("type")
            .arg(event_type)
            .arg("message")
            .arg(message)
            .arg("phase")
            .arg(phase)
            .arg("timestamp")
            .arg(&timestamp)
            .arg("store")
            .arg(store)
            .query_async(&mut conn)
            .await;
        if let Err(e) = added {
            debug!(error = %e, "redis_publish_failed_non_fatal");
            return;
        }

        let payload = serde_json::json!({
            "store": store,
            "type": event_type,
            "message": message,
            "phase": phase,
            "timestamp": timestamp,
        })
        .to_string();
        let published: Result<redis::Value, _> = redis::cmd("PUBLISH")
            .arg(GLOBAL_CHANNEL)
            .arg(payload)
            .query_async(&mut conn)
            .await;
        if let Err(e) = published {
            debug!(error = %e, "redis_publish_failed_non_fatal");
        }
    }

    /// Drop the per-store stream during teardown. Best-effort.
    pub async fn delete_stream(&self, store: &str) {
        let Some(conn) = &self.conn else { return };
        let mut conn = conn.clone();
        let deleted: Result<redis::Value, _> = redis::cmd("DEL")
            .arg(stream_key(store))
            .query_async(&mut conn)
            .await;
        if let Err(e) = deleted {
            debug!(error = %e, "redis_stream_delete_failed_non_fatal");
        }
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key_format() {
        assert_eq!(stream_key("demo"), "store:events:demo");
    }

    #[test]
    fn test_disabled_publisher_reports_disabled() {
        let publisher = EventPublisher::disabled();
        assert!(!publisher.is_enabled());
    }

    #[tokio::test]
    async fn test_connect_without_url_is_disabled() {
        let publisher = EventPublisher::connect(None).await;
        assert!(!publisher.is_enabled());
    }

    #[tokio::test]
    async fn test_disabled_publish_is_a_noop() {
        let publisher = EventPublisher::disabled();
        // Must return without error and without blocking.
        publisher
            .publish("demo", "STORE_READY", "Store ready", "Ready")
            .await;
        publisher.delete_stream("demo").await;
    }

    #[tokio::test]
    async fn test_invalid_url_yields_disabled_publisher() {
        let publisher = EventPublisher::connect(Some("not-a-redis-url")).await;
        assert!(!publisher.is_enabled());
    }
}
