use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{StreamExt, TryStreamExt};
use kube::ResourceExt;
use kube::api::Api;
use kube::runtime::watcher;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tracing::{debug, info, warn};

use crate::cluster;
use crate::crd::{Engine, Store, StorePhase};
use crate::metrics;
use crate::reconciler::{self, Context};

/// Drift-detection interval; also the idle threshold a store must reach
/// before the timer fires for it.
const TIMER_INTERVAL: Duration = Duration::from_secs(120);

/* ============================= REQUESTS ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// CRD create or update observed by the watch.
    Apply,
    /// Synthesized on startup (and after transient failures) to drive
    /// re-reconciliation.
    Resume,
    /// Periodic drift/health check for Ready stores.
    Timer,
}

#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    pub name: String,
    pub kind: EventKind,
}

/* ============================= KEYED LOCKS ============================= */

/// One async mutex per store name: handlers for the same store are
/// strictly serialized while distinct stores reconcile in parallel.
struct KeyedLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    async fn get(&self, name: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().await;
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/* ============================= IDLE TRACKING ============================= */

/// Last handler completion per store, consulted by the timer so a drift
/// check never fires within the interval of the previous handler.
struct IdleTracker {
    inner: Mutex<HashMap<String, Instant>>,
}

impl IdleTracker {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    async fn mark(&self, name: &str) {
        self.inner
            .lock()
            .await
            .insert(name.to_string(), Instant::now());
    }

    async fn idle_since(&self, name: &str) -> Option<Duration> {
        self.inner.lock().await.get(name).map(|t| t.elapsed())
    }
}

/* ============================= WORKER POOL ============================= */

/// Bounded worker pool around the reconciler.
///
/// Contract: up to `max_parallel_provisions` handlers run concurrently
/// for distinct stores; handlers for the same store are serialized;
/// transient failures are re-enqueued by a spawned delay task, never by
/// sleeping inside a handler.
pub struct WorkerPool {
    ctx: Arc<Context>,
    tx: mpsc::UnboundedSender<ReconcileRequest>,
    semaphore: Arc<Semaphore>,
    locks: KeyedLocks,
    idle: IdleTracker,
}

impl WorkerPool {
    pub fn new(ctx: Arc<Context>) -> (Arc<Self>, mpsc::UnboundedReceiver<ReconcileRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(ctx.config.max_parallel_provisions));
        let pool = Arc::new(Self {
            ctx,
            tx,
            semaphore,
            locks: KeyedLocks::new(),
            idle: IdleTracker::new(),
        });
        (pool, rx)
    }

    pub fn enqueue(&self, request: ReconcileRequest) {
        // A closed channel means shutdown is in progress.
        let _ = self.tx.send(request);
    }

    /// Re-enqueue after `delay` without occupying a worker slot. The
    /// delay lives in a spawned task, never as a sleep inside a handler.
    pub fn enqueue_after(&self, request: ReconcileRequest, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(request);
        });
    }

    /// Drain the queue until the channel closes.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ReconcileRequest>) {
        while let Some(request) = rx.recv().await {
            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let pool = self.clone();
            tokio::spawn(async move {
                let _slot = permit;
                let lock = pool.locks.get(&request.name).await;
                let _serialized = lock.lock().await;
                pool.handle(request).await;
            });
        }
    }

    async fn handle(&self, request: ReconcileRequest) {
        let name = request.name.clone();
        metrics::RECONCILE_TOTAL.inc();
        let _timer = metrics::RECONCILE_DURATION.start_timer();

        let store = match self.ctx.cluster.get_store(&name).await {
            Ok(Some(store)) => store,
            Ok(None) => {
                debug!(store = %name, "store_gone_skip");
                return;
            }
            Err(e) => {
                metrics::RECONCILE_ERRORS.inc();
                warn!(store = %name, error = %e, "store_fetch_failed");
                self.enqueue_after(request, Duration::from_secs(30));
                return;
            }
        };

        // Deletion wins over everything else once the timestamp is set.
        // The finalizer is removed only after teardown returns, so a
        // crash mid-teardown resumes on the next Apply event.
        if store.metadata.deletion_timestamp.is_some() {
            reconciler::teardown(&self.ctx, &store).await;
            if cluster::has_finalizer(&store) {
                if let Err(e) = self.ctx.cluster.remove_finalizer(&store).await {
                    metrics::RECONCILE_ERRORS.inc();
                    warn!(store = %name, error = %e, "finalizer_removal_failed");
                    self.enqueue_after(request, Duration::from_secs(30));
                    return;
                }
            }
            self.idle.mark(&name).await;
            return;
        }

        match request.kind {
            EventKind::Timer => {
                reconciler::check_health(&self.ctx, &store).await;
                self.idle.mark(&name).await;
            }
            EventKind::Apply | EventKind::Resume => {
                // The finalizer lands before any cluster resource is
                // created, so a crash can never leak a namespace.
                if !cluster::has_finalizer(&store) {
                    if let Err(e) = self.ctx.cluster.add_finalizer(&store).await {
                        metrics::RECONCILE_ERRORS.inc();
                        warn!(store = %name, error = %e, "finalizer_add_failed");
                        self.enqueue_after(request, Duration::from_secs(30));
                        return;
                    }
                }

                match reconciler::provision(&self.ctx, &store).await {
                    Ok(()) => {}
                    Err(requeue) => {
                        metrics::TRANSIENT_REQUEUES.inc();
                        if requeue.counted {
                            // Mirror the retry counter into an annotation so
                            // a restarted operator resumes the same budget.
                            let count = store
                                .status
                                .as_ref()
                                .map(|s| s.retry_count + 1)
                                .unwrap_or(1);
                            if let Err(e) = self
                                .ctx
                                .cluster
                                .annotate_store(&name, "retry-count", &count.to_string())
                                .await
                            {
                                debug!(store = %name, error = %e, "retry_annotation_failed");
                            }
                        }
                        info!(
                            store = %name,
                            delay_secs = requeue.delay.as_secs(),
                            reason = %requeue.reason,
                            "requeue_scheduled"
                        );
                        self.enqueue_after(
                            ReconcileRequest {
                                name: name.clone(),
                                kind: EventKind::Resume,
                            },
                            requeue.delay,
                        );
                    }
                }
                self.idle.mark(&name).await;
            }
        }
    }
}

/* ============================= WATCH LOOP ============================= */

/// Convert API watch events into typed reconcile requests. On the
/// initial sync (and every watch re-list) each non-Ready store gets a
/// Resume event so an operator restart picks up exactly where it
/// left off.
pub async fn watch_stores(pool: Arc<WorkerPool>) -> anyhow::Result<()> {
    let api: Api<Store> = Api::all(pool.ctx.cluster.raw());
    let mut stream = watcher(api, watcher::Config::default()).boxed();

    while let Some(event) = stream.try_next().await? {
        match event {
            watcher::Event::Applied(store) => {
                pool.enqueue(ReconcileRequest {
                    name: store.name_any(),
                    kind: EventKind::Apply,
                });
            }
            watcher::Event::Deleted(store) => {
                // Teardown already ran under the finalizer before the
                // object could leave storage.
                debug!(store = %store.name_any(), "store_removed_from_storage");
            }
            watcher::Event::Restarted(stores) => {
                for store in stores {
                    let resumable = store.phase() != StorePhase::Ready
                        || store.metadata.deletion_timestamp.is_some();
                    if resumable {
                        info!(store = %store.name_any(), phase = %store.phase(), "resume_event");
                        pool.enqueue(ReconcileRequest {
                            name: store.name_any(),
                            kind: EventKind::Resume,
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

/* ============================= DRIFT TIMER ============================= */

/// Every 120s, enqueue a Timer event for each Ready medusa store that
/// has been idle at least as long. Also sweeps the per-phase gauge.
pub async fn drift_timer(pool: Arc<WorkerPool>) {
    let mut ticker = tokio::time::interval(TIMER_INTERVAL);
    ticker.tick().await; // consume the immediate first tick

    loop {
        ticker.tick().await;

        let stores = match pool.ctx.cluster.list_stores().await {
            Ok(stores) => stores,
            Err(e) => {
                warn!(error = %e, "timer_store_list_failed");
                continue;
            }
        };

        for phase in [
            StorePhase::Pending,
            StorePhase::Provisioning,
            StorePhase::Ready,
            StorePhase::Failed,
            StorePhase::ComingSoon,
            StorePhase::Deleting,
            StorePhase::Deleted,
        ] {
            let count = stores.iter().filter(|s| s.phase() == phase).count();
            metrics::STORES_BY_PHASE
                .with_label_values(&[phase.as_str()])
                .set(count as i64);
        }

        for store in stores {
            if store.phase() != StorePhase::Ready
                || store.spec.engine != Engine::Medusa
                || store.metadata.deletion_timestamp.is_some()
            {
                continue;
            }
            let name = store.name_any();
            let fire = pool
                .idle
                .idle_since(&name)
                .await
                .is_none_or(|idle| idle >= TIMER_INTERVAL);
            if fire {
                pool.enqueue(ReconcileRequest {
                    name,
                    kind: EventKind::Timer,
                });
            }
        }
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keyed_locks_same_name_same_lock() {
        let locks = KeyedLocks::new();
        let a = locks.get("demo").await;
        let b = locks.get("demo").await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_keyed_locks_distinct_names_distinct_locks() {
        let locks = KeyedLocks::new();
        let a = locks.get("demo").await;
        let b = locks.get("other").await;
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_keyed_lock_serializes_same_name() {
        let locks = KeyedLocks::new();
        let lock = locks.get("demo").await;
        let guard = lock.lock().await;
        // A second handler for the same store must queue behind the first.
        assert!(locks.get("demo").await.try_lock().is_err());
        drop(guard);
        assert!(locks.get("demo").await.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_distinct_names_do_not_block_each_other() {
        let locks = KeyedLocks::new();
        let demo = locks.get("demo").await;
        let _guard = demo.lock().await;
        assert!(locks.get("other").await.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_idle_tracker_unseen_store_has_no_timestamp() {
        let idle = IdleTracker::new();
        assert!(idle.idle_since("demo").await.is_none());
    }

    #[tokio::test]
    async fn test_idle_tracker_marks_and_measures() {
        let idle = IdleTracker::new();
        idle.mark("demo").await;
        let since = idle.idle_since("demo").await.expect("marked store");
        assert!(since < Duration::from_secs(1));
    }

    #[test]
    fn test_event_kinds_are_distinct() {
        assert_ne!(EventKind::Apply, EventKind::Timer);
        assert_ne!(EventKind::Resume, EventKind::Timer);
    }
}
