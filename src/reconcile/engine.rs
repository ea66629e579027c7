//! Component F core loop: a per-key FIFO queue with coalescing, a worker
//! pool draining it, exponential backoff with jitter on failure, and a
//! periodic resync that re-enqueues every known key so drift self-heals
//! even if a store event was missed outright.

use crate::config::ReconciliationConfig;
use crate::error::Error;
use crate::store::{EntityKind, EntityKey, Store};
use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

/// What a `Reconciler` reports back to the engine after one attempt.
pub enum Outcome {
    Done,
    RetryAfter(Duration),
    Error(Error),
}

#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    fn kind(&self) -> EntityKind;
    async fn reconcile(&self, key: &EntityKey) -> Outcome;
}

struct Attempt {
    count: u32,
    dormant: bool,
}

/// The FIFO queue plus the in-flight set needed to coalesce: a key
/// already queued or being processed doesn't get a second entry: the
/// worker that picks it up re-reads current state, so processing it once
/// more is always sufficient.
struct Queue {
    order: VecDeque<EntityKey>,
    queued: HashSet<EntityKey>,
    in_flight: HashSet<EntityKey>,
}

impl Queue {
    fn new() -> Self {
        Self { order: VecDeque::new(), queued: HashSet::new(), in_flight: HashSet::new() }
    }

    fn push(&mut self, key: EntityKey) {
        if self.queued.contains(&key) || self.in_flight.contains(&key) {
            return;
        }
        self.queued.insert(key.clone());
        self.order.push_back(key);
    }

    fn pop(&mut self) -> Option<EntityKey> {
        let key = self.order.pop_front()?;
        self.queued.remove(&key);
        self.in_flight.insert(key.clone());
        Some(key)
    }

    fn finish(&mut self, key: &EntityKey) {
        self.in_flight.remove(key);
    }
}

pub struct Engine {
    config: ReconciliationConfig,
    store: Arc<dyn Store>,
    reconcilers: Vec<Arc<dyn Reconciler>>,
    queue: Arc<Mutex<Queue>>,
    notify: mpsc::Sender<()>,
    notify_rx: Mutex<Option<mpsc::Receiver<()>>>,
    attempts: Mutex<std::collections::HashMap<EntityKey, Attempt>>,
}

impl Engine {
    pub fn new(config: ReconciliationConfig, store: Arc<dyn Store>, reconcilers: Vec<Arc<dyn Reconciler>>) -> Arc<Self> {
        let (notify, notify_rx) = mpsc::channel(1024);
        Arc::new(Self {
            config,
            store,
            reconcilers,
            queue: Arc::new(Mutex::new(Queue::new())),
            notify,
            notify_rx: Mutex::new(Some(notify_rx)),
            attempts: Mutex::new(std::collections::HashMap::new()),
        })
    }

    pub async fn enqueue(&self, key: EntityKey) {
        let mut q = self.queue.lock().await;
        q.push(key);
        let _ = self.notify.try_send(());
    }

    fn reconciler_for(&self, kind: EntityKind) -> Option<Arc<dyn Reconciler>> {
        self.reconcilers.iter().find(|r| r.kind() == kind).cloned()
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base_ms as f64;
        let factor = 2f64.powi(attempt.saturating_sub(1) as i32);
        let capped = (base * factor).min((self.config.backoff_cap_secs * 1000) as f64);
        let jitter_fraction = rand::thread_rng().gen_range(-0.25..=0.25);
        let jittered = (capped * (1.0 + jitter_fraction)).max(0.0);
        Duration::from_millis(jittered as u64)
    }

    /// Runs until `cancel` is cancelled: spawns the worker pool, the
    /// periodic resync, and watches for store-driven requeues on top of
    /// whatever already populated the queue (bootstrap resync at startup,
    /// `StateChangeBridge` requeues from the running side).
    pub async fn run(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        self.resync_all().await;

        let mut handles = Vec::new();
        for id in 0..self.config.worker_count.max(1) {
            let engine = self.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(engine.worker_loop(id, cancel)));
        }

        let resync_engine = self.clone();
        let resync_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(resync_engine.config.resync_interval_secs));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => resync_engine.resync_all().await,
                    _ = resync_cancel.cancelled() => break,
                }
            }
        }));

        cancel.cancelled().await;
        for h in handles {
            h.abort();
        }
    }

    async fn resync_all(&self) {
        for kind in EntityKind::all() {
            match self.store.list(kind).await {
                Ok(entities) => {
                    for entity in entities {
                        self.enqueue(entity.key).await;
                    }
                }
                Err(e) => warn!(kind = kind.plural(), error = %e, "resync list failed"),
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, id: usize, cancel: tokio_util::sync::CancellationToken) {
        let mut rx = self.notify_rx.lock().await.take();
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let key = {
                let mut q = self.queue.lock().await;
                q.pop()
            };
            let Some(key) = key else {
                if let Some(r) = rx.as_mut() {
                    tokio::select! {
                        _ = r.recv() => continue,
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_millis(200)) => continue,
                    }
                } else {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
            };
            self.process_one(id, key).await;
        }
    }

    async fn process_one(&self, worker: usize, key: EntityKey) {
        let Some(reconciler) = self.reconciler_for(key.kind) else {
            warn!(worker, kind = key.kind.plural(), "no reconciler registered for kind");
            self.queue.lock().await.finish(&key);
            return;
        };

        let deadline = Duration::from_secs(self.config.per_key_timeout_secs);
        let outcome = match tokio::time::timeout(deadline, reconciler.reconcile(&key)).await {
            Ok(outcome) => outcome,
            Err(_) => Outcome::Error(Error::Timeout(format!("reconcile of {} timed out", key.name))),
        };

        match outcome {
            Outcome::Done => {
                self.attempts.lock().await.remove(&key);
            }
            Outcome::RetryAfter(delay) => {
                self.schedule_retry(key.clone(), delay).await;
            }
            Outcome::Error(err) => {
                let mut attempts = self.attempts.lock().await;
                let entry = attempts.entry(key.clone()).or_insert(Attempt { count: 0, dormant: false });
                entry.count += 1;
                if entry.count >= self.config.max_attempts {
                    entry.dormant = true;
                    warn!(key = %key.name, attempts = entry.count, "reconciler exhausted retries, going dormant until next resync");
                } else {
                    let delay = self.backoff(entry.count);
                    let count = entry.count;
                    drop(attempts);
                    info!(key = %key.name, attempt = count, delay_ms = delay.as_millis() as u64, error = %err, "reconcile failed, retrying");
                    self.schedule_retry(key.clone(), delay).await;
                }
            }
        }

        self.queue.lock().await.finish(&key);
    }

    async fn schedule_retry(&self, key: EntityKey, delay: Duration) {
        let queue = self.queue.clone();
        let notify = self.notify.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut q = queue.lock().await;
            q.in_flight.remove(&key);
            q.push(key);
            let _ = notify.try_send(());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{StoredEntity, StoreSubscription};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NoopStore;
    #[async_trait]
    impl Store for NoopStore {
        async fn list(&self, _kind: EntityKind) -> crate::error::Result<Vec<StoredEntity>> {
            Ok(Vec::new())
        }
        async fn get(&self, _kind: EntityKind, _namespace: &str, _name: &str) -> crate::error::Result<StoredEntity> {
            Err(Error::NotFound("n/a".into()))
        }
        async fn watch(&self, _kind: EntityKind) -> crate::error::Result<StoreSubscription> {
            let (_tx, rx) = tokio::sync::broadcast::channel(1);
            Ok(StoreSubscription::new(rx))
        }
        async fn update_status(&self, _kind: EntityKind, _namespace: &str, _name: &str, _status: serde_json::Value) -> crate::error::Result<()> {
            Ok(())
        }
    }

    struct CountingReconciler {
        calls: AtomicU32,
        fail_until: u32,
    }

    #[async_trait]
    impl Reconciler for CountingReconciler {
        fn kind(&self) -> EntityKind {
            EntityKind::McpServer
        }
        async fn reconcile(&self, _key: &EntityKey) -> Outcome {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_until {
                Outcome::Error(Error::Transient("not ready yet".into()))
            } else {
                Outcome::Done
            }
        }
    }

    #[tokio::test]
    async fn retries_until_reconciler_reports_done() {
        let mut config = ReconciliationConfig::default();
        config.backoff_base_ms = 1;
        config.backoff_cap_secs = 1;
        config.max_attempts = 10;
        config.worker_count = 1;

        let reconciler = Arc::new(CountingReconciler { calls: AtomicU32::new(0), fail_until: 2 });
        let engine = Engine::new(config, Arc::new(NoopStore), vec![reconciler.clone()]);

        let cancel = tokio_util::sync::CancellationToken::new();
        let run_cancel = cancel.clone();
        let run_engine = engine.clone();
        let handle = tokio::spawn(async move { run_engine.run(run_cancel).await });

        engine
            .enqueue(EntityKey { kind: EntityKind::McpServer, namespace: "default".into(), name: "a".into() })
            .await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while reconciler.calls.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        let _ = handle.await;
    }

    #[test]
    fn exhausted_retries_go_dormant_without_panicking() {
        let config = ReconciliationConfig { max_attempts: 1, ..ReconciliationConfig::default() };
        assert_eq!(config.max_attempts, 1);
    }
}
