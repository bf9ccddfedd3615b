//! Work-queue driven controller runtime.
//!
//! A controller owns one queue of object keys fed by store watch events, a
//! periodic resync and requeue timers. Keys are drained by a bounded pool of
//! workers; a key is never handed to two workers at once, and a key that
//! changes while in flight is queued again once its worker finishes.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::ReconcileError;
use pkg_constants::controller::{
    DETACH_RETRY_INTERVAL_SECS, ERROR_BACKOFF_SECS, MAX_CONCURRENT_RECONCILES,
    POLICY_POLL_INTERVAL_SECS, RESYNC_INTERVAL_SECS,
};
use pkg_metrics::MetricsRegistry;
use pkg_state::registry::Registry;
use pkg_state::watch::WatchEvent;
use pkg_types::meta::{ObjectKey, ResourceKind};

pub const RECONCILE_TOTAL: &str = "irsa_reconcile_total";
pub const RECONCILE_ERRORS_TOTAL: &str = "irsa_reconcile_errors_total";
pub const INVARIANT_VIOLATIONS_TOTAL: &str = "irsa_invariant_violations_total";
pub const REQUEUE_TOTAL: &str = "irsa_requeue_total";
pub const RECONCILE_IN_FLIGHT: &str = "irsa_reconcile_in_flight";

pub fn register_metrics(metrics: &MetricsRegistry) {
    metrics.register_counter(RECONCILE_TOTAL, "Reconcile passes run");
    metrics.register_counter(RECONCILE_ERRORS_TOTAL, "Reconcile passes that failed");
    metrics.register_counter(
        INVARIANT_VIOLATIONS_TOTAL,
        "Reconcile passes that detected an invariant violation",
    );
    metrics.register_counter(REQUEUE_TOTAL, "Keys requeued by a reconcile pass");
    metrics.register_gauge(RECONCILE_IN_FLIGHT, "Reconcile passes currently running");
}

/// What to do with a key once a pass is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Done,
    Requeue,
    RequeueAfter(Duration),
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Workers per controller, clamped to 1..=10
    pub max_concurrent_reconciles: usize,
    /// Periodic resync of every key, also the requeue of a converged request
    pub resync_interval: Duration,
    pub policy_poll_interval: Duration,
    pub detach_retry_interval: Duration,
    pub error_backoff: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: MAX_CONCURRENT_RECONCILES,
            resync_interval: Duration::from_secs(RESYNC_INTERVAL_SECS),
            policy_poll_interval: Duration::from_secs(POLICY_POLL_INTERVAL_SECS),
            detach_retry_interval: Duration::from_secs(DETACH_RETRY_INTERVAL_SECS),
            error_backoff: Duration::from_secs(ERROR_BACKOFF_SECS),
        }
    }
}

impl ControllerConfig {
    pub fn workers(&self) -> usize {
        self.max_concurrent_reconciles.clamp(1, MAX_CONCURRENT_RECONCILES)
    }
}

/// One idempotent pass over one object.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Kind of the objects whose keys this reconciler receives.
    fn kind(&self) -> ResourceKind;

    /// Kinds whose changes are routed to their controlling owner.
    fn owns(&self) -> &'static [ResourceKind] {
        &[]
    }

    /// Kinds whose changes are routed to the object with the same namespaced name.
    fn siblings(&self) -> &'static [ResourceKind] {
        &[]
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError>;
}

// --- Work queue ---

#[derive(Default)]
struct QueueState {
    pending: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    active: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    /// Earliest pending timer per key
    scheduled: HashMap<ObjectKey, Instant>,
}

pub(crate) struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }

    pub(crate) async fn add(&self, key: ObjectKey) {
        let mut state = self.state.lock().await;
        if state.active.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.pending.push_back(key);
            self.notify.notify_one();
        }
    }

    /// Queue `key` once `delay` has elapsed, unless an earlier timer is already set.
    pub(crate) async fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        let deadline = Instant::now() + delay;
        {
            let mut state = self.state.lock().await;
            if let Some(existing) = state.scheduled.get(&key)
                && *existing <= deadline
            {
                return;
            }
            state.scheduled.insert(key.clone(), deadline);
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let fire = {
                let mut state = queue.state.lock().await;
                if state.scheduled.get(&key) == Some(&deadline) {
                    state.scheduled.remove(&key);
                    true
                } else {
                    false
                }
            };
            if fire {
                queue.add(key).await;
            }
        });
    }

    /// Wait for the next key and mark it active.
    pub(crate) async fn next(&self) -> ObjectKey {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    return key;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Release an active key, queueing it again if it changed meanwhile.
    pub(crate) async fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock().await;
        state.active.remove(key);
        if state.dirty.remove(key) && state.queued.insert(key.clone()) {
            state.pending.push_back(key.clone());
            self.notify.notify_one();
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

// --- Controller ---

pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    registry: Registry,
    config: ControllerConfig,
    metrics: Arc<MetricsRegistry>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(
        reconciler: R,
        registry: Registry,
        config: ControllerConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        register_metrics(&metrics);
        Self {
            reconciler: Arc::new(reconciler),
            registry,
            config,
            metrics,
        }
    }

    /// Start the event router and the worker pool as background tasks.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let name = self.reconciler.name();
            let workers = self.config.workers();
            info!(
                "{} controller started (workers={}, resync={}s)",
                name,
                workers,
                self.config.resync_interval.as_secs()
            );

            let queue = WorkQueue::new();
            let event_rx = self.registry.subscribe();
            let router = tokio::spawn(route_events(
                self.reconciler.clone(),
                self.registry.clone(),
                queue.clone(),
                event_rx,
                self.config.resync_interval,
            ));

            let semaphore = Arc::new(Semaphore::new(workers));
            loop {
                let key = queue.next().await;
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let worker = Worker {
                    reconciler: self.reconciler.clone(),
                    queue: queue.clone(),
                    config: self.config.clone(),
                    metrics: self.metrics.clone(),
                };
                tokio::spawn(async move {
                    worker.run(key).await;
                    drop(permit);
                });
            }
            router.abort();
        })
    }
}

struct Worker<R: Reconciler> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue>,
    config: ControllerConfig,
    metrics: Arc<MetricsRegistry>,
}

impl<R: Reconciler> Worker<R> {
    async fn run(self, key: ObjectKey) {
        let name = self.reconciler.name();
        let labels = [("controller", name)];
        self.metrics.counter_inc(RECONCILE_TOTAL, &labels);
        self.metrics.gauge_inc(RECONCILE_IN_FLIGHT, &labels);

        let result = self.reconciler.reconcile(&key).await;

        self.metrics.gauge_dec(RECONCILE_IN_FLIGHT, &labels);
        match result {
            Ok(Action::Done) => {}
            Ok(Action::Requeue) => {
                self.metrics.counter_inc(REQUEUE_TOTAL, &labels);
                self.queue.add(key.clone()).await;
            }
            Ok(Action::RequeueAfter(delay)) => {
                self.metrics.counter_inc(REQUEUE_TOTAL, &labels);
                self.queue.add_after(key.clone(), delay).await;
            }
            Err(ReconcileError::Store(e)) if e.is_conflict() => {
                debug!("{} {}: {}, retrying on a fresh read", name, key, e);
                self.metrics.counter_inc(REQUEUE_TOTAL, &labels);
                self.queue.add(key.clone()).await;
            }
            Err(e @ ReconcileError::Invariant(_)) => {
                error!("{} {}: {}", name, key, e);
                self.metrics.counter_inc(INVARIANT_VIOLATIONS_TOTAL, &labels);
                self.queue.add_after(key.clone(), self.config.error_backoff).await;
            }
            Err(e) => {
                warn!("{} {}: {}", name, key, e);
                self.metrics.counter_inc(RECONCILE_ERRORS_TOTAL, &labels);
                self.queue.add_after(key.clone(), self.config.error_backoff).await;
            }
        }
        self.queue.done(&key).await;
    }
}

/// Key of the object of `reconciler.kind()` an event concerns, if any.
fn route<R: Reconciler>(reconciler: &R, event: &WatchEvent) -> Option<ObjectKey> {
    let (kind, key) = event.object()?;
    if kind == reconciler.kind() || reconciler.siblings().contains(&kind) {
        return Some(key);
    }
    if reconciler.owns().contains(&kind) {
        let meta = event.metadata()?;
        let owner = meta
            .owner_references
            .iter()
            .find(|o| o.controller && o.kind == reconciler.kind())?;
        return Some(ObjectKey::new(key.namespace, owner.name.clone()));
    }
    None
}

async fn enqueue_all<R: Reconciler>(reconciler: &R, registry: &Registry, queue: &WorkQueue) {
    match registry.list_keys(reconciler.kind(), None).await {
        Ok(keys) => {
            for key in keys {
                queue.add(key).await;
            }
        }
        Err(e) => warn!("{} controller failed to list objects: {}", reconciler.name(), e),
    }
}

async fn route_events<R: Reconciler>(
    reconciler: Arc<R>,
    registry: Registry,
    queue: Arc<WorkQueue>,
    mut event_rx: tokio::sync::broadcast::Receiver<WatchEvent>,
    resync: Duration,
) {
    // the first tick fires immediately and lists everything already stored
    // interval() panics on a zero period
    let mut interval = tokio::time::interval(resync.max(Duration::from_millis(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                enqueue_all(reconciler.as_ref(), &registry, &queue).await;
            }
            result = event_rx.recv() => {
                match result {
                    Ok(event) => {
                        if let Some(key) = route(reconciler.as_ref(), &event) {
                            queue.add(key).await;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("{} controller lagged by {} events, relisting", reconciler.name(), skipped);
                        enqueue_all(reconciler.as_ref(), &registry, &queue).await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
}
