//! Lookout in-RAM store: pending queue, kind stores and the flush engine.
//!
//! A single spawned task owns every mutable structure. Writers hand it change
//! operations through an unbounded channel; once per flush period it drains
//! everything queued, applies per kind in arrival order, publishes immutable
//! snapshots behind `ArcSwap`, and refreshes the derived views. Readers never
//! take a lock on the hot path.

#![forbid(unsafe_code)]

use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use lookout_core::{ChangeOp, Identity, KindKey, KindSnapshot, OpKind, WatchEvent, POD_KIND};
use lookout_derived::usergroup::{
    self, UserGroupSnapshot, CLUSTER_ROLE_BINDING_KIND, CLUSTER_ROLE_KIND, ROLE_BINDING_KIND,
    ROLE_KIND,
};
use lookout_derived::PodsByNode;
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Shared empty snapshot handed out for kinds nothing has touched yet, so
/// repeated reads of an unknown kind compare reference-equal.
static EMPTY_SNAPSHOT: Lazy<Arc<KindSnapshot>> = Lazy::new(|| Arc::new(KindSnapshot::default()));

/// Engine options. The flush period is the single recognized knob.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub flush_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(100),
        }
    }
}

impl EngineConfig {
    /// Defaults with `LOOKOUT_FLUSH_MS` applied when set and parsable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(ms) = std::env::var("LOOKOUT_FLUSH_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            cfg.flush_interval = Duration::from_millis(ms.max(1));
        }
        cfg
    }
}

/// Counters exposed for status bars and tests.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EngineStats {
    /// Completed flush ticks.
    pub ticks: u64,
    /// Ops absorbed from the ingest channel so far.
    pub ops_ingested: u64,
    /// Ops applied to kind stores so far.
    pub ops_applied: u64,
    /// Registered kind stores.
    pub kinds: usize,
    /// Synthesized user groups in the current snapshot.
    pub user_groups: usize,
}

/// Append-only ingest buffer, drained once per tick. Arrival order is the
/// only order it knows.
#[derive(Default)]
pub struct PendingQueue {
    ops: Vec<ChangeOp>,
    pushed: u64,
}

impl PendingQueue {
    pub fn push(&mut self, op: ChangeOp) {
        self.ops.push(op);
        self.pushed += 1;
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Total ops ever pushed, for cutoff accounting.
    pub fn pushed(&self) -> u64 {
        self.pushed
    }

    /// Take everything queued so far, in arrival order.
    pub fn drain_ready(&mut self) -> Vec<ChangeOp> {
        std::mem::take(&mut self.ops)
    }
}

/// Identity-to-object state for one kind. Mutated only by the engine task;
/// readers go through the published snapshot.
pub struct KindStore {
    kind_key: KindKey,
    live: FxHashMap<Identity, Arc<Value>>,
    epoch: u64,
    snap: Arc<ArcSwap<KindSnapshot>>,
    epoch_tx: watch::Sender<u64>,
}

impl KindStore {
    pub fn new(kind_key: KindKey) -> (Self, KindHandle) {
        let snap = Arc::new(ArcSwap::from_pointee(KindSnapshot::default()));
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let handle = KindHandle {
            snap: Arc::clone(&snap),
            epoch_rx,
        };
        let store = Self {
            kind_key,
            live: FxHashMap::default(),
            epoch: 0,
            snap,
            epoch_tx,
        };
        (store, handle)
    }

    /// Apply one tick's operations in arrival order. Returns true when the
    /// held content changed and a publish is due. An upsert replaces the
    /// whole object; re-upserting an identical object is not a change.
    pub fn apply_in_order<I: IntoIterator<Item = ChangeOp>>(&mut self, ops: I) -> bool {
        let mut changed = false;
        for op in ops {
            match op.op {
                OpKind::Upsert => {
                    let obj = Arc::new(op.raw);
                    let prev = self.live.insert(op.identity, Arc::clone(&obj));
                    if prev.map_or(true, |p| *p != *obj) {
                        changed = true;
                    }
                }
                OpKind::Delete => {
                    if self.live.remove(&op.identity).is_some() {
                        changed = true;
                    }
                }
            }
        }
        changed
    }

    /// Freeze the live map into a fresh snapshot and notify subscribers.
    pub fn publish(&mut self) -> Arc<KindSnapshot> {
        self.epoch += 1;
        let next = Arc::new(KindSnapshot {
            epoch: self.epoch,
            items: self.live.clone(),
        });
        self.snap.store(Arc::clone(&next));
        let _ = self.epoch_tx.send(self.epoch);
        debug!(
            kind = %self.kind_key,
            epoch = next.epoch,
            items = next.len(),
            "snapshot published"
        );
        next
    }

    pub fn current(&self) -> Arc<KindSnapshot> {
        self.snap.load_full()
    }
}

/// Read-side handle to one kind store.
#[derive(Clone)]
pub struct KindHandle {
    snap: Arc<ArcSwap<KindSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl KindHandle {
    pub fn current(&self) -> Arc<KindSnapshot> {
        self.snap.load_full()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }
}

/// Lazily allocates one store per kind key. Nothing is ever deregistered;
/// a kind observed once keeps its (possibly empty) store.
pub struct KindRegistry {
    stores: FxHashMap<KindKey, KindStore>,
    shared: Arc<Shared>,
}

impl KindRegistry {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            stores: FxHashMap::default(),
            shared,
        }
    }

    /// Existing store for `kind_key`, or a fresh empty one registered on the
    /// spot.
    pub fn resolve(&mut self, kind_key: &str) -> &mut KindStore {
        let next_len = self.stores.len() + 1;
        match self.stores.entry(kind_key.to_string()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let (store, handle) = KindStore::new(kind_key.to_string());
                self.shared
                    .kinds
                    .lock()
                    .unwrap()
                    .insert(kind_key.to_string(), handle);
                metrics::gauge!("engine_kinds", next_len as f64);
                info!(kind = %kind_key, "kind store registered");
                e.insert(store)
            }
        }
    }

    pub fn get(&self, kind_key: &str) -> Option<&KindStore> {
        self.stores.get(kind_key)
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

/// Reader-visible state, updated by the engine task.
struct Shared {
    kinds: Mutex<FxHashMap<KindKey, KindHandle>>,
    pods_by_node: ArcSwap<PodsByNode>,
    user_groups: ArcSwap<UserGroupSnapshot>,
    stats: Mutex<EngineStats>,
}

/// Write boundary. `ingest` never blocks and never fails; events sent after
/// the engine stopped are silently dropped (the cache is best-effort by
/// then).
#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::UnboundedSender<ChangeOp>,
}

impl IngestHandle {
    pub fn ingest(&self, event: WatchEvent) {
        let _ = self.tx.send(ChangeOp::from_event(event));
    }
}

/// Read boundary over every kind store and derived view.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
    tick_rx: watch::Receiver<u64>,
}

impl EngineHandle {
    /// Current snapshot for a kind. Unknown kinds read as the shared empty
    /// snapshot.
    pub fn snapshot(&self, kind_key: &str) -> Arc<KindSnapshot> {
        match self.shared.kinds.lock().unwrap().get(kind_key) {
            Some(h) => h.current(),
            None => Arc::clone(&EMPTY_SNAPSHOT),
        }
    }

    pub fn kind(&self, kind_key: &str) -> Option<KindHandle> {
        self.shared.kinds.lock().unwrap().get(kind_key).cloned()
    }

    /// Kind keys observed so far, sorted.
    pub fn kinds(&self) -> Vec<KindKey> {
        let mut keys: Vec<KindKey> = self.shared.kinds.lock().unwrap().keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Pod identities on `node` as of the last completed tick.
    pub fn pods_on_node(&self, node: &str) -> Vec<Identity> {
        self.shared.pods_by_node.load().pods_on(node).to_vec()
    }

    pub fn user_groups(&self) -> Arc<UserGroupSnapshot> {
        self.shared.user_groups.load_full()
    }

    /// Completed-tick counter; bumps once per flush, ops or not.
    pub fn subscribe_ticks(&self) -> watch::Receiver<u64> {
        self.tick_rx.clone()
    }

    pub fn stats(&self) -> EngineStats {
        *self.shared.stats.lock().unwrap()
    }
}

/// Spawn the flush engine. Returns the write handle (clone one per producer;
/// dropping the last makes the engine drain and stop) and the read handle.
pub fn spawn_engine(cfg: EngineConfig) -> (IngestHandle, EngineHandle) {
    let (tx, rx) = mpsc::unbounded_channel::<ChangeOp>();
    let shared = Arc::new(Shared {
        kinds: Mutex::new(FxHashMap::default()),
        pods_by_node: ArcSwap::from_pointee(PodsByNode::default()),
        user_groups: ArcSwap::from_pointee(UserGroupSnapshot::default()),
        stats: Mutex::new(EngineStats::default()),
    });
    let (tick_tx, tick_rx) = watch::channel(0u64);
    let engine = Engine {
        rx,
        queue: PendingQueue::default(),
        registry: KindRegistry::new(Arc::clone(&shared)),
        shared: Arc::clone(&shared),
        tick_tx,
        ticks: 0,
        ops_applied: 0,
        ops_counted: 0,
        last_pods: Arc::clone(&EMPTY_SNAPSHOT),
        last_rbac: [
            Arc::clone(&EMPTY_SNAPSHOT),
            Arc::clone(&EMPTY_SNAPSHOT),
            Arc::clone(&EMPTY_SNAPSHOT),
            Arc::clone(&EMPTY_SNAPSHOT),
        ],
    };
    let period = cfg.flush_interval;
    tokio::spawn(async move {
        info!(period_ms = %period.as_millis(), "engine loop started");
        engine.run(period).await;
    });
    (IngestHandle { tx }, EngineHandle { shared, tick_rx })
}

struct Engine {
    rx: mpsc::UnboundedReceiver<ChangeOp>,
    queue: PendingQueue,
    registry: KindRegistry,
    shared: Arc<Shared>,
    tick_tx: watch::Sender<u64>,
    ticks: u64,
    ops_applied: u64,
    ops_counted: u64,
    last_pods: Arc<KindSnapshot>,
    last_rbac: [Arc<KindSnapshot>; 4],
}

impl Engine {
    async fn run(mut self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                maybe = self.rx.recv() => {
                    match maybe {
                        Some(op) => self.queue.push(op),
                        None => {
                            debug!("ingest channel closed; draining and exiting engine loop");
                            self.flush();
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.flush();
                }
            }
        }
        info!(ticks = self.ticks, "engine loop stopped");
    }

    fn flush(&mut self) {
        let started = Instant::now();
        // Absorb whatever already sits in the channel so this tick's cutoff
        // covers every op sent before the flush began.
        while let Ok(op) = self.rx.try_recv() {
            self.queue.push(op);
        }
        let pushed = self.queue.pushed();
        if pushed > self.ops_counted {
            metrics::counter!("engine_ops_ingested", pushed - self.ops_counted);
            self.ops_counted = pushed;
        }
        let batch = self.queue.drain_ready();
        let applied = batch.len();
        if !batch.is_empty() {
            // Partition by kind, preserving arrival order within each kind.
            let mut by_kind: FxHashMap<KindKey, Vec<ChangeOp>> = FxHashMap::default();
            for op in batch {
                by_kind.entry(op.kind_key.clone()).or_default().push(op);
            }
            for (kind_key, ops) in by_kind {
                let store = self.registry.resolve(&kind_key);
                if store.apply_in_order(ops) {
                    store.publish();
                }
            }
            self.ops_applied += applied as u64;
            metrics::counter!("engine_ops_applied", applied as u64);
        }
        self.refresh_derived();
        self.ticks += 1;
        {
            let mut stats = self.shared.stats.lock().unwrap();
            stats.ticks = self.ticks;
            stats.ops_ingested = self.queue.pushed();
            stats.ops_applied = self.ops_applied;
            stats.kinds = self.registry.len();
            stats.user_groups = self.shared.user_groups.load().len();
        }
        let _ = self.tick_tx.send(self.ticks);
        metrics::histogram!("engine_flush_ms", started.elapsed().as_secs_f64() * 1000.0);
        if applied > 0 {
            debug!(ops = applied, "flush tick");
        }
    }

    /// Rebuild derived views whose inputs got a new snapshot this tick.
    /// Reference comparison makes the no-change case free.
    fn refresh_derived(&mut self) {
        let pods = self.snapshot_of(POD_KIND);
        if !Arc::ptr_eq(&pods, &self.last_pods) {
            let index = PodsByNode::rebuild(&pods);
            debug!(
                nodes = index.node_count(),
                pods = pods.len(),
                "pods-by-node index rebuilt"
            );
            metrics::counter!("engine_index_rebuilds", 1);
            self.shared.pods_by_node.store(Arc::new(index));
            self.last_pods = pods;
        }

        let rbac = [
            self.snapshot_of(ROLE_KIND),
            self.snapshot_of(ROLE_BINDING_KIND),
            self.snapshot_of(CLUSTER_ROLE_KIND),
            self.snapshot_of(CLUSTER_ROLE_BINDING_KIND),
        ];
        let rbac_changed = rbac
            .iter()
            .zip(self.last_rbac.iter())
            .any(|(a, b)| !Arc::ptr_eq(a, b));
        if rbac_changed {
            let groups = usergroup::synthesize(&rbac[0], &rbac[1], &rbac[2], &rbac[3]);
            let prev = self.shared.user_groups.load();
            // Inputs changed but the join may not have; only an actual
            // difference bumps the epoch readers see.
            if groups != prev.groups {
                let next = UserGroupSnapshot {
                    epoch: prev.epoch + 1,
                    groups,
                };
                debug!(groups = next.len(), epoch = next.epoch, "user groups recomputed");
                metrics::gauge!("engine_user_groups", next.len() as f64);
                self.shared.user_groups.store(Arc::new(next));
            }
            self.last_rbac = rbac;
        }
    }

    fn snapshot_of(&self, kind_key: &str) -> Arc<KindSnapshot> {
        match self.registry.get(kind_key) {
            Some(store) => store.current(),
            None => Arc::clone(&EMPTY_SNAPSHOT),
        }
    }
}
