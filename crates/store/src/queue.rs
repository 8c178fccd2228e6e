//! Delta queue: per-key ordered pending deltas plus a FIFO of keys with work.
//!
//! The queue is unbounded. When the reflector outpaces the processor memory grows
//! without limit; depth is exported as a gauge and a warning is logged at every
//! `queue_warn_depth` step, but nothing is ever dropped to relieve pressure.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kinform_core::{Delta, DeltaKind, InformerConfig, Object, ResourceKey, ResourceVersion};
use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::{smallvec, SmallVec};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Store, SyncBarrier};

pub type Deltas<T> = SmallVec<[Delta<T>; 2]>;

struct Pending<T> {
    deltas: Deltas<T>,
    /// Counted toward the sync barrier's initial population.
    initial: bool,
}

/// Batches of one key handed out by `pop` and not yet reported `done`.
struct InFlight<T> {
    batches: usize,
    /// Outcome of the newest handed-out batch; `Some(None)` means deleted.
    state: Option<Option<Arc<T>>>,
}

/// Every pending delta of one key, handed out by `pop`.
#[derive(Debug)]
pub struct Batch<T> {
    pub key: ResourceKey,
    pub deltas: Deltas<T>,
    pub initial: bool,
}

/// Returned by a `pop` callback that could not take the batch; it goes back on the queue.
#[derive(Debug)]
pub struct Unprocessed<T> {
    pub batch: Batch<T>,
    pub error: anyhow::Error,
}

struct QueueInner<T> {
    items: FxHashMap<ResourceKey, Pending<T>>,
    order: VecDeque<ResourceKey>,
    in_flight: FxHashMap<ResourceKey, InFlight<T>>,
    cursor: Option<ResourceVersion>,
    closed: bool,
    warned_at: usize,
}

pub struct DeltaQueue<T> {
    inner: Mutex<QueueInner<T>>,
    notify: Notify,
    known: Arc<Store<T>>,
    barrier: Arc<SyncBarrier>,
    requeue_on_failure: bool,
    warn_depth: usize,
}

impl<T: Object> DeltaQueue<T> {
    pub fn new(known: Arc<Store<T>>, barrier: Arc<SyncBarrier>, config: &InformerConfig) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: FxHashMap::default(),
                order: VecDeque::new(),
                in_flight: FxHashMap::default(),
                cursor: None,
                closed: false,
                warned_at: 0,
            }),
            notify: Notify::new(),
            known,
            barrier,
            requeue_on_failure: config.requeue_on_failure,
            warn_depth: config.queue_warn_depth.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keys with pending work.
    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys with a handed-out batch that has not been applied yet.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Resource version of the last full list.
    pub fn cursor(&self) -> Option<ResourceVersion> {
        self.lock().cursor.clone()
    }

    /// Pending delta kinds for `key`, oldest first.
    pub fn pending_kinds(&self, key: &ResourceKey) -> Vec<DeltaKind> {
        self.lock().items.get(key).map(|p| p.deltas.iter().map(|d| d.kind).collect()).unwrap_or_default()
    }

    pub fn put(&self, delta: Delta<T>) {
        let mut inner = self.lock();
        if inner.closed {
            debug!(key = %delta.key, "put after close ignored");
            return;
        }
        self.push_locked(&mut inner, delta);
        self.after_push(&mut inner);
        drop(inner);
        self.notify.notify_one();
    }

    pub fn add(&self, obj: T) {
        self.put(Delta::new(DeltaKind::Added, Arc::new(obj)));
    }

    pub fn update(&self, obj: T) {
        self.put(Delta::new(DeltaKind::Updated, Arc::new(obj)));
    }

    pub fn delete(&self, obj: T) {
        self.put(Delta::new(DeltaKind::Deleted, Arc::new(obj)));
    }

    fn push_locked(&self, inner: &mut QueueInner<T>, delta: Delta<T>) {
        counter!("kinform_deltas_enqueued_total", 1, "kind" => delta.kind.as_str());
        let key = delta.key.clone();
        match inner.items.get_mut(&key) {
            Some(p) => {
                // Added then Deleted before either was processed: the object never existed.
                if delta.kind == DeltaKind::Deleted && p.deltas.len() == 1 && p.deltas[0].kind == DeltaKind::Added {
                    let initial = p.initial;
                    inner.items.remove(&key);
                    inner.order.retain(|k| k != &key);
                    if initial {
                        self.barrier.complete_one();
                    }
                    debug!(key = %key, "add/delete pair compressed");
                    return;
                }
                p.deltas.push(delta);
            }
            None => {
                inner.items.insert(key.clone(), Pending { deltas: smallvec![delta], initial: false });
                inner.order.push_back(key);
            }
        }
    }

    fn after_push(&self, inner: &mut QueueInner<T>) {
        let depth = inner.order.len();
        gauge!("kinform_queue_depth", depth as f64);
        let step = depth / self.warn_depth;
        if step > inner.warned_at {
            warn!(depth, "delta queue keeps growing; processor is falling behind");
        }
        inner.warned_at = step;
    }

    /// Latest state of `key` as far as the queue can tell: the newest pending delta,
    /// else the newest batch still being applied, else the store.
    fn effective_known(&self, inner: &QueueInner<T>, key: &ResourceKey) -> Option<Arc<T>> {
        if let Some(state) = inner.items.get(key).and_then(|p| last_state(&p.deltas)) {
            return state;
        }
        if let Some(state) = inner.in_flight.get(key).and_then(|f| f.state.clone()) {
            return state;
        }
        self.known.get(key)
    }

    /// Reconcile against a full list: `Added` for new keys, `Updated` for changed versions,
    /// `Deleted` for keys that disappeared. The first call arms the sync barrier.
    pub fn replace(&self, items: Vec<T>, resource_version: ResourceVersion) {
        let mut inner = self.lock();
        if inner.closed {
            debug!("replace after close ignored");
            return;
        }
        let mut listed: FxHashSet<ResourceKey> = FxHashSet::default();
        let (mut added, mut updated, mut deleted) = (0usize, 0usize, 0usize);

        for obj in items {
            let key = obj.key();
            let kind = match self.effective_known(&inner, &key) {
                None => Some(DeltaKind::Added),
                Some(old) => {
                    let (was, now) = (old.resource_version(), obj.resource_version());
                    match (was, now) {
                        (Some(a), Some(b)) if a == b => None,
                        _ => Some(DeltaKind::Updated),
                    }
                }
            };
            listed.insert(key);
            match kind {
                Some(DeltaKind::Added) => added += 1,
                Some(_) => updated += 1,
                None => continue,
            }
            if let Some(kind) = kind {
                self.push_locked(&mut inner, Delta::new(kind, Arc::new(obj)));
            }
        }

        let mut candidates: Vec<ResourceKey> = self.known.keys();
        candidates.extend(inner.items.keys().cloned());
        candidates.extend(inner.in_flight.keys().cloned());
        candidates.sort_unstable();
        candidates.dedup();
        for key in candidates {
            if listed.contains(&key) {
                continue;
            }
            if let Some(last) = self.effective_known(&inner, &key) {
                deleted += 1;
                let delta = Delta { kind: DeltaKind::Deleted, key, object: last, enqueued_at: std::time::Instant::now() };
                self.push_locked(&mut inner, delta);
            }
        }

        inner.cursor = Some(resource_version.clone());
        if !self.barrier.is_populated() {
            for p in inner.items.values_mut() {
                p.initial = true;
            }
            let pending = inner.order.len();
            self.barrier.arm(pending);
            debug!(pending, "initial population recorded");
        }
        self.after_push(&mut inner);
        drop(inner);
        debug!(rv = %resource_version, added, updated, deleted, "replace applied");
        self.notify.notify_one();
    }

    /// Enqueue a `Sync` delta for every stored key with no pending or in-flight delta.
    pub fn resync(&self) -> usize {
        let mut inner = self.lock();
        if inner.closed {
            return 0;
        }
        let mut queued = 0;
        for key in self.known.keys() {
            if inner.items.contains_key(&key) || inner.in_flight.contains_key(&key) {
                continue;
            }
            if let Some(current) = self.known.get(&key) {
                let delta = Delta { kind: DeltaKind::Sync, key, object: current, enqueued_at: std::time::Instant::now() };
                self.push_locked(&mut inner, delta);
                queued += 1;
            }
        }
        if queued > 0 {
            self.after_push(&mut inner);
            drop(inner);
            self.notify.notify_one();
        }
        queued
    }

    fn try_take(&self) -> Option<Batch<T>> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }
        let key = inner.order.pop_front()?;
        let pending = inner.items.remove(&key)?;
        let flight = inner.in_flight.entry(key.clone()).or_insert(InFlight { batches: 0, state: None });
        flight.batches += 1;
        if let Some(state) = last_state(&pending.deltas) {
            flight.state = Some(state);
        }
        gauge!("kinform_queue_depth", inner.order.len() as f64);
        Some(Batch { key, deltas: pending.deltas, initial: pending.initial })
    }

    /// Wait for the oldest ready key and hand its deltas to `process`.
    ///
    /// Returns the processed key, or `None` once cancelled or closed.
    pub async fn pop<F, Fut>(&self, cancel: &CancellationToken, process: F) -> Option<ResourceKey>
    where
        F: FnOnce(Batch<T>) -> Fut,
        Fut: Future<Output = Result<(), Unprocessed<T>>>,
    {
        let batch = loop {
            if cancel.is_cancelled() || self.is_closed() {
                return None;
            }
            if let Some(batch) = self.try_take() {
                break batch;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => return None,
            }
        };
        let key = batch.key.clone();
        if let Err(Unprocessed { batch, error }) = process(batch).await {
            self.requeue(batch, error);
        }
        Some(key)
    }

    /// Report that a batch handed out by `pop` for `key` has been applied to the store.
    pub fn done(&self, key: &ResourceKey) {
        let mut inner = self.lock();
        Self::land_locked(&mut inner, key);
    }

    fn land_locked(inner: &mut QueueInner<T>, key: &ResourceKey) {
        let finished = match inner.in_flight.get_mut(key) {
            Some(f) => {
                f.batches = f.batches.saturating_sub(1);
                f.batches == 0
            }
            None => false,
        };
        if finished {
            inner.in_flight.remove(key);
        }
    }

    fn requeue(&self, batch: Batch<T>, error: anyhow::Error) {
        let mut inner = self.lock();
        Self::land_locked(&mut inner, &batch.key);
        if inner.closed || !self.requeue_on_failure {
            warn!(key = %batch.key, error = %error, "dropping unprocessed batch");
            counter!("kinform_dropped_batches_total", 1);
            if batch.initial {
                self.barrier.complete_one();
            }
            return;
        }
        warn!(key = %batch.key, error = %error, "requeueing unprocessed batch");
        counter!("kinform_requeues_total", 1);
        let Batch { key, mut deltas, initial } = batch;
        match inner.items.remove(&key) {
            Some(newer) => {
                deltas.extend(newer.deltas);
                inner.order.retain(|k| k != &key);
                inner.items.insert(key.clone(), Pending { deltas, initial: initial || newer.initial });
            }
            None => {
                inner.items.insert(key.clone(), Pending { deltas, initial });
            }
        }
        inner.order.push_back(key);
        drop(inner);
        self.notify.notify_one();
    }

    /// Shut the queue: pending and future `pop` calls return `None`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

/// State a list of deltas leaves behind; `None` when it holds only `Sync` nudges.
fn last_state<T>(deltas: &[Delta<T>]) -> Option<Option<Arc<T>>> {
    deltas.iter().rev().find(|d| d.kind != DeltaKind::Sync).map(|d| match d.kind {
        DeltaKind::Deleted => None,
        _ => Some(Arc::clone(&d.object)),
    })
}
