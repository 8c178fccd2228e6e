//! kinform store: the local mirror, the delta queue feeding it and the processor draining it.

#![forbid(unsafe_code)]

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kinform_core::{Delta, DeltaKind, Object, ResourceKey};
use rustc_hash::FxHashMap;

mod barrier;
mod handler;
mod processor;
mod queue;
mod resync;

pub use barrier::SyncBarrier;
pub use handler::{HandlerFns, ResourceEventHandler};
pub use processor::Processor;
pub use queue::{Batch, DeltaQueue, Unprocessed};
pub use resync::spawn_resync;

/// Thread-safe keyed snapshot of every known object.
///
/// Writes are atomic per key; readers never see a half-applied delta.
pub struct Store<T> {
    items: RwLock<FxHashMap<ResourceKey, Arc<T>>>,
}

impl<T> Default for Store<T> {
    fn default() -> Self {
        Self { items: RwLock::new(FxHashMap::default()) }
    }
}

impl<T: Object> Store<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<ResourceKey, Arc<T>>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FxHashMap<ResourceKey, Arc<T>>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Arc<T>> {
        self.read().get(key).cloned()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.read().contains_key(key)
    }

    pub fn list(&self) -> Vec<Arc<T>> {
        self.read().values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Swap the whole content for `items` in one step.
    pub fn replace(&self, items: impl IntoIterator<Item = Arc<T>>) {
        let next: FxHashMap<ResourceKey, Arc<T>> = items.into_iter().map(|o| (o.key(), o)).collect();
        *self.write() = next;
    }

    /// Apply one delta and return the value held before it.
    ///
    /// `Sync` never writes: the held value is at least as new as the nudge,
    /// and a nudge for a key that is gone must not resurrect it.
    pub fn apply(&self, delta: &Delta<T>) -> Option<Arc<T>> {
        let mut items = self.write();
        match delta.kind {
            DeltaKind::Added | DeltaKind::Updated => items.insert(delta.key.clone(), Arc::clone(&delta.object)),
            DeltaKind::Deleted => items.remove(&delta.key),
            DeltaKind::Sync => items.get(&delta.key).cloned(),
        }
    }
}
