//! Shared informer: one reflector, one processor and a resync scheduler over a shared store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use kinform_core::{InformerConfig, InformerError, ListerWatcher, Object, ResourceKey, ResourceVersion};
use kinform_store::{spawn_resync, DeltaQueue, Processor, ResourceEventHandler, Store, SyncBarrier};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::reflector::{Reflector, ReflectorState};

pub struct SharedInformer<T> {
    config: InformerConfig,
    store: Arc<Store<T>>,
    barrier: Arc<SyncBarrier>,
    queue: Arc<DeltaQueue<T>>,
    reflector: Reflector<T>,
    processor: Processor<T>,
    handlers: Mutex<Vec<Arc<dyn ResourceEventHandler<T>>>>,
    started: AtomicBool,
}

impl<T: Object> SharedInformer<T> {
    pub fn new(source: Arc<dyn ListerWatcher<T>>, config: InformerConfig) -> Self {
        let store = Arc::new(Store::new());
        let barrier = Arc::new(SyncBarrier::new());
        let queue = Arc::new(DeltaQueue::new(Arc::clone(&store), Arc::clone(&barrier), &config));
        let reflector = Reflector::new(source, Arc::clone(&queue), &config);
        let processor = Processor::new(Arc::clone(&queue), Arc::clone(&store), Arc::clone(&barrier), &config);
        Self {
            config,
            store,
            barrier,
            queue,
            reflector,
            processor,
            handlers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Register a handler. Only allowed before `run`.
    pub fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler<T>>) -> Result<(), InformerError> {
        if self.started.load(Ordering::Acquire) {
            return Err(InformerError::AlreadyStarted);
        }
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner).push(handler);
        Ok(())
    }

    /// Drive the informer until `cancel` fires or the reflector gives up.
    ///
    /// Processor and resync tasks are stopped and joined before returning.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), InformerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(InformerError::AlreadyStarted);
        }
        let handlers = std::mem::take(&mut *self.handlers.lock().unwrap_or_else(PoisonError::into_inner));
        let stop = cancel.child_token();
        let processor = self.processor.start(handlers, stop.clone())?;
        let resync = spawn_resync(Arc::clone(&self.queue), self.config.resync_period, stop.clone());
        info!(resync_secs = self.config.resync_period.as_secs(), workers = self.config.workers, "informer started");

        let result = self.reflector.run(&stop).await;

        stop.cancel();
        self.queue.close();
        if let Err(e) = processor.await {
            warn!(error = %e, "processor task ended abnormally");
        }
        if let Some(resync) = resync {
            if let Err(e) = resync.await {
                warn!(error = %e, "resync task ended abnormally");
            }
        }
        info!("informer stopped");
        result
    }

    pub fn store(&self) -> Arc<Store<T>> {
        Arc::clone(&self.store)
    }

    /// Cached value for `key`. Unreliable until `has_synced`.
    pub fn get(&self, key: &ResourceKey) -> Option<Arc<T>> {
        self.store.get(key)
    }

    pub fn list(&self) -> Vec<Arc<T>> {
        self.store.list()
    }

    pub fn has_synced(&self) -> bool {
        self.barrier.has_synced()
    }

    pub async fn wait_for_cache_sync(&self, cancel: &CancellationToken) -> bool {
        self.barrier.wait_for_sync(cancel).await
    }

    pub fn last_sync_resource_version(&self) -> Option<ResourceVersion> {
        self.reflector.last_sync_resource_version()
    }

    pub fn reflector_state(&self) -> ReflectorState {
        self.reflector.state()
    }

    pub fn list_calls(&self) -> u64 {
        self.reflector.list_calls()
    }

    pub fn handler_failures(&self) -> u64 {
        self.processor.handler_failures()
    }

    /// Keys with pending deltas.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}
