//! Processor: pops key batches, routes them to shard workers, applies and notifies.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use kinform_core::{Delta, DeltaKind, InformerConfig, InformerError, ModuloKeyPlanner, Object, ShardPlanner};
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Batch, DeltaQueue, ResourceEventHandler, Store, SyncBarrier, Unprocessed};

type Handlers<T> = Arc<Vec<Arc<dyn ResourceEventHandler<T>>>>;

pub struct Processor<T> {
    queue: Arc<DeltaQueue<T>>,
    store: Arc<Store<T>>,
    barrier: Arc<SyncBarrier>,
    planner: Arc<dyn ShardPlanner>,
    workers: usize,
    worker_queue_cap: usize,
    failures: Arc<AtomicU64>,
    started: AtomicBool,
}

impl<T: Object> Processor<T> {
    pub fn new(queue: Arc<DeltaQueue<T>>, store: Arc<Store<T>>, barrier: Arc<SyncBarrier>, config: &InformerConfig) -> Self {
        let workers = config.workers.max(1);
        Self {
            queue,
            store,
            barrier,
            planner: Arc::new(ModuloKeyPlanner::new(workers)),
            workers,
            worker_queue_cap: config.worker_queue_cap.max(1),
            failures: Arc::new(AtomicU64::new(0)),
            started: AtomicBool::new(false),
        }
    }

    /// Replace the key-to-worker mapping.
    pub fn with_planner(mut self, planner: Arc<dyn ShardPlanner>) -> Self {
        self.planner = planner;
        self
    }

    /// Handler invocations that returned an error so far.
    pub fn handler_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Spawn the dispatcher and its shard workers. The returned task ends after
    /// cancellation once every worker has drained what it already received.
    ///
    /// A queue has exactly one dispatcher; a second call fails with `AlreadyStarted`.
    pub fn start(
        &self,
        handlers: Vec<Arc<dyn ResourceEventHandler<T>>>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, InformerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(InformerError::AlreadyStarted);
        }
        let handlers: Handlers<T> = Arc::new(handlers);
        let mut senders = Vec::with_capacity(self.workers);
        let mut workers = Vec::with_capacity(self.workers);
        for shard in 0..self.workers {
            let (tx, rx) = mpsc::channel::<Batch<T>>(self.worker_queue_cap);
            senders.push(tx);
            workers.push(tokio::spawn(run_worker(
                shard,
                rx,
                Arc::clone(&self.queue),
                Arc::clone(&self.store),
                Arc::clone(&self.barrier),
                Arc::clone(&handlers),
                Arc::clone(&self.failures),
            )));
        }

        let queue = Arc::clone(&self.queue);
        let planner = Arc::clone(&self.planner);
        let shards = self.workers;
        info!(workers = shards, handlers = handlers.len(), "processor started");
        Ok(tokio::spawn(async move {
            loop {
                let popped = queue
                    .pop(&cancel, |batch| {
                        let shard = planner.plan(&batch.key) % shards;
                        let tx = senders[shard].clone();
                        let cancel = cancel.clone();
                        async move {
                            let permit = tokio::select! {
                                p = tx.reserve() => p,
                                _ = cancel.cancelled() => {
                                    return Err(Unprocessed { batch, error: anyhow!("processor cancelled") });
                                }
                            };
                            match permit {
                                Ok(permit) => {
                                    permit.send(batch);
                                    Ok(())
                                }
                                Err(_) => Err(Unprocessed { batch, error: anyhow!("worker {shard} stopped") }),
                            }
                        }
                    })
                    .await;
                if popped.is_none() {
                    break;
                }
            }
            drop(senders);
            for w in workers {
                let _ = w.await;
            }
            info!("processor stopped");
        }))
    }
}

async fn run_worker<T: Object>(
    shard: usize,
    mut rx: mpsc::Receiver<Batch<T>>,
    queue: Arc<DeltaQueue<T>>,
    store: Arc<Store<T>>,
    barrier: Arc<SyncBarrier>,
    handlers: Handlers<T>,
    failures: Arc<AtomicU64>,
) {
    while let Some(batch) = rx.recv().await {
        for delta in batch.deltas {
            apply_and_notify(&store, &handlers, &failures, delta);
        }
        if batch.initial {
            barrier.complete_one();
        }
        queue.done(&batch.key);
    }
    debug!(shard, "worker stopped");
}

enum Notification<T> {
    Add(Arc<T>),
    Update(Arc<T>, Arc<T>),
    Delete(Arc<T>),
    Skip,
}

fn apply_and_notify<T: Object>(store: &Store<T>, handlers: &[Arc<dyn ResourceEventHandler<T>>], failures: &AtomicU64, delta: Delta<T>) {
    histogram!("kinform_queue_latency_ms", delta.enqueued_at.elapsed().as_secs_f64() * 1000.0);
    let previous = store.apply(&delta);
    let note = match (delta.kind, previous) {
        (DeltaKind::Added | DeltaKind::Updated, None) => Notification::Add(Arc::clone(&delta.object)),
        (DeltaKind::Added | DeltaKind::Updated, Some(prev)) => Notification::Update(prev, Arc::clone(&delta.object)),
        (DeltaKind::Deleted, prev) => Notification::Delete(prev.unwrap_or_else(|| Arc::clone(&delta.object))),
        (DeltaKind::Sync, Some(current)) => Notification::Update(Arc::clone(&current), current),
        (DeltaKind::Sync, None) => Notification::Skip,
    };
    if matches!(note, Notification::Skip) {
        debug!(key = %delta.key, "sync for vanished key skipped");
        return;
    }
    for h in handlers {
        let res = match &note {
            Notification::Add(o) => h.on_add(o),
            Notification::Update(old, new) => h.on_update(old, new),
            Notification::Delete(o) => h.on_delete(o),
            Notification::Skip => Ok(()),
        };
        if let Err(e) = res {
            failures.fetch_add(1, Ordering::Relaxed);
            counter!("kinform_handler_failures_total", 1, "kind" => delta.kind.as_str());
            warn!(key = %delta.key, kind = delta.kind.as_str(), error = %e, "handler failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{obj, Obj};
    use crate::HandlerFns;
    use kinform_core::ResourceVersion;
    use std::sync::Mutex;
    use std::time::Duration;

    type Trace = Arc<Mutex<Vec<String>>>;

    fn tracing_handler(trace: &Trace) -> Arc<dyn ResourceEventHandler<Obj>> {
        let (a, u, d) = (Arc::clone(trace), Arc::clone(trace), Arc::clone(trace));
        Arc::new(
            HandlerFns::new()
                .with_add(move |o: &Obj| {
                    a.lock().unwrap().push(format!("add {}@{}", o.key.name, o.rv));
                    Ok(())
                })
                .with_update(move |old: &Obj, new: &Obj| {
                    u.lock().unwrap().push(format!("update {}@{}->{}", new.key.name, old.rv, new.rv));
                    Ok(())
                })
                .with_delete(move |o: &Obj| {
                    d.lock().unwrap().push(format!("delete {}@{}", o.key.name, o.rv));
                    Ok(())
                }),
        )
    }

    struct Rig {
        store: Arc<Store<Obj>>,
        barrier: Arc<SyncBarrier>,
        queue: Arc<DeltaQueue<Obj>>,
        processor: Processor<Obj>,
    }

    fn rig(workers: usize) -> Rig {
        let cfg = InformerConfig::default().with_workers(workers);
        let store = Arc::new(Store::new());
        let barrier = Arc::new(SyncBarrier::new());
        let queue = Arc::new(DeltaQueue::new(Arc::clone(&store), Arc::clone(&barrier), &cfg));
        let processor = Processor::new(Arc::clone(&queue), Arc::clone(&store), Arc::clone(&barrier), &cfg);
        Rig { store, barrier, queue, processor }
    }

    async fn settle(queue: &DeltaQueue<Obj>) {
        for _ in 0..200 {
            if queue.is_empty() && queue.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dispatches_by_store_state() {
        let r = rig(1);
        let trace: Trace = Arc::default();
        let cancel = CancellationToken::new();
        let task = r.processor.start(vec![tracing_handler(&trace)], cancel.clone()).expect("start");

        r.queue.replace(vec![obj("foo", "10")], ResourceVersion::from("10"));
        r.queue.update(obj("foo", "11"));
        r.queue.delete(obj("foo", "12"));
        settle(&r.queue).await;

        assert_eq!(*trace.lock().unwrap(), vec!["add foo@10", "update foo@10->11", "delete foo@11"]);
        assert!(r.store.is_empty());
        assert!(r.barrier.has_synced());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.expect("processor stops").expect("join");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handler_failures_are_isolated() {
        let r = rig(1);
        let trace: Trace = Arc::default();
        let failing: Arc<dyn ResourceEventHandler<Obj>> =
            Arc::new(HandlerFns::new().with_add(|_o: &Obj| Err(anyhow!("boom"))));
        let cancel = CancellationToken::new();
        let _task = r.processor.start(vec![failing, tracing_handler(&trace)], cancel.clone()).expect("start");

        r.queue.add(obj("a", "1"));
        r.queue.add(obj("b", "1"));
        settle(&r.queue).await;

        assert_eq!(r.processor.handler_failures(), 2);
        assert_eq!(trace.lock().unwrap().len(), 2, "second handler still ran");
        assert_eq!(r.store.len(), 2);
        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sharded_workers_keep_per_key_order() {
        let r = rig(4);
        let trace: Trace = Arc::default();
        let cancel = CancellationToken::new();
        let _task = r.processor.start(vec![tracing_handler(&trace)], cancel.clone()).expect("start");

        for rv in 1..=20 {
            for name in ["a", "b", "c", "d", "e"] {
                if rv == 1 {
                    r.queue.add(obj(name, &rv.to_string()));
                } else {
                    r.queue.update(obj(name, &rv.to_string()));
                }
            }
            tokio::task::yield_now().await;
        }
        settle(&r.queue).await;

        let trace = trace.lock().unwrap().clone();
        for name in ["a", "b", "c", "d", "e"] {
            let seen: Vec<u32> = trace
                .iter()
                .filter(|l| l.split_whitespace().nth(1).map(|k| k.starts_with(&format!("{name}@"))).unwrap_or(false))
                .map(|l| l.rsplit(|c| c == '@' || c == '>').next().and_then(|v| v.parse().ok()).unwrap_or(0))
                .collect();
            assert_eq!(seen, (1..=20).collect::<Vec<u32>>(), "order for {name}");
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let r = rig(2);
        let cancel = CancellationToken::new();
        let first = r.processor.start(Vec::new(), cancel.clone()).expect("first start");
        assert!(matches!(r.processor.start(Vec::new(), cancel.clone()), Err(InformerError::AlreadyStarted)));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), first).await.expect("processor stops").expect("join");
    }
}
