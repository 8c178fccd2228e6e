#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use kinform_core::{InformerConfig, Object, ResourceKey, ResourceVersion};
use kinform_store::{DeltaQueue, Processor, ResourceEventHandler, Store, SyncBarrier};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Obj {
    ns: &'static str,
    name: String,
    rv: u64,
}

fn obj(name: &str, rv: u64) -> Obj {
    Obj { ns: "default", name: name.to_string(), rv }
}

impl Object for Obj {
    fn key(&self) -> ResourceKey {
        ResourceKey::new(Some(self.ns), &self.name)
    }

    fn resource_version(&self) -> Option<ResourceVersion> {
        Some(ResourceVersion::new(self.rv.to_string()))
    }
}

#[derive(Default)]
struct Recorder {
    trace: Mutex<Vec<String>>,
    /// Name whose add blocks the worker for a while.
    stall_on: Option<&'static str>,
}

impl Recorder {
    fn trace(&self) -> Vec<String> {
        self.trace.lock().unwrap().clone()
    }

    fn push(&self, line: String) {
        self.trace.lock().unwrap().push(line);
    }
}

impl ResourceEventHandler<Obj> for Recorder {
    fn on_add(&self, o: &Obj) -> anyhow::Result<()> {
        if self.stall_on == Some(o.name.as_str()) {
            std::thread::sleep(Duration::from_millis(200));
        }
        self.push(format!("add {}@{}", o.name, o.rv));
        Ok(())
    }

    fn on_update(&self, old: &Obj, new: &Obj) -> anyhow::Result<()> {
        self.push(format!("update {}@{}->{}", new.name, old.rv, new.rv));
        Ok(())
    }

    fn on_delete(&self, o: &Obj) -> anyhow::Result<()> {
        self.push(format!("delete {}@{}", o.name, o.rv));
        Ok(())
    }
}

struct Pipeline {
    store: Arc<Store<Obj>>,
    barrier: Arc<SyncBarrier>,
    queue: Arc<DeltaQueue<Obj>>,
    processor: Processor<Obj>,
    recorder: Arc<Recorder>,
    cancel: CancellationToken,
}

fn pipeline(workers: usize) -> Pipeline {
    pipeline_with(workers, Recorder::default())
}

fn pipeline_with(workers: usize, recorder: Recorder) -> Pipeline {
    let cfg = InformerConfig::default().with_workers(workers);
    let store = Arc::new(Store::new());
    let barrier = Arc::new(SyncBarrier::new());
    let queue = Arc::new(DeltaQueue::new(Arc::clone(&store), Arc::clone(&barrier), &cfg));
    let processor = Processor::new(Arc::clone(&queue), Arc::clone(&store), Arc::clone(&barrier), &cfg);
    Pipeline { store, barrier, queue, processor, recorder: Arc::new(recorder), cancel: CancellationToken::new() }
}

impl Pipeline {
    fn start(&self) -> tokio::task::JoinHandle<()> {
        let handler: Arc<dyn ResourceEventHandler<Obj>> = self.recorder.clone();
        self.processor.start(vec![handler], self.cancel.clone()).expect("first start")
    }

    async fn drain(&self) {
        for _ in 0..400 {
            if self.queue.is_empty() && self.queue.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn names(&self) -> Vec<(String, u64)> {
        let mut v: Vec<_> = self.store.list().iter().map(|o| (o.name.clone(), o.rv)).collect();
        v.sort_unstable();
        v
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replace_converges_to_listed_content() {
    let p = pipeline(2);
    let _task = p.start();

    p.queue.replace(vec![obj("a", 1), obj("b", 1), obj("c", 1)], ResourceVersion::from("1"));
    p.drain().await;
    p.queue.update(obj("b", 2));
    p.queue.add(obj("stray", 3));
    p.drain().await;

    // regardless of prior content, the store ends up equal to the list
    let listed = vec![obj("b", 5), obj("d", 5)];
    p.queue.replace(listed.clone(), ResourceVersion::from("5"));
    p.drain().await;
    assert_eq!(p.names(), vec![("b".to_string(), 5), ("d".to_string(), 5)]);
    p.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relist_while_add_is_being_applied_still_converges() {
    let p = pipeline_with(1, Recorder { stall_on: Some("slow"), ..Recorder::default() });
    let _task = p.start();
    p.queue.add(obj("slow", 1));
    p.queue.add(obj("x", 1));
    // both batches left the queue; the worker is still busy with `slow`
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(p.queue.is_empty());
    assert!(p.queue.in_flight() > 0);

    p.queue.replace(vec![obj("slow", 1)], ResourceVersion::from("2"));
    p.drain().await;
    assert_eq!(p.names(), vec![("slow".to_string(), 1)]);
    assert_eq!(p.recorder.trace(), vec!["add slow@1", "add x@1", "delete x@1"]);
    p.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relist_while_delete_is_being_applied_deletes_once() {
    let p = pipeline_with(1, Recorder { stall_on: Some("slow"), ..Recorder::default() });
    let _task = p.start();
    p.queue.add(obj("x", 1));
    p.drain().await;
    p.queue.add(obj("slow", 1));
    p.queue.delete(obj("x", 2));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(p.queue.is_empty());

    p.queue.replace(vec![obj("slow", 1)], ResourceVersion::from("3"));
    p.drain().await;
    assert_eq!(p.names(), vec![("slow".to_string(), 1)]);
    assert_eq!(p.recorder.trace(), vec!["add x@1", "add slow@1", "delete x@1"]);
    p.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn add_then_delete_before_pop_is_invisible() {
    let p = pipeline(1);
    // enqueue before the processor runs so nothing is popped in between
    p.queue.add(obj("k", 1));
    p.queue.delete(obj("k", 2));
    p.queue.add(obj("other", 1));
    let _task = p.start();
    p.drain().await;

    assert_eq!(p.recorder.trace(), vec!["add other@1"]);
    assert!(p.store.get(&obj("k", 0).key()).is_none());
    p.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resync_fires_without_external_change() {
    let p = pipeline(1);
    let _task = p.start();
    p.queue.replace(vec![obj("A", 1), obj("B", 1)], ResourceVersion::from("1"));
    p.drain().await;
    let before = p.names();
    let baseline = p.recorder.trace().len();

    assert_eq!(p.queue.resync(), 2);
    p.drain().await;

    let mut nudges = p.recorder.trace()[baseline..].to_vec();
    nudges.sort();
    assert_eq!(nudges, vec!["update A@1->1", "update B@1->1"]);
    assert_eq!(p.names(), before);
    p.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_barrier_is_monotone() {
    let p = pipeline(1);
    p.queue.replace(vec![obj("a", 1), obj("b", 1)], ResourceVersion::from("1"));
    assert!(!p.barrier.has_synced(), "nothing applied yet");
    let _task = p.start();
    p.drain().await;
    assert!(p.barrier.has_synced());

    p.queue.delete(obj("a", 2));
    p.queue.delete(obj("b", 2));
    p.drain().await;
    assert!(p.store.is_empty());
    assert!(p.barrier.has_synced(), "emptying the store never un-syncs");

    // a later full list does not re-arm the barrier
    p.queue.replace(vec![obj("z", 3)], ResourceVersion::from("3"));
    assert!(p.barrier.has_synced());
    p.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_key_order_survives_sharding() {
    let p = pipeline(4);
    let _task = p.start();
    let keys: Vec<String> = (0..16).map(|i| format!("k{i}")).collect();
    for k in &keys {
        p.queue.add(obj(k, 1));
    }
    for rv in 2..=10 {
        for k in &keys {
            p.queue.update(obj(k, rv));
        }
        tokio::task::yield_now().await;
    }
    for k in &keys {
        p.queue.delete(obj(k, 11));
    }
    p.drain().await;

    let trace = p.recorder.trace();
    for k in &keys {
        let mine: Vec<&String> = trace.iter().filter(|l| l.split_whitespace().nth(1).map(|t| t.starts_with(&format!("{k}@"))).unwrap_or(false)).collect();
        let mut expected = vec![format!("add {k}@1")];
        for rv in 2..=10 {
            expected.push(format!("update {k}@{}->{}", rv - 1, rv));
        }
        expected.push(format!("delete {k}@10"));
        let mine: Vec<String> = mine.into_iter().cloned().collect();
        assert_eq!(mine, expected, "ordering for {k}");
    }
    assert!(p.store.is_empty());
    p.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn processor_exits_on_cancel() {
    let p = pipeline(3);
    let task = p.start();
    p.queue.add(obj("a", 1));
    p.drain().await;
    p.cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), task).await.expect("processor stops").expect("join");
}
