use std::sync::Arc;
use std::time::Duration;

use kinform_core::Object;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::DeltaQueue;

/// Periodically enqueue `Sync` deltas for every stored key. A zero period disables it.
pub fn spawn_resync<T: Object>(queue: Arc<DeltaQueue<T>>, period: Duration, cancel: CancellationToken) -> Option<JoinHandle<()>> {
    if period.is_zero() {
        debug!("resync disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let queued = queue.resync();
                    metrics::counter!("kinform_resync_deltas_total", queued as u64);
                    debug!(queued, "resync pass");
                }
                _ = cancel.cancelled() => break,
            }
        }
        info!("resync scheduler stopped");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::obj;
    use crate::{Store, SyncBarrier};
    use kinform_core::{DeltaKind, InformerConfig};

    #[tokio::test]
    async fn zero_period_disables() {
        let store = Arc::new(Store::new());
        let q = Arc::new(DeltaQueue::new(store, Arc::new(SyncBarrier::new()), &InformerConfig::default()));
        assert!(spawn_resync::<crate::testutil::Obj>(q, Duration::ZERO, CancellationToken::new()).is_none());
    }

    #[tokio::test]
    async fn ticks_enqueue_sync_and_stop_on_cancel() {
        let store = Arc::new(Store::new());
        store.replace(vec![Arc::new(obj("a", "1"))]);
        let q = Arc::new(DeltaQueue::new(Arc::clone(&store), Arc::new(SyncBarrier::new()), &InformerConfig::default()));
        let cancel = CancellationToken::new();
        let task = spawn_resync(Arc::clone(&q), Duration::from_millis(20), cancel.clone()).expect("enabled");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(q.pending_kinds(&obj("a", "").key), vec![DeltaKind::Sync]);
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.expect("stopped").expect("join");
    }
}
