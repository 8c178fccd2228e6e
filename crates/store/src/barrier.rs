use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Default)]
struct BarrierState {
    populated: bool,
    pending: usize,
}

/// One-way latch: true once every delta of the first full list has been applied.
pub struct SyncBarrier {
    state: Mutex<BarrierState>,
    synced: watch::Sender<bool>,
}

impl Default for SyncBarrier {
    fn default() -> Self {
        let (synced, _) = watch::channel(false);
        Self { state: Mutex::new(BarrierState::default()), synced }
    }
}

impl SyncBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub fn is_populated(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).populated
    }

    /// Record the initial population. Only the first call counts; returns whether it did.
    pub fn arm(&self, pending: usize) -> bool {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if st.populated {
            return false;
        }
        st.populated = true;
        st.pending = pending;
        if pending == 0 {
            self.latch();
        }
        true
    }

    /// One initial batch was applied (or dropped for good).
    pub fn complete_one(&self) {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if st.pending == 0 {
            return;
        }
        st.pending -= 1;
        if st.populated && st.pending == 0 {
            self.latch();
        }
    }

    fn latch(&self) {
        let changed = self.synced.send_if_modified(|s| {
            if *s {
                false
            } else {
                *s = true;
                true
            }
        });
        if changed {
            info!("cache synced");
        }
    }

    /// Wait until synced. Returns false if cancelled first.
    pub async fn wait_for_sync(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.synced.subscribe();
        tokio::select! {
            res = rx.wait_for(|s| *s) => res.is_ok(),
            _ = cancel.cancelled() => self.has_synced(),
        }
    }
}
