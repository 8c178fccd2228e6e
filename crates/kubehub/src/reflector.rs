//! Reflector: drives list-then-watch against a source and feeds the delta queue.
//!
//! `Idle -> Listing -> Watching <-> Relisting -> Stopped`. A normal stream close
//! reopens the watch from the last seen version; a stale cursor (or a version
//! regression) forces a full re-list; transient errors back off and retry until
//! the consecutive-failure cap turns them fatal.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use futures::StreamExt;
use kinform_core::{
    BackoffConfig, Delta, DeltaKind, InformerConfig, InformerError, ListOptions, ListerWatcher, Object, ResourceVersion,
    SourceError, WatchEvent, WatchOptions,
};
use kinform_store::DeltaQueue;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReflectorState {
    Idle = 0,
    Listing = 1,
    Watching = 2,
    Relisting = 3,
    Stopped = 4,
}

impl ReflectorState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ReflectorState::Listing,
            2 => ReflectorState::Watching,
            3 => ReflectorState::Relisting,
            4 => ReflectorState::Stopped,
            _ => ReflectorState::Idle,
        }
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: u32,
    next: Duration,
}

impl Backoff {
    pub fn new(cfg: &BackoffConfig) -> Self {
        Self { initial: cfg.initial, max: cfg.max, factor: cfg.factor.max(1), next: cfg.initial.min(cfg.max) }
    }

    pub fn next_delay(&mut self) -> Duration {
        let d = self.next;
        self.next = self.next.saturating_mul(self.factor).min(self.max);
        d
    }

    pub fn reset(&mut self) {
        self.next = self.initial.min(self.max);
    }
}

enum WatchOutcome {
    Cancelled,
    Relist,
    Fatal(InformerError),
}

pub struct Reflector<T> {
    source: Arc<dyn ListerWatcher<T>>,
    queue: Arc<DeltaQueue<T>>,
    list_opts: ListOptions,
    watch_timeout_secs: u32,
    backoff: BackoffConfig,
    last_rv: ArcSwapOption<ResourceVersion>,
    state: AtomicU8,
    list_calls: AtomicU64,
}

impl<T: Object> Reflector<T> {
    pub fn new(source: Arc<dyn ListerWatcher<T>>, queue: Arc<DeltaQueue<T>>, config: &InformerConfig) -> Self {
        Self {
            source,
            queue,
            list_opts: ListOptions {
                label_selector: config.label_selector.clone(),
                field_selector: config.field_selector.clone(),
            },
            watch_timeout_secs: config.watch_timeout_secs,
            backoff: config.backoff.clone(),
            last_rv: ArcSwapOption::empty(),
            state: AtomicU8::new(ReflectorState::Idle as u8),
            list_calls: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ReflectorState {
        ReflectorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: ReflectorState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// Last resource version observed from a list or a watch event.
    pub fn last_sync_resource_version(&self) -> Option<ResourceVersion> {
        self.last_rv.load_full().map(|rv| (*rv).clone())
    }

    /// Number of list calls issued, failed ones included.
    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::Relaxed)
    }

    fn max_failures(&self) -> u32 {
        self.backoff.max_consecutive_failures.max(1)
    }

    /// Run until cancelled (`Ok`) or until a failure cap is exceeded (`Err`).
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), InformerError> {
        let mut backoff = Backoff::new(&self.backoff);
        let mut relisting = false;
        let result = loop {
            self.set_state(if relisting { ReflectorState::Relisting } else { ReflectorState::Listing });
            let cursor = match self.list_and_replace(cancel, &mut backoff).await {
                Ok(Some(rv)) => rv,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            self.set_state(ReflectorState::Watching);
            match self.watch_from(cursor, cancel, &mut backoff).await {
                WatchOutcome::Cancelled => break Ok(()),
                WatchOutcome::Relist => {
                    counter!("kinform_relists_total", 1);
                    relisting = true;
                }
                WatchOutcome::Fatal(e) => break Err(e),
            }
        };
        self.set_state(ReflectorState::Stopped);
        match &result {
            Ok(()) => info!("reflector stopped"),
            Err(e) => error!(error = %e, "reflector failed"),
        }
        result
    }

    /// List with retries and push the snapshot through `replace`. `None` means cancelled.
    async fn list_and_replace(
        &self,
        cancel: &CancellationToken,
        backoff: &mut Backoff,
    ) -> Result<Option<ResourceVersion>, InformerError> {
        let mut attempts = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            self.list_calls.fetch_add(1, Ordering::Relaxed);
            let res = tokio::select! {
                r = self.source.list(&self.list_opts) => r,
                _ = cancel.cancelled() => return Ok(None),
            };
            match res {
                Ok(page) => {
                    backoff.reset();
                    let rv = page.resource_version;
                    let count = page.items.len();
                    self.queue.replace(page.items, rv.clone());
                    self.last_rv.store(Some(Arc::new(rv.clone())));
                    info!(count, rv = %rv, "list complete");
                    return Ok(Some(rv));
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.max_failures() {
                        return Err(InformerError::ListFailure { attempts, message: e.to_string() });
                    }
                    let delay = backoff.next_delay();
                    warn!(error = %e, attempts, delay_ms = delay.as_millis() as u64, "list failed; retrying");
                    if !sleep_or_cancel(delay, cancel).await {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn watch_from(&self, cursor: ResourceVersion, cancel: &CancellationToken, backoff: &mut Backoff) -> WatchOutcome {
        let mut rv = cursor;
        let mut failures = 0u32;
        loop {
            if cancel.is_cancelled() {
                return WatchOutcome::Cancelled;
            }
            let opts = WatchOptions::from_list(&self.list_opts, rv.clone(), Some(self.watch_timeout_secs));
            let opened = tokio::select! {
                r = self.source.watch(&opts) => r,
                _ = cancel.cancelled() => return WatchOutcome::Cancelled,
            };
            let mut stream = match opened {
                Ok(s) => s,
                Err(SourceError::StaleCursor(msg)) => {
                    warn!(rv = %rv, reason = %msg, "watch cursor expired; relisting");
                    return WatchOutcome::Relist;
                }
                Err(e @ SourceError::Transient(_)) => {
                    failures += 1;
                    if let Some(outcome) = self.retry_or_fail(&e, failures, backoff, cancel).await {
                        return outcome;
                    }
                    continue;
                }
            };
            counter!("kinform_watch_restarts_total", 1);
            debug!(rv = %rv, "watch opened");
            let opened_at = Instant::now();
            let mut delivered = false;

            loop {
                let next = tokio::select! {
                    n = stream.next() => n,
                    _ = cancel.cancelled() => return WatchOutcome::Cancelled,
                };
                match next {
                    None => {
                        if self.lived_long_enough(opened_at) {
                            failures = 0;
                            backoff.reset();
                        }
                        if delivered {
                            debug!(rv = %rv, "watch stream closed; reopening");
                            break;
                        }
                        // an empty stream that closes right away must not spin
                        let delay = backoff.next_delay();
                        debug!(rv = %rv, delay_ms = delay.as_millis() as u64, "watch stream closed without events; pacing reopen");
                        if !sleep_or_cancel(delay, cancel).await {
                            return WatchOutcome::Cancelled;
                        }
                        break;
                    }
                    Some(Ok(event)) => {
                        delivered = true;
                        failures = 0;
                        backoff.reset();
                        let event_rv = event.resource_version().filter(|v| !v.is_empty());
                        if let Some(v) = &event_rv {
                            if v.is_regression_from(&rv) {
                                warn!(rv = %rv, event_rv = %v, "resource version went backwards; relisting");
                                return WatchOutcome::Relist;
                            }
                        }
                        self.enqueue(event);
                        if let Some(v) = event_rv {
                            self.last_rv.store(Some(Arc::new(v.clone())));
                            rv = v;
                        }
                    }
                    Some(Err(SourceError::StaleCursor(msg))) => {
                        warn!(rv = %rv, reason = %msg, "watch cursor expired; relisting");
                        return WatchOutcome::Relist;
                    }
                    Some(Err(e @ SourceError::Transient(_))) => {
                        if self.lived_long_enough(opened_at) {
                            failures = 0;
                            backoff.reset();
                        }
                        failures += 1;
                        if let Some(outcome) = self.retry_or_fail(&e, failures, backoff, cancel).await {
                            return outcome;
                        }
                        break;
                    }
                }
            }
        }
    }

    fn lived_long_enough(&self, opened_at: Instant) -> bool {
        opened_at.elapsed() >= self.backoff.healthy_after
    }

    /// Back off after a transient watch failure. `Some` ends the watch phase.
    async fn retry_or_fail(
        &self,
        e: &SourceError,
        failures: u32,
        backoff: &mut Backoff,
        cancel: &CancellationToken,
    ) -> Option<WatchOutcome> {
        if failures >= self.max_failures() {
            return Some(WatchOutcome::Fatal(InformerError::WatchFailure { attempts: failures, message: e.to_string() }));
        }
        let delay = backoff.next_delay();
        warn!(error = %e, failures, delay_ms = delay.as_millis() as u64, "watch failed; retrying from cursor");
        if sleep_or_cancel(delay, cancel).await {
            None
        } else {
            Some(WatchOutcome::Cancelled)
        }
    }

    fn enqueue(&self, event: WatchEvent<T>) {
        let (kind, obj) = match event {
            WatchEvent::Added(o) => (DeltaKind::Added, o),
            WatchEvent::Updated(o) => (DeltaKind::Updated, o),
            WatchEvent::Deleted(o) => (DeltaKind::Deleted, o),
            WatchEvent::Bookmark(_) => return,
        };
        debug!(key = %obj.key(), kind = kind.as_str(), "watch event");
        self.queue.put(Delta::new(kind, Arc::new(obj)));
    }
}

async fn sleep_or_cancel(d: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(d) => true,
        _ = cancel.cancelled() => false,
    }
}
