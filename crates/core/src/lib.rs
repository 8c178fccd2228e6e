//! kinform core types: keys, versions, deltas and the remote source capability.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

mod config;
mod error;
mod source;

#[cfg(feature = "kube")]
mod kube_impls;

pub use config::{BackoffConfig, InformerConfig};
pub use error::{InformerError, SourceError};
pub use source::{ListOptions, ListPage, ListerWatcher, WatchEvent, WatchOptions, WatchStream};

/// Unique identity of a tracked object, stable for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    pub fn cluster(name: &str) -> Self {
        Self::new(None, name)
    }

    /// Parse `ns/name` or a bare cluster-scoped `name`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => Some(Self::new(Some(ns), name)),
            Some(_) => None,
            None if !s.is_empty() => Some(Self::cluster(s)),
            None => None,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Opaque cursor into the remote change history.
///
/// Versions are compared only when both sides are plain unsigned integers;
/// anything else is treated as incomparable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ResourceVersion(pub String);

impl ResourceVersion {
    pub fn new(v: impl Into<String>) -> Self {
        Self(v.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `self` is strictly older than `cursor`.
    pub fn is_regression_from(&self, cursor: &ResourceVersion) -> bool {
        match (self.0.parse::<u64>(), cursor.0.parse::<u64>()) {
            (Ok(a), Ok(b)) => a < b,
            _ => false,
        }
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceVersion {
    fn from(v: &str) -> Self {
        Self(v.to_string())
    }
}

/// Capability every cached payload provides: its key and its version.
pub trait Object: Clone + Send + Sync + fmt::Debug + 'static {
    fn key(&self) -> ResourceKey;
    fn resource_version(&self) -> Option<ResourceVersion>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
    /// Reconciliation nudge carrying the current Store value; never a real change.
    Sync,
}

impl DeltaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeltaKind::Added => "added",
            DeltaKind::Updated => "updated",
            DeltaKind::Deleted => "deleted",
            DeltaKind::Sync => "sync",
        }
    }
}

/// A single pending change record for one key.
#[derive(Debug, Clone)]
pub struct Delta<T> {
    pub kind: DeltaKind,
    pub key: ResourceKey,
    pub object: Arc<T>,
    pub enqueued_at: Instant,
}

impl<T: Object> Delta<T> {
    pub fn new(kind: DeltaKind, object: Arc<T>) -> Self {
        Self { kind, key: object.key(), object, enqueued_at: Instant::now() }
    }
}

pub mod prelude {
    pub use super::{
        BackoffConfig, Delta, DeltaKind, InformerConfig, InformerError, ListOptions, ListPage, ListerWatcher, Object,
        ResourceKey, ResourceVersion, ShardPlanner, SourceError, WatchEvent, WatchOptions, WatchStream,
    };
}

// ---- dispatch sharding ----

/// Maps a key onto one of the processor's workers.
/// The mapping must be a pure function of the key so one key always lands on one worker.
pub trait ShardPlanner: Send + Sync {
    fn plan(&self, key: &ResourceKey) -> usize;
}

/// Default planner: modulo bucketing over a 64-bit FNV-1a hash of `namespace/name`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModuloKeyPlanner {
    buckets: usize,
}

impl ModuloKeyPlanner {
    pub fn new(buckets: usize) -> Self {
        Self { buckets: buckets.max(1) }
    }

    pub fn buckets(&self) -> usize {
        self.buckets
    }
}

impl ShardPlanner for ModuloKeyPlanner {
    fn plan(&self, key: &ResourceKey) -> usize {
        if self.buckets <= 1 {
            return 0;
        }
        let mut h: u64 = 0xcbf29ce484222325; // 64-bit FNV-1a offset
        let mut eat = |bytes: &[u8]| {
            for b in bytes {
                h ^= *b as u64;
                h = h.wrapping_mul(0x100000001b3);
            }
        };
        if let Some(ns) = &key.namespace {
            eat(ns.as_bytes());
        }
        eat(b"/");
        eat(key.name.as_bytes());
        (h % self.buckets as u64) as usize
    }
}
