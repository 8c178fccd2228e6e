//! The remote list/watch capability the reflector drives.

use futures::stream::BoxStream;

use crate::{Object, ResourceVersion, SourceError};

/// Selector options shared by list and watch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    /// Resume point; events strictly after this version are delivered.
    pub resource_version: ResourceVersion,
    pub timeout_secs: Option<u32>,
}

impl WatchOptions {
    pub fn from_list(list: &ListOptions, resource_version: ResourceVersion, timeout_secs: Option<u32>) -> Self {
        Self {
            label_selector: list.label_selector.clone(),
            field_selector: list.field_selector.clone(),
            resource_version,
            timeout_secs,
        }
    }
}

/// Point-in-time snapshot of the collection.
#[derive(Debug, Clone)]
pub struct ListPage<T> {
    pub items: Vec<T>,
    pub resource_version: ResourceVersion,
}

/// One change reported by a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    Added(T),
    Updated(T),
    Deleted(T),
    /// Cursor advance with no object attached.
    Bookmark(ResourceVersion),
}

impl<T: Object> WatchEvent<T> {
    pub fn resource_version(&self) -> Option<ResourceVersion> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Updated(o) | WatchEvent::Deleted(o) => o.resource_version(),
            WatchEvent::Bookmark(rv) => Some(rv.clone()),
        }
    }
}

/// Lazy, non-restartable event sequence. Ends when the remote closes the stream.
pub type WatchStream<T> = BoxStream<'static, Result<WatchEvent<T>, SourceError>>;

#[async_trait::async_trait]
pub trait ListerWatcher<T: Object>: Send + Sync {
    async fn list(&self, opts: &ListOptions) -> Result<ListPage<T>, SourceError>;

    async fn watch(&self, opts: &WatchOptions) -> Result<WatchStream<T>, SourceError>;
}
