//! kube-rs backed list/watch source.

use std::fmt::Debug;

use futures::{StreamExt, TryStreamExt};
use kinform_core::{ListOptions, ListPage, ListerWatcher, Object, ResourceVersion, SourceError, WatchEvent, WatchOptions, WatchStream};
use kube::api::{Api, ListParams, WatchParams};
use kube::core::{DynamicObject, ErrorResponse, WatchEvent as KubeWatchEvent};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;

use crate::discovery::resolve_api;

// The API server rejects watch timeouts of 295s or more.
const MAX_WATCH_TIMEOUT_SECS: u32 = 290;

pub struct KubeSource<K> {
    api: Api<K>,
}

impl<K> KubeSource<K> {
    pub fn new(api: Api<K>) -> Self {
        Self { api }
    }

    pub fn api(&self) -> &Api<K> {
        &self.api
    }
}

impl KubeSource<DynamicObject> {
    /// Source for a `group/version/Kind` key. `namespace = None` watches all namespaces.
    pub async fn for_gvk(client: Client, gvk_key: &str, namespace: Option<&str>) -> anyhow::Result<Self> {
        let (api, _scope) = resolve_api(client, gvk_key, namespace).await?;
        Ok(Self::new(api))
    }
}

fn is_gone(resp: &ErrorResponse) -> bool {
    resp.code == 410
}

fn classify(e: kube::Error) -> SourceError {
    match &e {
        kube::Error::Api(resp) if is_gone(resp) => SourceError::StaleCursor(resp.message.clone()),
        _ => SourceError::Transient(e.to_string()),
    }
}

fn convert<K>(ev: KubeWatchEvent<K>) -> Result<WatchEvent<K>, SourceError> {
    match ev {
        KubeWatchEvent::Added(o) => Ok(WatchEvent::Added(o)),
        KubeWatchEvent::Modified(o) => Ok(WatchEvent::Updated(o)),
        KubeWatchEvent::Deleted(o) => Ok(WatchEvent::Deleted(o)),
        KubeWatchEvent::Bookmark(b) => Ok(WatchEvent::Bookmark(ResourceVersion(b.metadata.resource_version))),
        KubeWatchEvent::Error(resp) if is_gone(&resp) => Err(SourceError::StaleCursor(resp.message)),
        KubeWatchEvent::Error(resp) => Err(SourceError::Transient(format!("{}: {} ({})", resp.reason, resp.message, resp.code))),
    }
}

#[async_trait::async_trait]
impl<K> ListerWatcher<K> for KubeSource<K>
where
    K: Object + Resource + DeserializeOwned + Debug + Clone + Send + Sync + 'static,
{
    async fn list(&self, opts: &ListOptions) -> Result<ListPage<K>, SourceError> {
        let mut lp = ListParams::default();
        if let Some(l) = &opts.label_selector {
            lp = lp.labels(l);
        }
        if let Some(f) = &opts.field_selector {
            lp = lp.fields(f);
        }
        let list = self.api.list(&lp).await.map_err(classify)?;
        let rv = list.metadata.resource_version.clone().unwrap_or_default();
        Ok(ListPage { items: list.items, resource_version: ResourceVersion(rv) })
    }

    async fn watch(&self, opts: &WatchOptions) -> Result<WatchStream<K>, SourceError> {
        let mut wp = WatchParams::default();
        if let Some(l) = &opts.label_selector {
            wp = wp.labels(l);
        }
        if let Some(f) = &opts.field_selector {
            wp = wp.fields(f);
        }
        if let Some(t) = opts.timeout_secs {
            wp = wp.timeout(t.min(MAX_WATCH_TIMEOUT_SECS));
        }
        let stream = self.api.watch(&wp, opts.resource_version.as_str()).await.map_err(classify)?;
        Ok(stream.map_err(classify).map(|ev| ev.and_then(convert)).boxed())
    }
}
