//! GVK key parsing and API resolution through kube discovery.

use anyhow::{anyhow, Context, Result};
use kube::{
    api::Api,
    core::{DynamicObject, GroupVersionKind},
    discovery::{self, Scope as KubeScope},
    Client,
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Namespaced,
    Cluster,
}

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Resolve a GVK key into a dynamic API handle.
///
/// Namespaced kinds with `namespace = None` are addressed across all namespaces.
pub async fn resolve_api(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<(Api<DynamicObject>, Scope)> {
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, caps) = discovery::pinned_kind(&client, &gvk)
        .await
        .with_context(|| format!("discovering {}", gvk_key))?;
    let scope = match caps.scope {
        KubeScope::Namespaced => Scope::Namespaced,
        KubeScope::Cluster => Scope::Cluster,
    };
    let api = match (scope, namespace) {
        (Scope::Namespaced, Some(ns)) => Api::namespaced_with(client, ns, &ar),
        _ => Api::all_with(client, &ar),
    };
    debug!(gvk = %gvk_key, ns = ?namespace, ?scope, "api resolved");
    Ok((api, scope))
}
