//! kinform kubehub: list-then-watch reflector, shared informer and the kube-rs source.

#![forbid(unsafe_code)]

mod discovery;
mod informer;
mod reflector;
mod source;

pub use discovery::{parse_gvk_key, resolve_api, Scope};
pub use informer::SharedInformer;
pub use reflector::{Backoff, Reflector, ReflectorState};
pub use source::KubeSource;
