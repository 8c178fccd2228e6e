use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::core::DynamicObject;
use kube::ResourceExt;

use crate::{Object, ResourceKey, ResourceVersion};

macro_rules! impl_object_for_resource {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl Object for $ty {
                fn key(&self) -> ResourceKey {
                    ResourceKey { namespace: ResourceExt::namespace(self), name: ResourceExt::name_any(self) }
                }

                fn resource_version(&self) -> Option<ResourceVersion> {
                    ResourceExt::resource_version(self).map(ResourceVersion)
                }
            }
        )+
    };
}

impl_object_for_resource!(DynamicObject, Deployment, ConfigMap, Pod);
