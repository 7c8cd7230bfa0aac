//! Cloud-native application CRD.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/reference/kubectl/jsonpath/

mod bkapp;

use kube::Resource;

pub use bkapp::{
    AutoscalingOverlay, BkApp, BkAppAddon, BkAppBuild, BkAppCondition, BkAppConfiguration, BkAppHooks, BkAppProcess, BkAppSpec, BkAppStatus,
    DomainResolution, EnvOverlay, EnvVarEntry, EnvVarOverlay, HookSpec, HostAlias, Mount, MountOverlay, ProcessAutoscalingOverlay, ReplicasOverlay,
    ResQuotaOverlay, SvcDiscovery, SvcDiscoveryEntry,
};

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;
}

impl RequiredMetadata for BkApp {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }
}
