//! BkApp CRD.
//!
//! The external contract for cloud-native applications: the full desired spec
//! of an application model, reconciled in-cluster by the app operator. The
//! engine renders descriptions into this resource and polls its status.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub type BkApp = BkAppCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the BkApp resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "BkAppCRD",
    status = "BkAppStatus",
    group = "paas.wharf.dev",
    version = "v1alpha2",
    kind = "BkApp",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "bkapp",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.build.image"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BkAppSpec {
    /// The image the application processes run.
    #[serde(default)]
    pub build: Option<BkAppBuild>,
    /// The application's processes.
    pub processes: Vec<BkAppProcess>,
    /// Application-wide configuration, currently environment variables.
    #[serde(default)]
    pub configuration: BkAppConfiguration,
    /// Names of addon services the application consumes.
    #[serde(default)]
    pub addons: Vec<BkAppAddon>,
    /// Volume mounts shared by all processes.
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Lifecycle hooks.
    #[serde(default)]
    pub hooks: Option<BkAppHooks>,
    /// Per-environment overrides materialized onto this resource.
    #[serde(default)]
    pub env_overlay: Option<EnvOverlay>,
    /// In-platform service discovery entries.
    #[serde(default)]
    pub svc_discovery: Option<SvcDiscovery>,
    /// DNS behaviour of the application pods.
    #[serde(default)]
    pub domain_resolution: Option<DomainResolution>,
}

/// Image settings of a BkApp.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BkAppBuild {
    pub image: String,
    #[serde(default)]
    pub image_pull_policy: Option<String>,
    #[serde(default)]
    pub image_credentials_name: Option<String>,
}

/// One process of a BkApp.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BkAppProcess {
    pub name: String,
    pub replicas: u32,
    /// Name of the resource-quota plan applied to this process.
    #[serde(default)]
    pub res_quota_plan: Option<String>,
    #[serde(default)]
    pub target_port: Option<u16>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub autoscaling: Option<AutoscalingOverlay>,
    /// Probe settings, kept as raw values and owned by the app operator.
    #[serde(default)]
    pub probes: Option<serde_json::Value>,
}

/// Application-wide configuration block.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct BkAppConfiguration {
    #[serde(default)]
    pub env: Vec<EnvVarEntry>,
}

/// A single environment variable entry.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct EnvVarEntry {
    pub name: String,
    pub value: String,
}

/// An addon service claim.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BkAppAddon {
    pub name: String,
    #[serde(default)]
    pub specs: Vec<serde_json::Value>,
}

/// A volume mount.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub name: String,
    pub mount_path: String,
    pub source: serde_json::Value,
}

/// Lifecycle hooks of a BkApp.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BkAppHooks {
    #[serde(default)]
    pub pre_release: Option<HookSpec>,
}

/// A single lifecycle hook.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct HookSpec {
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Per-environment overrides.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvOverlay {
    #[serde(default)]
    pub replicas: Vec<ReplicasOverlay>,
    #[serde(default)]
    pub res_quotas: Vec<ResQuotaOverlay>,
    #[serde(default)]
    pub env_variables: Vec<EnvVarOverlay>,
    #[serde(default)]
    pub autoscaling: Vec<ProcessAutoscalingOverlay>,
    #[serde(default)]
    pub mounts: Vec<MountOverlay>,
}

/// Replica override for one (environment, process) pair.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicasOverlay {
    pub env_name: String,
    pub process: String,
    pub count: u32,
}

/// Resource-quota override for one (environment, process) pair.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResQuotaOverlay {
    pub env_name: String,
    pub process: String,
    pub plan: String,
}

/// Environment variable override for one environment.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarOverlay {
    pub env_name: String,
    pub name: String,
    pub value: String,
}

/// Autoscaling override for one (environment, process) pair.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessAutoscalingOverlay {
    pub env_name: String,
    pub process: String,
    #[serde(flatten)]
    pub spec: AutoscalingOverlay,
}

/// Autoscaling bounds & policy.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalingOverlay {
    pub min_replicas: u32,
    pub max_replicas: u32,
    #[serde(default)]
    pub policy: Option<String>,
}

/// Mount override for one environment.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MountOverlay {
    pub env_name: String,
    #[serde(flatten)]
    pub mount: Mount,
}

/// In-platform service discovery.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SvcDiscovery {
    #[serde(default)]
    pub bk_saas: Vec<SvcDiscoveryEntry>,
}

/// One service-discovery target.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SvcDiscoveryEntry {
    pub bk_app_code: String,
    #[serde(default)]
    pub module_name: Option<String>,
}

/// DNS behaviour of application pods.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DomainResolution {
    #[serde(default)]
    pub nameservers: Vec<String>,
    #[serde(default)]
    pub host_aliases: Vec<HostAlias>,
}

/// A static host alias entry.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HostAlias {
    pub ip: String,
    pub hostnames: Vec<String>,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BkAppStatus {
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub conditions: Vec<BkAppCondition>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

/// One status condition of a BkApp.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BkAppCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub last_transition_time: Option<String>,
}
