//! Cluster records, cluster-state snapshots & egress specs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A root or sub-path ingress domain of a cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,
    /// Reserved domains are excluded by default from root-domain enumeration.
    #[serde(default)]
    pub reserved: bool,
    #[serde(default)]
    pub https_enabled: bool,
}

/// Ingress-domain configuration of a cluster.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IngressConfig {
    #[serde(default)]
    pub app_root_domains: Vec<Domain>,
    #[serde(default)]
    pub sub_path_domains: Vec<Domain>,
}

impl IngressConfig {
    /// Root domains available for application hostnames, excluding reserved ones.
    pub fn usable_root_domains(&self) -> impl Iterator<Item = &Domain> {
        self.app_root_domains.iter().filter(|domain| !domain.reserved)
    }
}

/// A registered cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    /// External cluster identifier carried in annotations.
    #[serde(default)]
    pub bcs_cluster_id: Option<String>,
    pub tenant_id: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub ingress_config: IngressConfig,
    /// Opaque credentials blob (kubeconfig YAML).
    pub credentials: String,
}

/// A content-addressed snapshot of cluster node identities.
///
/// Unique per `(cluster_name, nodes_digest)`; re-snapshots are idempotent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterState {
    pub cluster_name: String,
    /// Display name, `eng-cstate-{digest[:8]}-{n}`.
    pub name: String,
    /// Hex SHA-1 of the sorted node-name CSV.
    pub nodes_digest: String,
    pub nodes_name: Vec<String>,
    /// Compact node snapshot kept for forensics.
    pub nodes_data: Vec<serde_json::Value>,
    pub nodes_cnt: usize,
    pub created: DateTime<Utc>,
}

/// A link from an engine app to a cluster state.
///
/// While bound, the app's pods are scheduled only onto the state's nodes via
/// the `{state.name: "1"}` node-selector label.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RCStateAppBinding {
    pub engine_app: Uuid,
    pub state_name: String,
    pub cluster_name: String,
}

/// Declarative specification for an egress-gateway CR.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EgressSpec {
    pub engine_app: Uuid,
    pub rules: Vec<EgressRule>,
}

/// One rule of an egress spec.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EgressRule {
    pub host: String,
    pub dst_port: u16,
    pub protocol: String,
    pub src_port: u16,
    pub service_name: String,
}
