//! Cluster-state egress.
//!
//! Snapshots cluster node lists into content-addressed `ClusterState` records
//! and lets applications bind to a state to pin scheduling onto those nodes.
//! Snapshots are idempotent by content hash: concurrent snapshotters converge
//! on the same row.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::Utc;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::client::Client;
use kube::Resource;
use sha1::{Digest, Sha1};
use tokio::time::timeout;

use crate::database::{decode_model, encode_model, Database, Tree};
use crate::k8s::API_TIMEOUT;
use wharf_core::models::{ClusterState, EgressSpec, RCStateAppBinding, WlApp};

/// Compute the content digest of a node list: hex SHA-1 of the sorted
/// node-name CSV.
pub fn digest_of_nodes(names: &[String]) -> String {
    let mut sorted = names.to_vec();
    sorted.sort();
    let mut hasher = Sha1::new();
    hasher.update(sorted.join(",").as_bytes());
    hasher.finalize().iter().map(|byte| format!("{:02x}", byte)).collect()
}

/// The display name of a state: `eng-cstate-{digest[:8]}-{n}`.
pub fn state_display_name(digest: &str, ordinal: u64) -> String {
    format!("eng-cstate-{}-{}", &digest[..8], ordinal)
}

/// Whether the node carries any of the given ignore labels.
pub fn node_matches_ignore_labels(node: &Node, ignore_labels: &BTreeMap<String, String>) -> bool {
    let labels = match node.meta().labels.as_ref() {
        Some(labels) => labels,
        None => return false,
    };
    ignore_labels
        .iter()
        .any(|(key, value)| labels.get(key).map(|have| have == value).unwrap_or(false))
}

/// The `InternalIP` address of the given node, if reported.
pub fn node_internal_ip(node: &Node) -> Option<String> {
    node.status
        .as_ref()
        .and_then(|status| status.addresses.as_ref())
        .and_then(|addresses| addresses.iter().find(|address| address.type_ == "InternalIP"))
        .map(|address| address.address.clone())
}

/// Persistence for cluster states, app bindings & egress specs.
pub struct ClusterStateStore {
    states: Tree,
    bindings: Tree,
    egress: Tree,
}

impl ClusterStateStore {
    /// Create a new instance.
    pub fn new(db: &Database) -> Result<Self> {
        Ok(Self {
            states: db.cluster_states()?,
            bindings: db.state_bindings()?,
            egress: db.egress_specs()?,
        })
    }

    fn state_key(cluster_name: &str, digest: &str) -> String {
        format!("{}/{}", cluster_name, digest)
    }

    /// Fetch the state with the given digest, if recorded.
    pub fn get(&self, cluster_name: &str, digest: &str) -> Result<Option<ClusterState>> {
        let raw = self
            .states
            .get(Self::state_key(cluster_name, digest).as_bytes())
            .context("error reading cluster state")?;
        raw.map(|raw| decode_model(&raw)).transpose()
    }

    /// The number of states recorded for the given cluster.
    pub fn count(&self, cluster_name: &str) -> usize {
        self.states.scan_prefix(format!("{}/", cluster_name).as_bytes()).count()
    }

    fn insert(&self, state: &ClusterState) -> Result<()> {
        self.states
            .insert(Self::state_key(&state.cluster_name, &state.nodes_digest).as_bytes(), encode_model(state)?)
            .context("error writing cluster state")?;
        Ok(())
    }

    /// Bind the given engine app to a state, overwriting any previous binding.
    pub fn bind_app(&self, wl_app: &WlApp, state: &ClusterState) -> Result<RCStateAppBinding> {
        let binding = RCStateAppBinding {
            engine_app: wl_app.uuid,
            state_name: state.name.clone(),
            cluster_name: state.cluster_name.clone(),
        };
        self.bindings
            .insert(wl_app.uuid.to_string().as_bytes(), encode_model(&binding)?)
            .context("error writing state binding")?;
        Ok(binding)
    }

    /// The state binding of the given engine app, if any.
    pub fn get_binding(&self, wl_app: &WlApp) -> Result<Option<RCStateAppBinding>> {
        let raw = self.bindings.get(wl_app.uuid.to_string().as_bytes()).context("error reading state binding")?;
        raw.map(|raw| decode_model(&raw)).transpose()
    }

    /// Record the egress spec of an engine app, overwriting any previous one.
    pub fn save_egress_spec(&self, spec: &EgressSpec) -> Result<()> {
        self.egress
            .insert(spec.engine_app.to_string().as_bytes(), encode_model(spec)?)
            .context("error writing egress spec")?;
        Ok(())
    }

    /// The egress spec of the given engine app, if any.
    pub fn get_egress_spec(&self, wl_app: &WlApp) -> Result<Option<EgressSpec>> {
        let raw = self.egress.get(wl_app.uuid.to_string().as_bytes()).context("error reading egress spec")?;
        raw.map(|raw| decode_model(&raw)).transpose()
    }
}

/// Build or return the state describing the given nodes.
///
/// Nodes matching any ignore label are dropped before hashing. If a row with
/// the same `(cluster_name, nodes_digest)` exists it is returned unchanged.
pub fn generate_state_from_nodes(
    store: &ClusterStateStore, cluster_name: &str, nodes: &[Node], ignore_labels: &BTreeMap<String, String>,
) -> Result<ClusterState> {
    let kept: Vec<&Node> = nodes.iter().filter(|node| !node_matches_ignore_labels(node, ignore_labels)).collect();
    let mut names: Vec<String> = kept
        .iter()
        .filter_map(|node| node.meta().name.clone())
        .collect();
    names.sort();
    let digest = digest_of_nodes(&names);

    if let Some(existing) = store.get(cluster_name, &digest)? {
        return Ok(existing);
    }

    let nodes_data = kept
        .iter()
        .map(|node| {
            serde_json::json!({
                "name": node.meta().name,
                "labels": node.meta().labels,
                "internal_ip": node_internal_ip(node),
            })
        })
        .collect();
    let state = ClusterState {
        cluster_name: cluster_name.to_string(),
        name: state_display_name(&digest, store.count(cluster_name) as u64 + 1),
        nodes_digest: digest,
        nodes_cnt: names.len(),
        nodes_name: names,
        nodes_data,
        created: Utc::now(),
    };
    store.insert(&state)?;
    Ok(state)
}

/// Snapshot the live node list of the given cluster into a state record.
#[tracing::instrument(level = "debug", skip(store, client, cluster_name, ignore_labels))]
pub async fn generate_state(
    store: &ClusterStateStore, client: Client, cluster_name: &str, ignore_labels: &BTreeMap<String, String>,
) -> Result<ClusterState> {
    let api: Api<Node> = Api::all(client);
    let nodes = timeout(API_TIMEOUT, api.list(&ListParams::default()))
        .await
        .context("timeout while listing nodes")?
        .context("error listing nodes")?;
    generate_state_from_nodes(store, cluster_name, &nodes.items, ignore_labels)
}

/// Label every node of the state with `{state.name: "1"}`.
///
/// Used together with app bindings to constrain pod scheduling. Callers must
/// serialize per cluster.
#[tracing::instrument(level = "debug", skip(client, state))]
pub async fn sync_state_to_nodes(client: Client, state: &ClusterState) -> Result<()> {
    let api: Api<Node> = Api::all(client);
    for node_name in &state.nodes_name {
        let body = serde_json::json!({
            "metadata": { "labels": { state.name.as_str(): "1" } }
        });
        timeout(API_TIMEOUT, api.patch(node_name, &PatchParams::default(), &Patch::Merge(body)))
            .await
            .context("timeout while labeling node")?
            .with_context(|| format!("error labeling node {}", node_name))?;
        tracing::debug!(node = node_name.as_str(), state = state.name.as_str(), "labeled node with state identifier");
    }
    Ok(())
}

/// The current egress IPs of the cluster: the digest of the live node list
/// plus every reported `InternalIP`.
#[tracing::instrument(level = "debug", skip(client))]
pub async fn get_cluster_egress_ips(client: Client) -> Result<(String, Vec<String>)> {
    let api: Api<Node> = Api::all(client);
    let nodes = timeout(API_TIMEOUT, api.list(&ListParams::default()))
        .await
        .context("timeout while listing nodes")?
        .context("error listing nodes")?;
    let names: Vec<String> = nodes.items.iter().filter_map(|node| node.meta().name.clone()).collect();
    let ips = nodes.items.iter().filter_map(node_internal_ip).collect();
    Ok((digest_of_nodes(&names), ips))
}
