//! Cluster registry & environment binding.
//!
//! Clusters are registered through runtime config, keyed by name, each with
//! ingress-domain config, external annotations and a credentials blob. The
//! effective cluster for a module environment is resolved by an explicit
//! binding first, then the tenant default.

mod state;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use kube::client::Client;
use kube::config::{KubeConfigOptions, Kubeconfig};

use crate::database::{decode_model, encode_model, Database, Tree};
use wharf_core::models::{Cluster, ModuleEnvironment};
use wharf_core::PlatformError;

pub use state::{
    digest_of_nodes, generate_state, generate_state_from_nodes, get_cluster_egress_ips, node_internal_ip, node_matches_ignore_labels, state_display_name,
    sync_state_to_nodes, ClusterStateStore,
};

/// The registry of clusters known to the engine.
pub struct ClusterRegistry {
    clusters: HashMap<String, Arc<Cluster>>,
}

impl ClusterRegistry {
    /// Create a new instance from the configured cluster records.
    pub fn new(clusters: Vec<Cluster>) -> Self {
        let clusters = clusters.into_iter().map(|cluster| (cluster.name.clone(), Arc::new(cluster))).collect();
        Self { clusters }
    }

    /// Fetch the named cluster.
    pub fn get(&self, name: &str) -> Result<Arc<Cluster>> {
        self.clusters.get(name).cloned().ok_or_else(|| {
            PlatformError::ResourceMissing {
                kind: "Cluster".into(),
                name: name.into(),
            }
            .into()
        })
    }

    /// The default cluster available to the given tenant.
    pub fn default_for_tenant(&self, tenant_id: &str) -> Option<Arc<Cluster>> {
        let mut tenant_clusters: Vec<_> = self.clusters.values().filter(|cluster| cluster.tenant_id == tenant_id).collect();
        tenant_clusters.sort_by(|a, b| a.name.cmp(&b.name));
        tenant_clusters
            .iter()
            .find(|cluster| cluster.is_default)
            .or_else(|| tenant_clusters.first())
            .map(|cluster| Arc::clone(cluster))
    }

    /// Build a Kubernetes client for the given cluster from its credentials blob.
    pub async fn client_for(&self, cluster: &Cluster) -> Result<Client> {
        let kubeconfig: Kubeconfig = serde_yaml::from_str(&cluster.credentials).context("error parsing cluster credentials blob")?;
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .context("error building client config from cluster credentials")?;
        Client::try_from(config).context("error initializing cluster client")
    }
}

/// Resolves the effective cluster of a module environment.
///
/// An explicit binding row wins; otherwise the tenant default is returned.
pub struct EnvClusterService {
    registry: Arc<ClusterRegistry>,
    bindings: Tree,
}

impl EnvClusterService {
    /// Create a new instance.
    pub fn new(registry: Arc<ClusterRegistry>, db: &Database) -> Result<Self> {
        Ok(Self {
            registry,
            bindings: db.env_clusters()?,
        })
    }

    /// The effective cluster for the given environment.
    pub fn get_cluster(&self, env: &ModuleEnvironment) -> Result<Arc<Cluster>> {
        let key = env.release_key();
        if let Some(raw) = self.bindings.get(key.as_bytes()).context("error reading env cluster binding")? {
            let name: String = decode_model(&raw)?;
            return self.registry.get(&name);
        }
        self.registry
            .default_for_tenant(&env.application.tenant_id)
            .ok_or_else(|| PlatformError::CannotDeployApp(format!("no cluster available for tenant {}", env.application.tenant_id)).into())
    }

    /// Bind the given environment to the named cluster, overwriting any
    /// previous binding.
    pub fn bind_cluster(&self, env: &ModuleEnvironment, name: &str) -> Result<()> {
        // Validate the target exists before writing the binding.
        let _cluster = self.registry.get(name)?;
        self.bindings
            .insert(env.release_key().as_bytes(), encode_model(&name.to_string())?)
            .context("error writing env cluster binding")?;
        Ok(())
    }
}

#[cfg(test)]
mod mod_test;
