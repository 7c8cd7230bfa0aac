//! Database management.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Config as SledConfig, Db, IVec};

use crate::config::Config;

pub type Tree = sled::Tree;

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/wharf/db";
/// The DB tree holding resource plans.
const TREE_PLANS: &str = "plans";
/// The DB tree holding process specs.
const TREE_PROCESS_SPECS: &str = "process_specs";
/// The DB tree holding build records.
const TREE_BUILDS: &str = "builds";
/// The DB tree holding build attempts.
const TREE_BUILD_PROCESSES: &str = "build_processes";
/// The DB tree holding releases.
const TREE_RELEASES: &str = "releases";
/// The DB tree holding release attempts.
const TREE_DEPLOYMENTS: &str = "deployments";
/// The DB tree holding cloud-native model deploy rows.
const TREE_APP_MODEL_DEPLOYS: &str = "app_model_deploys";
/// The DB tree holding engine-app runtime config snapshots.
const TREE_CONFIGS: &str = "configs";
/// The DB tree holding cluster-state snapshots.
const TREE_CLUSTER_STATES: &str = "cluster_states";
/// The DB tree holding app -> cluster-state bindings.
const TREE_STATE_BINDINGS: &str = "state_bindings";
/// The DB tree holding env -> cluster bindings.
const TREE_ENV_CLUSTERS: &str = "env_clusters";
/// The DB tree holding egress specs.
const TREE_EGRESS_SPECS: &str = "egress_specs";
/// The DB tree holding release locks.
const TREE_LOCKS: &str = "locks";
/// The DB tree holding poller metadata.
const TREE_POLLERS: &str = "pollers";

/// The default path to use for data storage.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

/// An abstraction over the engine database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// System runtime config.
    #[allow(dead_code)]
    config: Arc<Config>,
    /// The underlying DB handle.
    db: Db,
}

impl Database {
    /// Open the database for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // Determine the database path, and ensure it exists.
        let dbpath = PathBuf::from(&config.storage_data_path).join("engine");
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for wharf engine database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput).open()?;
            let inner = Arc::new(DatabaseInner { config, db });
            Ok(Self { inner })
        })
        .await?
    }

    /// Spawn a blocking database-related function.
    #[tracing::instrument(level = "trace", skip(f), err)]
    pub async fn spawn_blocking<F, R>(f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f).await.context("error joining spawned blocking task")
    }

    fn open_tree(&self, name: &str) -> Result<Tree> {
        self.inner
            .db
            .open_tree(IVec::from(name))
            .map_err(|err| anyhow!("could not open DB tree {} {}", name, err))
    }

    pub fn plans(&self) -> Result<Tree> {
        self.open_tree(TREE_PLANS)
    }

    pub fn process_specs(&self) -> Result<Tree> {
        self.open_tree(TREE_PROCESS_SPECS)
    }

    pub fn builds(&self) -> Result<Tree> {
        self.open_tree(TREE_BUILDS)
    }

    pub fn build_processes(&self) -> Result<Tree> {
        self.open_tree(TREE_BUILD_PROCESSES)
    }

    pub fn releases(&self) -> Result<Tree> {
        self.open_tree(TREE_RELEASES)
    }

    pub fn deployments(&self) -> Result<Tree> {
        self.open_tree(TREE_DEPLOYMENTS)
    }

    pub fn app_model_deploys(&self) -> Result<Tree> {
        self.open_tree(TREE_APP_MODEL_DEPLOYS)
    }

    pub fn configs(&self) -> Result<Tree> {
        self.open_tree(TREE_CONFIGS)
    }

    pub fn cluster_states(&self) -> Result<Tree> {
        self.open_tree(TREE_CLUSTER_STATES)
    }

    pub fn state_bindings(&self) -> Result<Tree> {
        self.open_tree(TREE_STATE_BINDINGS)
    }

    pub fn env_clusters(&self) -> Result<Tree> {
        self.open_tree(TREE_ENV_CLUSTERS)
    }

    pub fn egress_specs(&self) -> Result<Tree> {
        self.open_tree(TREE_EGRESS_SPECS)
    }

    pub fn locks(&self) -> Result<Tree> {
        self.open_tree(TREE_LOCKS)
    }

    pub fn pollers(&self) -> Result<Tree> {
        self.open_tree(TREE_POLLERS)
    }
}

/// Encode the given model as JSON bytes for storage.
pub fn encode_model<M: Serialize>(model: &M) -> Result<Vec<u8>> {
    serde_json::to_vec(model).context("error serializing data model")
}

/// Decode an object from the given storage buffer.
pub fn decode_model<M: DeserializeOwned>(data: &[u8]) -> Result<M> {
    serde_json::from_slice(data).context("error decoding object from storage")
}

/// Iterate a tree prefix, decoding every value as the given model.
pub fn scan_prefix_models<M: DeserializeOwned>(tree: &Tree, prefix: &str) -> Result<Vec<M>> {
    let mut models = vec![];
    for kv_res in tree.scan_prefix(prefix.as_bytes()) {
        let (_key, val) = kv_res.context("error iterating tree prefix")?;
        models.push(decode_model(&val)?);
    }
    Ok(models)
}
