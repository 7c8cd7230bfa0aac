//! Runtime configuration.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer};

use wharf_core::models::{Cluster, Environment};
use wharf_core::plan::PLAN_NAME_DEFAULT;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port used for HTTP healthchecks & metrics.
    pub http_port: u16,
    /// The service name used as a global metrics label.
    #[serde(default = "Config::default_service_name")]
    pub service_name: String,

    /// The path to the database on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,

    /// The fallback plan name used when a sync sees no plan.
    #[serde(default = "Config::default_proc_spec_plan")]
    pub default_proc_spec_plan: String,
    /// Default replica counts keyed by `{process_type}.{environment}`.
    #[serde(default, deserialize_with = "Config::parse_json_map")]
    pub engine_proc_replicas_by_type: BTreeMap<String, u32>,
    /// The replica cap applied to default cloud-native plans.
    #[serde(default = "Config::default_cnative_max_replicas")]
    pub default_cnative_max_replicas: u32,
    /// Consecutive `Error` states tolerated while polling a cloud-native deploy.
    #[serde(default = "Config::default_polling_failure_limits")]
    pub cnative_deploy_status_polling_failure_limits: u32,

    /// Registered clusters, including credential blobs & ingress domains.
    #[serde(default, deserialize_with = "Config::parse_json_seq")]
    pub clusters: Vec<Cluster>,

    /// The name of the image pull secret referenced by builder pods.
    #[serde(default = "Config::default_builder_pull_secret")]
    pub builder_pull_secret: String,
    /// Container registry settings, JSON encoded.
    #[serde(default, deserialize_with = "Config::parse_registry")]
    pub registry: RegistryConfig,

    /// TTL of a release lock; must exceed the maximum release duration.
    #[serde(default = "Config::default_release_lock_ttl")]
    pub release_lock_ttl_seconds: u64,
    /// Overall wall-clock cap for one build.
    #[serde(default = "Config::default_build_timeout")]
    pub build_timeout_seconds: u64,
    /// Overall wall-clock cap for one release.
    #[serde(default = "Config::default_release_timeout")]
    pub release_timeout_seconds: u64,
    /// How long to wait for a fresh namespace's default ServiceAccount.
    #[serde(default = "Config::default_sa_wait_timeout")]
    pub sa_wait_timeout_seconds: u64,

    /// The signing secret for web-console session tokens, base64 encoded.
    #[serde(default)]
    pub webconsole_signing_secret: Option<String>,
}

/// Container registry connection settings.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub host: String,
    /// The repository namespace under which application images are pushed.
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds
    /// the application config from that. In the future, this may take into
    /// account an optional config file as well.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::from_env().context("error building config from env")
    }

    /// The default replica count for a process type in an environment.
    pub fn default_replicas_for(&self, process_type: &str, environment: Environment) -> u32 {
        self.engine_proc_replicas_by_type
            .get(&format!("{}.{}", process_type, environment))
            .copied()
            .unwrap_or(1)
    }

    fn default_service_name() -> String {
        "wharf-engine".into()
    }

    fn default_proc_spec_plan() -> String {
        PLAN_NAME_DEFAULT.into()
    }

    fn default_cnative_max_replicas() -> u32 {
        10
    }

    fn default_polling_failure_limits() -> u32 {
        10
    }

    fn default_builder_pull_secret() -> String {
        "wharf-image-pull".into()
    }

    fn default_release_lock_ttl() -> u64 {
        1200
    }

    fn default_build_timeout() -> u64 {
        3600
    }

    fn default_release_timeout() -> u64 {
        900
    }

    fn default_sa_wait_timeout() -> u64 {
        60
    }

    /// Parse a JSON-encoded map from its env var form.
    fn parse_json_map<'de, D: Deserializer<'de>>(val: D) -> Result<BTreeMap<String, u32>, D::Error> {
        let raw: String = Deserialize::deserialize(val)?;
        serde_json::from_str(&raw).map_err(|err| DeError::custom(format!("error parsing ENGINE_PROC_REPLICAS_BY_TYPE: {}", err)))
    }

    /// Parse a JSON-encoded sequence from its env var form.
    fn parse_json_seq<'de, D: Deserializer<'de>>(val: D) -> Result<Vec<Cluster>, D::Error> {
        let raw: String = Deserialize::deserialize(val)?;
        serde_json::from_str(&raw).map_err(|err| DeError::custom(format!("error parsing CLUSTERS: {}", err)))
    }

    /// Parse the JSON-encoded registry settings from their env var form.
    fn parse_registry<'de, D: Deserializer<'de>>(val: D) -> Result<RegistryConfig, D::Error> {
        let raw: String = Deserialize::deserialize(val)?;
        serde_json::from_str(&raw).map_err(|err| DeError::custom(format!("error parsing REGISTRY: {}", err)))
    }
}

#[cfg(test)]
impl Config {
    /// Create a config instance for tests, backed by a temp dir for storage.
    pub fn new_test() -> Result<(std::sync::Arc<Config>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir().context("error creating temp dir for test config")?;
        let config = Config {
            rust_log: String::new(),
            http_port: 0,
            service_name: Self::default_service_name(),
            storage_data_path: tmpdir.path().to_string_lossy().to_string(),
            default_proc_spec_plan: Self::default_proc_spec_plan(),
            engine_proc_replicas_by_type: Default::default(),
            default_cnative_max_replicas: Self::default_cnative_max_replicas(),
            cnative_deploy_status_polling_failure_limits: 3,
            clusters: vec![],
            builder_pull_secret: Self::default_builder_pull_secret(),
            registry: Default::default(),
            release_lock_ttl_seconds: Self::default_release_lock_ttl(),
            build_timeout_seconds: Self::default_build_timeout(),
            release_timeout_seconds: Self::default_release_timeout(),
            sa_wait_timeout_seconds: Self::default_sa_wait_timeout(),
            webconsole_signing_secret: Some(base64::encode(b"test-signing-secret")),
        };
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
