//! Orchestration entry points.
//!
//! The public face of the core. A single `Platform` context is created at
//! startup and threaded through; the `Orchestrator` exposes the operations
//! the subsystem offers to its callers: spec sync, deploys, process control,
//! log access, builds & cluster-state management.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use kube::client::Client;
use tokio::sync::mpsc;

use crate::build::{BuildParams, BuildSubsystem};
use crate::cluster::{self, ClusterRegistry, ClusterStateStore, EnvClusterService};
use crate::config::Config;
use crate::database::Database;
use crate::k8s::LogOptions;
use crate::processes::{ProcessController, ProcessListSnapshot};
use crate::release::{legacy, DeploymentCoordinator, ReleaseContext, ReleaseManager};
use crate::store::{ConfigStructureResolver, PlanStore, ProcessSpecStore, RuntimeConfigStore};
use wharf_core::descriptor::ModuleDescription;
use wharf_core::models::{Build, ClusterState, Deployment, ModuleEnvironment, ProcessTmpl, TargetStatus};
use wharf_core::PlatformError;

/// Decides whether a deploy into an environment is currently allowed.
pub trait EnvProtectionPolicy: Send + Sync {
    /// Fails with `RestrictRoleDeployEnabled` when the environment is protected.
    fn check_deploy(&self, env: &ModuleEnvironment) -> Result<()>;
}

/// The default policy: every environment is deployable.
pub struct AllowAllPolicy;

impl EnvProtectionPolicy for AllowAllPolicy {
    fn check_deploy(&self, _env: &ModuleEnvironment) -> Result<()> {
        Ok(())
    }
}

/// The platform context created once at startup.
pub struct Platform {
    pub config: Arc<Config>,
    pub clusters: Arc<ClusterRegistry>,
    pub env_clusters: EnvClusterService,
    pub plans: PlanStore,
    pub specs: ProcessSpecStore,
    pub runtime_configs: RuntimeConfigStore,
    pub states: ClusterStateStore,
    pub builds: BuildSubsystem,
    pub releases: ReleaseManager,
    pub controller: ProcessController,
    pub env_protection: Box<dyn EnvProtectionPolicy>,
}

impl Platform {
    /// Wire the platform context from config & an open database.
    pub fn new(config: Arc<Config>, db: Database) -> Result<Self> {
        let clusters = Arc::new(ClusterRegistry::new(config.clusters.clone()));
        let env_clusters = EnvClusterService::new(Arc::clone(&clusters), &db)?;
        let plans = PlanStore::new(&db)?;
        plans.ensure_defaults(&config)?;
        let resolver = Arc::new(ConfigStructureResolver::new(Arc::clone(&config)));
        let specs = ProcessSpecStore::new(&db, plans.clone(), resolver, config.default_proc_spec_plan.clone())?;
        let runtime_configs = RuntimeConfigStore::new(&db)?;
        let states = ClusterStateStore::new(&db)?;
        let builds = BuildSubsystem::new(Arc::clone(&config), &db)?;
        let coordinator = Arc::new(DeploymentCoordinator::new(&db, config.release_lock_ttl_seconds)?);
        let releases = ReleaseManager::new(Arc::clone(&config), &db, coordinator)?;
        let controller = ProcessController::new(Arc::clone(&config));
        Ok(Self {
            env_clusters,
            plans,
            specs,
            runtime_configs,
            states,
            builds,
            releases,
            controller,
            clusters,
            env_protection: Box::new(AllowAllPolicy),
            config,
        })
    }

    /// The cluster client of the given environment.
    pub async fn client_for(&self, env: &ModuleEnvironment) -> Result<Client> {
        let cluster = self.env_clusters.get_cluster(env)?;
        self.clusters.client_for(&cluster).await
    }
}

/// A deploy request.
#[derive(Clone, Debug)]
pub struct DeployRequest {
    /// One of `branch`, `image` or `build`.
    pub version_type: String,
    pub version_name: String,
    pub revision: String,
    /// Extra environment variables layered over the release env.
    pub extra_envs: BTreeMap<String, String>,
    /// The module description driving cloud-native materialization.
    pub description: Option<ModuleDescription>,
}

/// The orchestration facade.
pub struct Orchestrator {
    platform: Arc<Platform>,
}

impl Orchestrator {
    /// Create a new instance.
    pub fn new(platform: Arc<Platform>) -> Self {
        Self { platform }
    }

    /// Persist the desired process state of the environment.
    #[tracing::instrument(level = "debug", skip(self, env, processes))]
    pub fn sync_process_specs(&self, env: &ModuleEnvironment, processes: &[ProcessTmpl]) -> Result<()> {
        if env.application.tenant_id != env.engine_app.tenant_id {
            return Err(PlatformError::InvalidInput(format!(
                "tenant mismatch between application {} and engine app {}",
                env.application.tenant_id, env.engine_app.tenant_id
            ))
            .into());
        }
        self.platform.specs.sync(env, processes)
    }

    /// Run a release of the named artifact into the environment.
    #[tracing::instrument(level = "debug", skip(self, env, request))]
    pub async fn deploy(&self, env: &ModuleEnvironment, request: DeployRequest) -> Result<Deployment> {
        self.platform.env_protection.check_deploy(env)?;

        let build = self
            .platform
            .builds
            .resolve_build(env.engine_app.uuid, &request.version_type, &request.version_name, &request.revision)?;
        let cluster = self.platform.env_clusters.get_cluster(env)?;
        let client = self.platform.clusters.client_for(&cluster).await?;

        let platform = Arc::clone(&self.platform);
        let env_cloned = env.clone();
        self.platform
            .releases
            .deploy(env, move |deployment| {
                build_release_context(&platform, client, env_cloned, deployment, build, request)
            })
            .await
    }

    /// Request interruption of the environment's ongoing release.
    pub fn interrupt_release(&self, env: &ModuleEnvironment) -> Result<bool> {
        self.platform.releases.interrupt(&env.release_key())
    }

    /// List the environment's processes with their instances.
    pub async fn list_processes(&self, env: &ModuleEnvironment) -> Result<ProcessListSnapshot> {
        let client = self.platform.client_for(env).await?;
        self.platform.controller.list_processes(client, env).await
    }

    /// Scale the named process, enforcing the plan cap at the edge.
    #[tracing::instrument(level = "debug", skip(self, env))]
    pub async fn scale_process(&self, env: &ModuleEnvironment, process_type: &str, replicas: u32) -> Result<()> {
        let spec = self.platform.specs.set_target_replicas(env.engine_app.uuid, process_type, replicas)?;
        let client = self.platform.client_for(env).await?;
        legacy::scale_processes(client, env, &[(spec.name.clone(), replicas)]).await
    }

    /// Stop the named process: zero replicas, Services & Ingresses untouched.
    #[tracing::instrument(level = "debug", skip(self, env))]
    pub async fn stop_process(&self, env: &ModuleEnvironment, process_type: &str) -> Result<()> {
        let spec = self.platform.specs.set_target_status(env.engine_app.uuid, process_type, TargetStatus::Stop)?;
        let client = self.platform.client_for(env).await?;
        legacy::shutdown_processes(client, env, &[spec.name.clone()]).await
    }

    /// Start the named process back up to its target replicas.
    #[tracing::instrument(level = "debug", skip(self, env))]
    pub async fn start_process(&self, env: &ModuleEnvironment, process_type: &str) -> Result<()> {
        let spec = self.platform.specs.set_target_status(env.engine_app.uuid, process_type, TargetStatus::Start)?;
        let client = self.platform.client_for(env).await?;
        legacy::scale_processes(client, env, &[(spec.name.clone(), spec.target_replicas)]).await
    }

    /// Trigger a rollout restart of the named process.
    pub async fn restart_process(&self, env: &ModuleEnvironment, process_type: &str) -> Result<()> {
        let client = self.platform.client_for(env).await?;
        legacy::restart_process(client, env, process_type).await
    }

    /// Read an instance's log in one shot.
    pub async fn get_instance_logs(&self, env: &ModuleEnvironment, instance_name: &str, opts: LogOptions) -> Result<String> {
        let client = self.platform.client_for(env).await?;
        self.platform.controller.get_instance_logs(client, env, instance_name, opts).await
    }

    /// Watch the environment's pods as a finite stream of events.
    pub async fn watch_instances(
        &self, env: &ModuleEnvironment, timeout_seconds: Option<u32>,
    ) -> Result<impl futures::Stream<Item = std::result::Result<kube::runtime::watcher::Event<k8s_openapi::api::core::v1::Pod>, kube::runtime::watcher::Error>>>
    {
        let client = self.platform.client_for(env).await?;
        Ok(self.platform.controller.watch_instances(client, env, timeout_seconds))
    }

    /// Follow an instance's log as a lazy line stream.
    pub async fn stream_instance_logs(
        &self, env: &ModuleEnvironment, instance_name: &str, opts: LogOptions,
    ) -> Result<impl futures::Stream<Item = String>> {
        let client = self.platform.client_for(env).await?;
        self.platform.controller.get_instance_logs_stream(client, env, instance_name, opts).await
    }

    /// Run a build of the environment's source, streaming builder logs to
    /// the given channel.
    pub async fn build_source(&self, env: &ModuleEnvironment, params: BuildParams, log_tx: mpsc::Sender<String>) -> Result<Build> {
        let client = self.platform.client_for(env).await?;
        self.platform.builds.build_source(client, env, params, log_tx).await
    }

    /// Interrupt the environment's running build, reporting whether a builder
    /// pod existed.
    pub async fn interrupt_build(&self, env: &ModuleEnvironment) -> Result<bool> {
        let client = self.platform.client_for(env).await?;
        self.platform.builds.interrupt_build(client, env).await
    }

    /// Snapshot the named cluster's nodes into a content-addressed state.
    pub async fn generate_cluster_state(&self, cluster_name: &str, ignore_labels: &BTreeMap<String, String>) -> Result<ClusterState> {
        let cluster = self.platform.clusters.get(cluster_name)?;
        let client = self.platform.clusters.client_for(&cluster).await?;
        let state = cluster::generate_state(&self.platform.states, client.clone(), cluster_name, ignore_labels).await?;
        cluster::sync_state_to_nodes(client, &state).await?;
        Ok(state)
    }

    /// Bind the environment's engine app to the given cluster state.
    pub fn bind_cluster_state(&self, env: &ModuleEnvironment, state: &ClusterState) -> Result<()> {
        self.platform.states.bind_app(&env.engine_app, state).map(|_binding| ())
    }

    /// The egress IPs of the named cluster.
    pub async fn get_cluster_egress_ips(&self, cluster_name: &str) -> Result<(String, Vec<String>)> {
        let cluster = self.platform.clusters.get(cluster_name)?;
        let client = self.platform.clusters.client_for(&cluster).await?;
        cluster::get_cluster_egress_ips(client).await
    }

    /// Allocate a web-console session in the target instance.
    pub fn create_webconsole(
        &self, env: &ModuleEnvironment, operator: &str, process_type: &str, instance_name: &str, container_name: &str, command: Option<&str>,
    ) -> Result<String> {
        self.platform
            .controller
            .create_webconsole(env, operator, process_type, instance_name, container_name, command.unwrap_or("bash"))
    }
}

/// Snapshot everything one release needs into its context.
fn build_release_context(
    platform: &Platform, client: Client, env: ModuleEnvironment, deployment: Deployment, build: Build, request: DeployRequest,
) -> Result<ReleaseContext> {
    let release = platform.releases.store().create_release(env.engine_app.uuid, build.id)?;
    let specs = platform.specs.list(env.engine_app.uuid)?;

    let mut plans = HashMap::new();
    for spec in &specs {
        if plans.contains_key(&spec.plan) {
            continue;
        }
        let plan = platform.plans.get_by_name(&spec.plan)?.ok_or_else(|| PlatformError::ResourceMissing {
            kind: "Plan".into(),
            name: spec.plan.clone(),
        })?;
        plans.insert(spec.plan.clone(), plan);
    }

    let runtime = platform
        .runtime_configs
        .current(env.engine_app.uuid)
        .context("error reading runtime config snapshot")?
        .unwrap_or_default();
    let binding = platform.states.get_binding(&env.engine_app)?;
    let cluster = platform.env_clusters.get_cluster(&env)?;

    Ok(ReleaseContext {
        client,
        cluster,
        deployment,
        release,
        build,
        specs,
        plans,
        runtime,
        binding,
        description: request.description,
        extra_envs: request.extra_envs,
        env,
    })
}

impl Orchestrator {
    /// Append a runtime-config snapshot for the environment's engine app.
    pub fn save_runtime_config(&self, env: &ModuleEnvironment, config: wharf_core::models::RuntimeConfig) -> Result<wharf_core::models::RuntimeConfig> {
        self.platform.runtime_configs.append(env.engine_app.uuid, config)
    }

    /// The most recent runtime-config snapshot of the engine app.
    pub fn current_runtime_config(&self, env: &ModuleEnvironment) -> Result<Option<wharf_core::models::RuntimeConfig>> {
        self.platform.runtime_configs.current(env.engine_app.uuid)
    }
}

#[cfg(test)]
mod mod_test;
