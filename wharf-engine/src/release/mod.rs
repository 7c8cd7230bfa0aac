//! Release state machine.
//!
//! Per (application, module, environment) the engine guarantees at-most-one
//! ongoing release, coordinated through a TTL mutex in the shared store. Two
//! release paths exist: "legacy" (raw Deployments/Services/Ingresses) and
//! "cloud-native" (the BkApp CRD plus a status poller). They share the
//! coordinator and the abort-policy list but deliberately not their manifest
//! rendering; the field sets are different.

pub mod cnative;
pub mod legacy;
pub mod poller;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use kube::client::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;
use crate::database::{decode_model, encode_model, scan_prefix_models, Database, Tree};
use wharf_core::descriptor::ModuleDescription;
use wharf_core::models::{
    Build, Cluster, DeployStatus, Deployment, ModuleEnvironment, ProcessSpec, RCStateAppBinding, Release, ReleasePhase, RuntimeConfig,
};
use wharf_core::plan::Plan;
use wharf_core::PlatformError;

const METRIC_RELEASES_STARTED: &str = "wharf_releases_started";
const METRIC_RELEASES_COMPLETED: &str = "wharf_releases_completed";
const METRIC_RELEASES_FAILED: &str = "wharf_releases_failed";

/// The record held in the lock tree for one environment.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct LockRecord {
    deployment: Uuid,
    expires_at: DateTime<Utc>,
}

/// The per-environment release mutex.
///
/// `acquire_lock` is atomic; `release_lock` is best-effort and stale locks
/// time out through their TTL, which must exceed the maximum release
/// duration.
pub struct DeploymentCoordinator {
    locks: Tree,
    ttl: ChronoDuration,
}

impl DeploymentCoordinator {
    /// Create a new instance.
    pub fn new(db: &Database, ttl_seconds: u64) -> Result<Self> {
        Ok(Self {
            locks: db.locks()?,
            ttl: ChronoDuration::seconds(ttl_seconds as i64),
        })
    }

    /// Acquire the release lock of the given environment for the given
    /// deployment, failing with `CannotDeployOngoingExists` while held.
    pub fn acquire_lock(&self, env_key: &str, deployment: Uuid) -> Result<()> {
        let current_raw = self.locks.get(env_key.as_bytes()).context("error reading release lock")?;
        if let Some(raw) = &current_raw {
            let current: LockRecord = decode_model(raw)?;
            if current.expires_at > Utc::now() {
                return Err(PlatformError::CannotDeployOngoingExists.into());
            }
        }
        let record = LockRecord {
            deployment,
            expires_at: Utc::now() + self.ttl,
        };
        let swap = self
            .locks
            .compare_and_swap(env_key.as_bytes(), current_raw, Some(encode_model(&record)?))
            .context("error acquiring release lock")?;
        match swap {
            Ok(()) => Ok(()),
            // Lost the race against a concurrent acquirer.
            Err(_cas) => Err(PlatformError::CannotDeployOngoingExists.into()),
        }
    }

    /// Release the lock of the given environment if held by the given
    /// deployment.
    pub fn release_lock(&self, env_key: &str, deployment: Uuid) -> Result<()> {
        let current_raw = self.locks.get(env_key.as_bytes()).context("error reading release lock")?;
        let raw = match current_raw {
            Some(raw) => raw,
            None => return Ok(()),
        };
        let current: LockRecord = decode_model(&raw)?;
        if current.deployment != deployment {
            return Ok(()); // Another deployment holds the lock now.
        }
        let _res = self
            .locks
            .compare_and_swap(env_key.as_bytes(), Some(raw), None::<sled::IVec>)
            .context("error releasing release lock")?;
        Ok(())
    }

    /// The ongoing deployment of the given environment, if locked.
    pub fn get_current_deployment(&self, env_key: &str) -> Result<Option<Uuid>> {
        let raw = self.locks.get(env_key.as_bytes()).context("error reading release lock")?;
        match raw {
            Some(raw) => {
                let record: LockRecord = decode_model(&raw)?;
                if record.expires_at > Utc::now() {
                    Ok(Some(record.deployment))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// Release & Deployment Records //////////////////////////////////////////////

/// Persistence for releases and release attempts.
#[derive(Clone)]
pub struct ReleaseStore {
    releases: Tree,
    deployments: Tree,
}

impl ReleaseStore {
    /// Create a new instance.
    pub fn new(db: &Database) -> Result<Self> {
        Ok(Self {
            releases: db.releases()?,
            deployments: db.deployments()?,
        })
    }

    fn release_key(engine_app: Uuid, version: u64) -> String {
        format!("{}/{:010}", engine_app, version)
    }

    /// Record a new release with the next version number of the engine app.
    ///
    /// Version assignment is serialized by the release lock.
    pub fn create_release(&self, engine_app: Uuid, build: Uuid) -> Result<Release> {
        let last_version = self
            .list_releases(engine_app)?
            .last()
            .map(|release| release.version)
            .unwrap_or(0);
        let release = Release {
            id: Uuid::new_v4(),
            engine_app,
            version: last_version + 1,
            build,
            failed: false,
            summary: None,
            created: Utc::now(),
        };
        self.releases
            .insert(Self::release_key(engine_app, release.version).as_bytes(), encode_model(&release)?)
            .context("error writing release")?;
        Ok(release)
    }

    /// All releases of the given engine app, in version order.
    pub fn list_releases(&self, engine_app: Uuid) -> Result<Vec<Release>> {
        scan_prefix_models(&self.releases, &format!("{}/", engine_app))
    }

    /// Mark the given release failed with a summary.
    pub fn mark_release_failed(&self, release: &Release, summary: &str) -> Result<()> {
        let mut updated = release.clone();
        updated.failed = true;
        updated.summary = Some(summary.to_string());
        self.releases
            .insert(Self::release_key(release.engine_app, release.version).as_bytes(), encode_model(&updated)?)
            .context("error writing release")?;
        Ok(())
    }

    /// Record the given deployment attempt.
    pub fn save_deployment(&self, deployment: &Deployment) -> Result<()> {
        self.deployments
            .insert(deployment.id.to_string().as_bytes(), encode_model(deployment)?)
            .context("error writing deployment")?;
        Ok(())
    }

    /// Fetch the deployment attempt with the given id.
    pub fn get_deployment(&self, id: Uuid) -> Result<Deployment> {
        let raw = self
            .deployments
            .get(id.to_string().as_bytes())
            .context("error reading deployment")?
            .ok_or(PlatformError::ResourceMissing {
                kind: "Deployment".into(),
                name: id.to_string(),
            })?;
        decode_model(&raw)
    }

    /// Transition the deployment to the given phase.
    pub fn set_phase(&self, id: Uuid, phase: ReleasePhase) -> Result<Deployment> {
        let mut deployment = self.get_deployment(id)?;
        deployment.phase = phase;
        self.save_deployment(&deployment)?;
        Ok(deployment)
    }

    /// Request interruption of the given deployment.
    ///
    /// The next poll tick observes the timestamp and transitions to
    /// `interrupted`.
    pub fn request_interrupt(&self, id: Uuid) -> Result<Deployment> {
        let mut deployment = self.get_deployment(id)?;
        deployment.release_int_requested_at = Some(Utc::now());
        self.save_deployment(&deployment)?;
        Ok(deployment)
    }
}

//////////////////////////////////////////////////////////////////////////////
// Strategies ////////////////////////////////////////////////////////////////

/// Everything a release strategy needs to materialize one release.
pub struct ReleaseContext {
    pub client: Client,
    pub env: ModuleEnvironment,
    pub cluster: Arc<Cluster>,
    pub deployment: Deployment,
    pub release: Release,
    pub build: Build,
    pub specs: Vec<ProcessSpec>,
    /// Plans referenced by the specs, keyed by name.
    pub plans: HashMap<String, Plan>,
    /// The current runtime config snapshot of the engine app.
    pub runtime: RuntimeConfig,
    /// The cluster-state binding of the engine app, if any.
    pub binding: Option<RCStateAppBinding>,
    /// The module description driving cloud-native releases.
    pub description: Option<ModuleDescription>,
    /// Extra environment variables supplied by the caller.
    pub extra_envs: std::collections::BTreeMap<String, String>,
}

/// What a strategy left behind after its apply step.
#[derive(Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// All workloads converged synchronously; the release is done.
    Released,
    /// A poller is now watching the applied model; completion is async.
    Polling,
}

/// One of the two release paths.
#[async_trait]
pub trait ReleaseStrategy: Send + Sync {
    /// Apply the release onto the cluster.
    async fn execute(&self, ctx: &ReleaseContext) -> Result<ReleaseOutcome>;
}

//////////////////////////////////////////////////////////////////////////////
// Manager ///////////////////////////////////////////////////////////////////

/// Drives release attempts through their phases.
pub struct ReleaseManager {
    config: Arc<Config>,
    coordinator: Arc<DeploymentCoordinator>,
    store: ReleaseStore,
    deploys: cnative::AppModelDeployStore,
    pollers: Tree,
}

impl ReleaseManager {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, db: &Database, coordinator: Arc<DeploymentCoordinator>) -> Result<Self> {
        metrics::register_counter!(METRIC_RELEASES_STARTED, metrics::Unit::Count, "release attempts started");
        metrics::register_counter!(METRIC_RELEASES_COMPLETED, metrics::Unit::Count, "release attempts completed successfully");
        metrics::register_counter!(METRIC_RELEASES_FAILED, metrics::Unit::Count, "release attempts which failed or were interrupted");
        Ok(Self {
            store: ReleaseStore::new(db)?,
            deploys: cnative::AppModelDeployStore::new(db)?,
            pollers: db.pollers()?,
            config,
            coordinator,
        })
    }

    /// The release/deployment record store.
    pub fn store(&self) -> &ReleaseStore {
        &self.store
    }

    /// Run one full release attempt.
    ///
    /// Acquires the environment lock, walks the phase machine, and for
    /// cloud-native apps leaves a poller behind which finishes the attempt
    /// asynchronously.
    #[tracing::instrument(level = "debug", skip(self, ctx_builder))]
    pub async fn deploy(&self, env: &ModuleEnvironment, ctx_builder: impl FnOnce(Deployment) -> Result<ReleaseContext> + Send) -> Result<Deployment> {
        let env_key = env.release_key();
        let deployment_id = Uuid::new_v4();
        self.coordinator.acquire_lock(&env_key, deployment_id)?;
        metrics::increment_counter!(METRIC_RELEASES_STARTED);

        let deployment = Deployment {
            id: deployment_id,
            env_key: env_key.clone(),
            engine_app: env.engine_app.uuid,
            release: Uuid::nil(),
            phase: ReleasePhase::Pending,
            release_int_requested_at: None,
            created: Utc::now(),
        };
        self.store.save_deployment(&deployment)?;

        // preparing: the caller snapshots desired state into the context.
        self.store.set_phase(deployment_id, ReleasePhase::Preparing)?;
        let mut ctx = match ctx_builder(deployment) {
            Ok(ctx) => ctx,
            Err(err) => {
                self.store.set_phase(deployment_id, ReleasePhase::PreparingFailed)?;
                self.coordinator.release_lock(&env_key, deployment_id)?;
                metrics::increment_counter!(METRIC_RELEASES_FAILED);
                return Err(err);
            }
        };
        ctx.deployment.release = ctx.release.id;
        self.store.save_deployment(&ctx.deployment)?;

        if ctx.specs.is_empty() {
            self.fail(&ctx, ReleasePhase::PreparingFailed, "no process specs to release")?;
            return Err(PlatformError::CannotDeployApp("no process specs to release".into()).into());
        }

        // releasing: hand off to the path-specific strategy.
        self.store.set_phase(deployment_id, ReleasePhase::Releasing)?;
        let strategy = self.strategy_for(&ctx);
        let outcome = match strategy.execute(&ctx).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.fail(&ctx, ReleasePhase::ReleasedFailed, &err.to_string())?;
                return Err(err);
            }
        };

        let deployment = match outcome {
            ReleaseOutcome::Released => {
                let deployment = self.store.set_phase(deployment_id, ReleasePhase::Released)?;
                self.coordinator.release_lock(&env_key, deployment_id)?;
                metrics::increment_counter!(METRIC_RELEASES_COMPLETED);
                tracing::info!(deployment = %deployment_id, "release completed");
                deployment
            }
            ReleaseOutcome::Polling => {
                let deployment = self.store.set_phase(deployment_id, ReleasePhase::Polling)?;
                self.spawn_poller(&ctx)?;
                deployment
            }
        };
        Ok(deployment)
    }

    /// Request interruption of the ongoing release of the given environment.
    pub fn interrupt(&self, env_key: &str) -> Result<bool> {
        match self.coordinator.get_current_deployment(env_key)? {
            Some(deployment_id) => {
                self.store.request_interrupt(deployment_id)?;
                tracing::info!(deployment = %deployment_id, "release interruption requested");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn strategy_for(&self, ctx: &ReleaseContext) -> Box<dyn ReleaseStrategy> {
        match ctx.env.application.app_type {
            wharf_core::models::AppType::CloudNative => Box::new(cnative::CloudNativeReleaseStrategy::new(self.deploys.clone())),
            wharf_core::models::AppType::Default => Box::new(legacy::LegacyReleaseStrategy::new(Arc::clone(&self.config))),
        }
    }

    /// Spawn the status poller of a cloud-native release, plus the completion
    /// handler which finishes the attempt.
    fn spawn_poller(&self, ctx: &ReleaseContext) -> Result<()> {
        let poller = poller::WaitAppModelReady::new(
            ctx.client.clone(),
            ctx.env.engine_app.namespace.clone(),
            ctx.env.engine_app.scheduler_safe_name(),
            ctx.deployment.id,
            self.store.clone(),
            self.pollers.clone(),
            poller::PollerConfig::from_config(&self.config),
            vec![Box::new(poller::UserInterruptedPolicy)],
        );
        let handle = poller.spawn();

        let (store, deploys, coordinator) = (self.store.clone(), self.deploys.clone(), Arc::clone(&self.coordinator));
        let (env_key, deployment_id) = (ctx.deployment.env_key.clone(), ctx.deployment.id);
        let (application, module, environment) = (
            ctx.env.application.code.clone(),
            ctx.env.module.name.clone(),
            ctx.env.environment.to_string(),
        );
        let release = ctx.release.clone();
        tokio::spawn(async move {
            let outcome = match handle.await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(err)) => {
                    tracing::error!(error = ?err, "error from release poller");
                    poller::PollOutcome::Failed {
                        reason: "PollerError".into(),
                        message: err.to_string(),
                    }
                }
                Err(err) => {
                    tracing::error!(error = ?err, "error joining release poller task");
                    poller::PollOutcome::Failed {
                        reason: "PollerError".into(),
                        message: err.to_string(),
                    }
                }
            };

            let (phase, status, reason, message) = match outcome {
                poller::PollOutcome::Ready => (ReleasePhase::Released, DeployStatus::Ready, None, None),
                poller::PollOutcome::Interrupted => (
                    ReleasePhase::Interrupted,
                    DeployStatus::Unknown,
                    Some("interrupted".to_string()),
                    None,
                ),
                poller::PollOutcome::TimedOut { elapsed_seconds } => (
                    ReleasePhase::ReleasedFailed,
                    DeployStatus::Error,
                    Some("Timeout".to_string()),
                    Some(format!("release did not become ready after {}s", elapsed_seconds)),
                ),
                poller::PollOutcome::Failed { reason, message } => {
                    (ReleasePhase::ReleasedFailed, DeployStatus::Error, Some(reason), Some(message))
                }
            };

            // Completion callback: record the model deploy state, mark the
            // release step, then send the post-deploy signal.
            if let Err(err) = deploys.record_transition(&application, &module, &environment, status, reason.clone(), message.clone()) {
                tracing::error!(error = ?err, "error recording model deploy transition");
            }
            if let Err(err) = store.set_phase(deployment_id, phase) {
                tracing::error!(error = ?err, "error finalizing deployment phase");
            }
            if phase == ReleasePhase::Released {
                metrics::increment_counter!(METRIC_RELEASES_COMPLETED);
            } else {
                metrics::increment_counter!(METRIC_RELEASES_FAILED);
                if let Err(err) = store.mark_release_failed(&release, message.as_deref().unwrap_or("release failed")) {
                    tracing::error!(error = ?err, "error marking release failed");
                }
            }
            if let Err(err) = coordinator.release_lock(&env_key, deployment_id) {
                tracing::error!(error = ?err, "error releasing deployment lock");
            }
            tracing::info!(deployment = %deployment_id, phase = ?phase, "release poll finished");
        });
        Ok(())
    }

    fn fail(&self, ctx: &ReleaseContext, phase: ReleasePhase, summary: &str) -> Result<()> {
        self.store.set_phase(ctx.deployment.id, phase)?;
        self.store.mark_release_failed(&ctx.release, summary)?;
        self.coordinator.release_lock(&ctx.deployment.env_key, ctx.deployment.id)?;
        metrics::increment_counter!(METRIC_RELEASES_FAILED);
        Ok(())
    }
}

#[cfg(test)]
mod legacy_test;
#[cfg(test)]
mod mod_test;
#[cfg(test)]
mod poller_test;
