//! Release status polling.
//!
//! A supervised background task which polls an applied BkApp until it is
//! Ready or in error, evaluating abort policies before every status query.
//! Poller state (`started_at`, `queried_count`, `last_polling_data`) is
//! persisted each tick so a restarted poller resumes where it left off.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kube::client::Client;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::database::{decode_model, encode_model, Tree};
use crate::k8s::ResourceClient;
use crate::release::cnative::map_status;
use crate::release::ReleaseStore;
use wharf_core::crd::BkApp;
use wharf_core::models::{DeployStatus, Deployment};
use wharf_core::PlatformError;

/// The default period between status queries.
const DEFAULT_QUERY_PERIOD: Duration = Duration::from_secs(5);

/// Settings of one poller run.
#[derive(Clone, Debug)]
pub struct PollerConfig {
    pub query_period: Duration,
    /// Overall wall-clock cap of the poll, measured from `started_at`.
    pub overall_timeout: Duration,
    /// Consecutive `Error` states tolerated before declaring failure.
    pub failure_limit: u32,
}

impl PollerConfig {
    /// Build the poller settings from the runtime config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            query_period: DEFAULT_QUERY_PERIOD,
            overall_timeout: Duration::from_secs(config.release_timeout_seconds),
            failure_limit: config.cnative_deploy_status_polling_failure_limits,
        }
    }
}

/// Restartable poller state, persisted every tick.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollerMetadata {
    pub started_at: DateTime<Utc>,
    pub queried_count: u64,
    /// Opaque state carried across ticks, including the consecutive failure
    /// counter under `polling_failure_count`.
    pub last_polling_data: serde_json::Value,
}

impl PollerMetadata {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            queried_count: 0,
            last_polling_data: serde_json::json!({}),
        }
    }

    fn failure_count(&self) -> u32 {
        self.last_polling_data
            .get("polling_failure_count")
            .and_then(|val| val.as_u64())
            .unwrap_or(0) as u32
    }

    fn set_failure_count(&mut self, count: u32) {
        if !self.last_polling_data.is_object() {
            self.last_polling_data = serde_json::json!({});
        }
        self.last_polling_data["polling_failure_count"] = serde_json::json!(count);
    }
}

/// What one observed status means for the poll.
#[derive(Debug, PartialEq, Eq)]
pub enum PollAction {
    Continue,
    Succeed,
    Fail { reason: String, message: String },
}

/// Evaluate one observed status against the consecutive-failure budget.
///
/// Returns the action plus the updated failure counter: transient `Error`
/// states merely increment it, any other state resets it.
pub fn evaluate_status(status: DeployStatus, failure_count: u32, failure_limit: u32) -> (PollAction, u32) {
    match status {
        DeployStatus::Ready => (PollAction::Succeed, 0),
        DeployStatus::Error => {
            let count = failure_count + 1;
            if count > failure_limit {
                (
                    PollAction::Fail {
                        reason: "AppModelError".into(),
                        message: format!("model reported Error for {} consecutive polls", count),
                    },
                    count,
                )
            } else {
                (PollAction::Continue, count)
            }
        }
        DeployStatus::Pending | DeployStatus::Progressing | DeployStatus::Unknown => (PollAction::Continue, 0),
    }
}

/// How a poll run ended.
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Ready,
    Interrupted,
    TimedOut { elapsed_seconds: u64 },
    Failed { reason: String, message: String },
}

/// A policy consulted before every status query.
pub trait AbortPolicy: Send + Sync {
    fn name(&self) -> &'static str;
    fn should_abort(&self, deployment: &Deployment) -> bool;
}

/// Aborts the poll once the caller has requested interruption.
pub struct UserInterruptedPolicy;

impl AbortPolicy for UserInterruptedPolicy {
    fn name(&self) -> &'static str {
        "user_interrupted"
    }

    fn should_abort(&self, deployment: &Deployment) -> bool {
        deployment.release_int_requested_at.is_some()
    }
}

/// The poller watching one applied BkApp.
pub struct WaitAppModelReady {
    client: Client,
    namespace: String,
    name: String,
    deployment_id: Uuid,
    store: ReleaseStore,
    pollers: Tree,
    config: PollerConfig,
    policies: Vec<Box<dyn AbortPolicy>>,
}

impl WaitAppModelReady {
    /// Create a new instance.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client, namespace: String, name: String, deployment_id: Uuid, store: ReleaseStore, pollers: Tree, config: PollerConfig,
        policies: Vec<Box<dyn AbortPolicy>>,
    ) -> Self {
        Self {
            client,
            namespace,
            name,
            deployment_id,
            store,
            pollers,
            config,
            policies,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<PollOutcome>> {
        tokio::spawn(self.run())
    }

    async fn run(self) -> Result<PollOutcome> {
        let api: ResourceClient<BkApp> = ResourceClient::namespaced(self.client.clone(), &self.namespace);
        let mut metadata = self.load_metadata()?;
        tracing::info!(deployment = %self.deployment_id, app = self.name.as_str(), "release poller started");

        loop {
            // Abort policies are evaluated before each status query.
            let deployment = self.store.get_deployment(self.deployment_id)?;
            if let Some(policy) = self.policies.iter().find(|policy| policy.should_abort(&deployment)) {
                tracing::info!(policy = policy.name(), "release poll aborted by policy");
                self.persist_metadata(&metadata)?;
                return Ok(PollOutcome::Interrupted);
            }

            let elapsed = (Utc::now() - metadata.started_at).to_std().unwrap_or_default();
            if elapsed >= self.config.overall_timeout {
                self.persist_metadata(&metadata)?;
                return Ok(PollOutcome::TimedOut {
                    elapsed_seconds: elapsed.as_secs(),
                });
            }

            let status = match api.get(&self.name).await {
                Ok(bkapp) => map_status(bkapp.status.as_ref()),
                // The CRD may not be visible yet right after the apply.
                Err(err) if err.downcast_ref::<PlatformError>().map(PlatformError::is_not_found).unwrap_or(false) => DeployStatus::Pending,
                Err(err) => return Err(err),
            };
            metadata.queried_count += 1;

            let (action, failure_count) = evaluate_status(status, metadata.failure_count(), self.config.failure_limit);
            metadata.set_failure_count(failure_count);
            self.persist_metadata(&metadata)?;

            match action {
                PollAction::Succeed => return Ok(PollOutcome::Ready),
                PollAction::Fail { reason, message } => return Ok(PollOutcome::Failed { reason, message }),
                PollAction::Continue => tokio::time::sleep(self.config.query_period).await,
            }
        }
    }

    fn load_metadata(&self) -> Result<PollerMetadata> {
        let raw = self
            .pollers
            .get(self.deployment_id.to_string().as_bytes())
            .context("error reading poller metadata")?;
        match raw {
            Some(raw) => decode_model(&raw),
            None => Ok(PollerMetadata::new()),
        }
    }

    fn persist_metadata(&self, metadata: &PollerMetadata) -> Result<()> {
        self.pollers
            .insert(self.deployment_id.to_string().as_bytes(), encode_model(metadata)?)
            .context("error writing poller metadata")?;
        Ok(())
    }
}
