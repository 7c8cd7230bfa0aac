//! Cloud-native release path: the BkApp CRD plus model-deploy bookkeeping.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use kube::Resource;
use uuid::Uuid;

use crate::database::{encode_model, scan_prefix_models, Database, Tree};
use crate::k8s::{ensure_namespace, ResourceClient};
use crate::release::{ReleaseContext, ReleaseOutcome, ReleaseStrategy};
use crate::utils;
use wharf_core::crd::{
    AutoscalingOverlay, BkApp, BkAppBuild, BkAppConfiguration, BkAppProcess, BkAppSpec, BkAppStatus, EnvVarEntry, SvcDiscovery, SvcDiscoveryEntry,
};
use wharf_core::models::{computed_replicas, AppModelDeploy, DeployStatus};
use wharf_core::PlatformError;

/// Persistence for cloud-native model deploy rows.
#[derive(Clone)]
pub struct AppModelDeployStore {
    tree: Tree,
}

impl AppModelDeployStore {
    /// Create a new instance.
    pub fn new(db: &Database) -> Result<Self> {
        Ok(Self {
            tree: db.app_model_deploys()?,
        })
    }

    fn key(application: &str, module: &str, environment: &str, id: Uuid) -> String {
        format!("{}/{}/{}/{}", application, module, environment, id)
    }

    /// Record a fresh pending row for one CRD apply attempt.
    pub fn create(&self, application: &str, module: &str, environment: &str) -> Result<AppModelDeploy> {
        let row = AppModelDeploy {
            id: Uuid::new_v4(),
            application: application.to_string(),
            module: module.to_string(),
            environment: environment.to_string(),
            status: DeployStatus::Pending,
            reason: None,
            message: None,
            last_transition_time: Utc::now(),
        };
        self.tree
            .insert(Self::key(application, module, environment, row.id).as_bytes(), encode_model(&row)?)
            .context("error writing model deploy row")?;
        Ok(row)
    }

    /// All rows of the given environment, oldest first.
    pub fn list(&self, application: &str, module: &str, environment: &str) -> Result<Vec<AppModelDeploy>> {
        let mut rows: Vec<AppModelDeploy> = scan_prefix_models(&self.tree, &format!("{}/{}/{}/", application, module, environment))?;
        rows.sort_by_key(|row| row.last_transition_time);
        Ok(rows)
    }

    /// Transition the latest row of the given environment.
    pub fn record_transition(
        &self, application: &str, module: &str, environment: &str, status: DeployStatus, reason: Option<String>, message: Option<String>,
    ) -> Result<()> {
        let mut rows = self.list(application, module, environment)?;
        let mut row = rows.pop().ok_or(PlatformError::ResourceMissing {
            kind: "AppModelDeploy".into(),
            name: format!("{}/{}/{}", application, module, environment),
        })?;
        row.status = status;
        row.reason = reason;
        row.message = message;
        row.last_transition_time = Utc::now();
        self.tree
            .insert(Self::key(application, module, environment, row.id).as_bytes(), encode_model(&row)?)
            .context("error writing model deploy row")?;
        Ok(())
    }
}

/// Map BkApp status conditions onto the deploy status set.
///
/// The `AppAvailable` condition wins; a `Progressing` condition maps to
/// progressing; an explicit false availability with a reason is an error; no
/// status at all is pending.
pub fn map_status(status: Option<&BkAppStatus>) -> DeployStatus {
    let status = match status {
        Some(status) => status,
        None => return DeployStatus::Pending,
    };
    if let Some(available) = status.conditions.iter().find(|cond| cond.type_ == "AppAvailable") {
        return match available.status.as_str() {
            "True" => DeployStatus::Ready,
            "False" => DeployStatus::Error,
            _ => DeployStatus::Unknown,
        };
    }
    if status.conditions.iter().any(|cond| cond.type_ == "AppProgressing" && cond.status == "True") {
        return DeployStatus::Progressing;
    }
    match status.phase.as_deref() {
        Some("Running") | Some("Ready") => DeployStatus::Ready,
        Some("Progressing") => DeployStatus::Progressing,
        Some("Failed") | Some("Error") => DeployStatus::Error,
        Some("Pending") | None => DeployStatus::Pending,
        Some(_other) => DeployStatus::Unknown,
    }
}

/// Render the release context into a BkApp resource.
pub fn build_bkapp(ctx: &ReleaseContext) -> Result<BkApp> {
    let env = &ctx.env;
    let image = ctx
        .build
        .image
        .clone()
        .or_else(|| ctx.runtime.image.clone())
        .ok_or_else(|| PlatformError::CannotDeployApp("release carries no runnable image".to_string()))?;

    let processes = ctx
        .specs
        .iter()
        .map(|spec| BkAppProcess {
            name: spec.name.clone(),
            replicas: computed_replicas(spec),
            res_quota_plan: Some(spec.plan.clone()),
            target_port: spec.port,
            command: spec.command.clone(),
            args: spec.args.clone(),
            autoscaling: spec.scaling_config.as_ref().map(|scaling| AutoscalingOverlay {
                min_replicas: scaling.min_replicas,
                max_replicas: scaling.max_replicas,
                policy: scaling.metrics.first().cloned(),
            }),
            probes: None,
        })
        .collect();

    // Environment variables: description-level values, then build outputs.
    let mut env_vars: Vec<EnvVarEntry> = vec![];
    if let Some(description) = &ctx.description {
        for (name, value) in &description.env_variables {
            env_vars.push(EnvVarEntry {
                name: name.clone(),
                value: value.clone(),
            });
        }
    }
    for (name, value) in &ctx.build.env_variables {
        env_vars.push(EnvVarEntry {
            name: name.clone(),
            value: value.clone(),
        });
    }

    let svc_discovery = ctx.description.as_ref().and_then(|description| {
        if description.svc_discovery.is_empty() {
            None
        } else {
            Some(SvcDiscovery {
                bk_saas: description
                    .svc_discovery
                    .iter()
                    .map(|code| SvcDiscoveryEntry {
                        bk_app_code: code.clone(),
                        module_name: None,
                    })
                    .collect(),
            })
        }
    });

    let spec = BkAppSpec {
        build: Some(BkAppBuild {
            image,
            image_pull_policy: ctx.runtime.runtime.image_pull_policy.clone(),
            image_credentials_name: ctx.runtime.runtime.image_pull_secrets.first().cloned(),
        }),
        processes,
        configuration: BkAppConfiguration { env: env_vars },
        addons: vec![],
        mounts: vec![],
        hooks: None,
        env_overlay: ctx.description.as_ref().and_then(|description| description.env_overlay.clone()),
        svc_discovery,
        domain_resolution: None,
    };

    let mut bkapp = BkApp::new(&env.engine_app.scheduler_safe_name(), spec);
    bkapp.meta_mut().namespace = Some(env.engine_app.namespace.clone());
    let labels = bkapp.meta_mut().labels.get_or_insert_with(Default::default);
    utils::set_canonical_labels(labels, &env.engine_app);
    Ok(bkapp)
}

/// The cloud-native release strategy.
pub struct CloudNativeReleaseStrategy {
    deploys: AppModelDeployStore,
}

impl CloudNativeReleaseStrategy {
    pub fn new(deploys: AppModelDeployStore) -> Self {
        Self { deploys }
    }
}

#[async_trait]
impl ReleaseStrategy for CloudNativeReleaseStrategy {
    async fn execute(&self, ctx: &ReleaseContext) -> Result<ReleaseOutcome> {
        let env = &ctx.env;
        ensure_namespace(ctx.client.clone(), &env.engine_app.namespace).await?;

        self.deploys
            .create(&env.application.code, &env.module.name, env.environment.as_str())?;

        let bkapp = build_bkapp(ctx)?;
        let api: ResourceClient<BkApp> = ResourceClient::namespaced(ctx.client.clone(), &env.engine_app.namespace);
        api.create_or_update(&env.engine_app.scheduler_safe_name(), &bkapp)
            .await
            .context("error applying BkApp resource")?;
        tracing::info!(app = env.application.code.as_str(), "BkApp applied, polling for readiness");
        Ok(ReleaseOutcome::Polling)
    }
}

#[cfg(test)]
mod cnative_test {
    use super::*;
    use wharf_core::crd::BkAppCondition;

    fn condition(type_: &str, status: &str) -> BkAppCondition {
        BkAppCondition {
            type_: type_.into(),
            status: status.into(),
            reason: None,
            message: None,
            last_transition_time: None,
        }
    }

    #[test]
    fn status_mapping_prefers_availability_condition() {
        let status = BkAppStatus {
            phase: Some("Progressing".into()),
            conditions: vec![condition("AppAvailable", "True")],
            observed_generation: None,
        };
        assert_eq!(map_status(Some(&status)), DeployStatus::Ready);
    }

    #[test]
    fn status_mapping_flags_unavailable_as_error() {
        let status = BkAppStatus {
            phase: None,
            conditions: vec![condition("AppAvailable", "False")],
            observed_generation: None,
        };
        assert_eq!(map_status(Some(&status)), DeployStatus::Error);
    }

    #[test]
    fn status_mapping_reads_progressing_condition() {
        let status = BkAppStatus {
            phase: None,
            conditions: vec![condition("AppProgressing", "True")],
            observed_generation: None,
        };
        assert_eq!(map_status(Some(&status)), DeployStatus::Progressing);
    }

    #[test]
    fn status_mapping_defaults_to_pending() {
        assert_eq!(map_status(None), DeployStatus::Pending);
        let empty = BkAppStatus::default();
        assert_eq!(map_status(Some(&empty)), DeployStatus::Pending);
    }

    #[test]
    fn status_mapping_falls_back_to_phase() {
        let status = BkAppStatus {
            phase: Some("Running".into()),
            conditions: vec![],
            observed_generation: None,
        };
        assert_eq!(map_status(Some(&status)), DeployStatus::Ready);
        let status = BkAppStatus {
            phase: Some("Recovering".into()),
            conditions: vec![],
            observed_generation: None,
        };
        assert_eq!(map_status(Some(&status)), DeployStatus::Unknown);
    }
}
