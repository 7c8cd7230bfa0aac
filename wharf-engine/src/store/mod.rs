//! Process-spec store & plan catalog.
//!
//! The single mutator of desired process state is [`ProcessSpecStore::sync`].
//! All writes of one sync land in a single batch so partial failure leaves no
//! orphans. Per engine app, callers serialize sync calls; the release
//! coordinator enforces this for release-driven syncs.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::config::Config;
use crate::database::{decode_model, encode_model, scan_prefix_models, Database, Tree};
use wharf_core::models::{AppType, Environment, ModuleEnvironment, ProcessSpec, ProcessTmpl, TargetStatus};
use wharf_core::plan::{Plan, ResourceSpec, PLAN_NAME_DEFAULT};
use wharf_core::procfile::PROC_TYPE_PATTERN;
use wharf_core::PlatformError;

/// The error message raised when a spec exceeds its plan cap.
const ERR_PLAN_CAP: &str = "target_replicas is more than plan max_replicas";

/// Resolves platform default replica counts for process types.
///
/// Injected rather than read from process-wide state so alternative
/// structures can be supplied by the embedding platform.
pub trait ProcessStructureResolver: Send + Sync {
    /// The default replica count for the given process type & environment.
    fn default_replicas(&self, process_type: &str, environment: Environment) -> u32;
}

/// The config-backed resolver used by the engine.
pub struct ConfigStructureResolver {
    config: Arc<Config>,
}

impl ConfigStructureResolver {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl ProcessStructureResolver for ConfigStructureResolver {
    fn default_replicas(&self, process_type: &str, environment: Environment) -> u32 {
        self.config.default_replicas_for(process_type, environment)
    }
}

//////////////////////////////////////////////////////////////////////////////
// Plan Catalog //////////////////////////////////////////////////////////////

/// The global catalog of resource plans.
#[derive(Clone)]
pub struct PlanStore {
    tree: Tree,
}

impl PlanStore {
    /// Create a new instance.
    pub fn new(db: &Database) -> Result<Self> {
        Ok(Self { tree: db.plans()? })
    }

    /// Record the given plan.
    pub fn create(&self, plan: &Plan) -> Result<()> {
        self.tree
            .insert(plan.id.to_string().as_bytes(), encode_model(plan)?)
            .context("error writing plan")?;
        Ok(())
    }

    /// All recorded plans.
    pub fn list(&self) -> Result<Vec<Plan>> {
        scan_prefix_models(&self.tree, "")
    }

    /// Look up an active plan by name.
    ///
    /// Duplicate names resolve to the row with the earliest `created`; the
    /// duplication itself is worth an admin warning, surfaced here.
    pub fn get_by_name(&self, name: &str) -> Result<Option<Plan>> {
        let mut matches: Vec<Plan> = self
            .list()?
            .into_iter()
            .filter(|plan| plan.is_active && plan.name == name)
            .collect();
        if matches.len() > 1 {
            tracing::warn!(plan = name, count = matches.len(), "duplicate plan names found, resolving to the oldest");
        }
        matches.sort_by_key(|plan| plan.created);
        Ok(matches.into_iter().next())
    }

    /// Materialize the platform default plans, idempotently.
    pub fn ensure_defaults(&self, config: &Config) -> Result<()> {
        for name in [PLAN_NAME_DEFAULT, config.default_proc_spec_plan.as_str()] {
            if self.get_by_name(name)?.is_some() {
                continue;
            }
            let plan = Plan::new(
                name,
                config.default_cnative_max_replicas,
                ResourceSpec { cpu: "250m".into(), memory: "512Mi".into() },
                ResourceSpec { cpu: "4".into(), memory: "1Gi".into() },
            )
            .map_err(anyhow::Error::from)?;
            self.create(&plan)?;
            tracing::info!(plan = name, "materialized default plan");
        }
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////
// Process-Spec Store ////////////////////////////////////////////////////////

/// The persistent desired-state store of process specs.
pub struct ProcessSpecStore {
    tree: Tree,
    plans: PlanStore,
    resolver: Arc<dyn ProcessStructureResolver>,
    /// The fallback plan name used when a sync sees no plan.
    default_plan_name: String,
}

impl ProcessSpecStore {
    /// Create a new instance.
    pub fn new(db: &Database, plans: PlanStore, resolver: Arc<dyn ProcessStructureResolver>, default_plan_name: impl Into<String>) -> Result<Self> {
        Ok(Self {
            tree: db.process_specs()?,
            plans,
            resolver,
            default_plan_name: default_plan_name.into(),
        })
    }

    fn key(engine_app: Uuid, name: &str) -> String {
        format!("{}/{}", engine_app, name)
    }

    /// All specs of the given engine app.
    pub fn list(&self, engine_app: Uuid) -> Result<Vec<ProcessSpec>> {
        scan_prefix_models(&self.tree, &format!("{}/", engine_app))
    }

    /// The named spec of the given engine app.
    pub fn get(&self, engine_app: Uuid, name: &str) -> Result<ProcessSpec> {
        let raw = self
            .tree
            .get(Self::key(engine_app, name).as_bytes())
            .context("error reading process spec")?
            .ok_or(PlatformError::ResourceMissing {
                kind: "ProcessSpec".into(),
                name: name.into(),
            })?;
        decode_model(&raw)
    }

    /// Synchronize the desired state of the given environment to the given
    /// process templates.
    ///
    /// Incoming names are lowercased; specs absent from the input are
    /// deleted; existing specs are updated in place with `target_status`
    /// always reset to `start` (sync implies an active deployment intent).
    /// The whole update is applied as one batch.
    #[tracing::instrument(level = "debug", skip(self, env, processes))]
    pub fn sync(&self, env: &ModuleEnvironment, processes: &[ProcessTmpl]) -> Result<()> {
        let engine_app = env.engine_app.uuid;

        // Normalize incoming templates; last entry wins on duplicate names.
        let mut incoming: BTreeMap<String, &ProcessTmpl> = BTreeMap::new();
        for tmpl in processes {
            let name = tmpl.name.to_lowercase();
            if !PROC_TYPE_PATTERN.is_match(&name) {
                return Err(PlatformError::InvalidInput(format!("invalid process name {}", name)).into());
            }
            incoming.insert(name, tmpl);
        }

        let existing: BTreeMap<String, ProcessSpec> = self
            .list(engine_app)?
            .into_iter()
            .map(|spec| (spec.name.clone(), spec))
            .collect();

        let default_plan = self.resolve_default_plan(env)?;
        let mut batch = sled::Batch::default();

        // Remove specs absent from the incoming set.
        for name in existing.keys().filter(|name| !incoming.contains_key(*name)) {
            batch.remove(Self::key(engine_app, name).as_bytes());
        }

        for (name, tmpl) in &incoming {
            let plan = match tmpl.plan.as_deref() {
                Some(plan_name) => self.plans.get_by_name(plan_name)?.unwrap_or_else(|| default_plan.clone()),
                None => default_plan.clone(),
            };
            let spec = match existing.get(name) {
                Some(current) => {
                    let mut updated = current.clone();
                    if let Some(replicas) = tmpl.replicas {
                        updated.target_replicas = replicas;
                    }
                    updated.proc_command = tmpl.command.clone().or(updated.proc_command);
                    if !tmpl.command_parts.is_empty() {
                        updated.command = tmpl.command_parts.clone();
                    }
                    if !tmpl.args.is_empty() {
                        updated.args = tmpl.args.clone();
                    }
                    updated.port = tmpl.port.or(updated.port);
                    updated.plan = plan.name.clone();
                    updated.autoscaling = tmpl.autoscaling;
                    updated.scaling_config = tmpl.scaling_config.clone();
                    updated.target_status = TargetStatus::Start;
                    updated
                }
                None => ProcessSpec {
                    id: Uuid::new_v4(),
                    engine_app,
                    name: name.clone(),
                    proc_command: tmpl.command.clone(),
                    command: tmpl.command_parts.clone(),
                    args: tmpl.args.clone(),
                    port: tmpl.port,
                    target_replicas: tmpl
                        .replicas
                        .unwrap_or_else(|| self.resolver.default_replicas(name, env.environment)),
                    target_status: TargetStatus::Start,
                    plan: plan.name.clone(),
                    autoscaling: tmpl.autoscaling,
                    scaling_config: tmpl.scaling_config.clone(),
                    tenant_id: env.engine_app.tenant_id.clone(),
                },
            };
            check_plan_cap(&plan, &spec)?;
            batch.insert(Self::key(engine_app, name).as_bytes(), encode_model(&spec)?);
        }

        self.tree.apply_batch(batch).context("error applying process spec sync batch")?;
        Ok(())
    }

    /// Set the target status of the named spec.
    pub fn set_target_status(&self, engine_app: Uuid, name: &str, status: TargetStatus) -> Result<ProcessSpec> {
        let mut spec = self.get(engine_app, name)?;
        spec.target_status = status;
        self.tree
            .insert(Self::key(engine_app, name).as_bytes(), encode_model(&spec)?)
            .context("error writing process spec")?;
        Ok(spec)
    }

    /// Set the target replicas of the named spec, enforcing the plan cap.
    pub fn set_target_replicas(&self, engine_app: Uuid, name: &str, replicas: u32) -> Result<ProcessSpec> {
        let mut spec = self.get(engine_app, name)?;
        let plan = self
            .plans
            .get_by_name(&spec.plan)?
            .ok_or_else(|| PlatformError::ResourceMissing {
                kind: "Plan".into(),
                name: spec.plan.clone(),
            })?;
        spec.target_replicas = replicas;
        check_plan_cap(&plan, &spec)?;
        self.tree
            .insert(Self::key(engine_app, name).as_bytes(), encode_model(&spec)?)
            .context("error writing process spec")?;
        Ok(spec)
    }

    /// Resolve the default plan of the given environment.
    ///
    /// Cloud-native apps prefer the `default` plan when present; legacy apps
    /// use the configured platform default directly.
    fn resolve_default_plan(&self, env: &ModuleEnvironment) -> Result<Plan> {
        if env.application.app_type == AppType::CloudNative {
            if let Some(plan) = self.plans.get_by_name(PLAN_NAME_DEFAULT)? {
                return Ok(plan);
            }
        }
        self.plans.get_by_name(&self.default_plan_name)?.ok_or_else(|| {
            PlatformError::ResourceMissing {
                kind: "Plan".into(),
                name: self.default_plan_name.clone(),
            }
            .into()
        })
    }
}

//////////////////////////////////////////////////////////////////////////////
// Runtime Config Store //////////////////////////////////////////////////////

/// Versioned runtime-config snapshots of engine apps.
///
/// Snapshots are appended, never updated in place; "current" means most
/// recent.
#[derive(Clone)]
pub struct RuntimeConfigStore {
    tree: Tree,
}

impl RuntimeConfigStore {
    /// Create a new instance.
    pub fn new(db: &Database) -> Result<Self> {
        Ok(Self { tree: db.configs()? })
    }

    /// Append a new snapshot for the engine app, assigning the next version.
    pub fn append(&self, engine_app: Uuid, mut config: wharf_core::models::RuntimeConfig) -> Result<wharf_core::models::RuntimeConfig> {
        let last_version = self.current(engine_app)?.map(|current| current.version).unwrap_or(0);
        config.version = last_version + 1;
        self.tree
            .insert(format!("{}/{:010}", engine_app, config.version).as_bytes(), encode_model(&config)?)
            .context("error writing runtime config snapshot")?;
        Ok(config)
    }

    /// The most recent snapshot of the engine app, if any.
    pub fn current(&self, engine_app: Uuid) -> Result<Option<wharf_core::models::RuntimeConfig>> {
        let snapshots: Vec<wharf_core::models::RuntimeConfig> = scan_prefix_models(&self.tree, &format!("{}/", engine_app))?;
        Ok(snapshots.into_iter().last())
    }
}

/// Enforce `target_replicas <= plan.max_replicas`, along with the same cap on
/// any scaling config bounds.
fn check_plan_cap(plan: &Plan, spec: &ProcessSpec) -> Result<()> {
    if spec.target_replicas > plan.max_replicas {
        return Err(PlatformError::InvalidInput(ERR_PLAN_CAP.into()).into());
    }
    if let Some(scaling) = &spec.scaling_config {
        if scaling.max_replicas > plan.max_replicas {
            return Err(PlatformError::InvalidInput(ERR_PLAN_CAP.into()).into());
        }
    }
    Ok(())
}
