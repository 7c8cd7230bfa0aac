use std::sync::Arc;

use anyhow::Result;

use super::{DeployRequest, EnvProtectionPolicy, Orchestrator, Platform};
use crate::fixtures;
use wharf_core::models::{AppType, Environment, ProcessTmpl};
use wharf_core::PlatformError;

async fn new_orchestrator() -> Result<(Orchestrator, tempfile::TempDir)> {
    let (config, db, tmpdir) = fixtures::new_db().await?;
    let platform = Platform::new(config, db)?;
    Ok((Orchestrator::new(Arc::new(platform)), tmpdir))
}

fn tmpl(name: &str, replicas: u32) -> ProcessTmpl {
    ProcessTmpl {
        name: name.into(),
        command: Some(format!("run {}", name)),
        replicas: Some(replicas),
        ..Default::default()
    }
}

#[tokio::test]
async fn sync_process_specs_persists_the_desired_state() -> Result<()> {
    let (orchestrator, _tmpdir) = new_orchestrator().await?;
    let env = fixtures::module_environment("demo", Environment::Stag, AppType::Default);

    orchestrator.sync_process_specs(&env, &[tmpl("web", 2)])?;

    let specs = orchestrator.platform.specs.list(env.engine_app.uuid)?;
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].name, "web");
    assert_eq!(specs[0].target_replicas, 2);
    Ok(())
}

#[tokio::test]
async fn sync_process_specs_rejects_tenant_mismatch() -> Result<()> {
    let (orchestrator, _tmpdir) = new_orchestrator().await?;
    let mut env = fixtures::module_environment("demo", Environment::Stag, AppType::Default);
    env.engine_app.tenant_id = "other-tenant".into();

    let err = orchestrator
        .sync_process_specs(&env, &[tmpl("web", 1)])
        .expect_err("expected tenant mismatch to be rejected");
    assert!(err.to_string().contains("tenant mismatch"), "unexpected error: {}", err);
    Ok(())
}

#[tokio::test]
async fn deploy_of_unknown_revision_fails_fast() -> Result<()> {
    let (orchestrator, _tmpdir) = new_orchestrator().await?;
    let env = fixtures::module_environment("demo", Environment::Stag, AppType::Default);

    let err = orchestrator
        .deploy(
            &env,
            DeployRequest {
                version_type: "branch".into(),
                version_name: "main".into(),
                revision: "deadbeef".into(),
                extra_envs: Default::default(),
                description: None,
            },
        )
        .await
        .expect_err("expected deploy of unknown revision to fail");
    assert!(
        matches!(err.downcast_ref::<PlatformError>(), Some(PlatformError::CannotGetRevision(_))),
        "unexpected error: {}",
        err
    );
    Ok(())
}

struct DenyAllPolicy;

impl EnvProtectionPolicy for DenyAllPolicy {
    fn check_deploy(&self, env: &wharf_core::models::ModuleEnvironment) -> Result<()> {
        Err(PlatformError::RestrictRoleDeployEnabled {
            environment: env.environment.to_string(),
        }
        .into())
    }
}

#[tokio::test]
async fn deploy_honors_env_protection() -> Result<()> {
    let (config, db, _tmpdir) = fixtures::new_db().await?;
    let mut platform = Platform::new(config, db)?;
    platform.env_protection = Box::new(DenyAllPolicy);
    let orchestrator = Orchestrator::new(Arc::new(platform));
    let env = fixtures::module_environment("demo", Environment::Prod, AppType::Default);

    let err = orchestrator
        .deploy(
            &env,
            DeployRequest {
                version_type: "branch".into(),
                version_name: "main".into(),
                revision: String::new(),
                extra_envs: Default::default(),
                description: None,
            },
        )
        .await
        .expect_err("expected protected environment to refuse deploys");
    assert!(
        matches!(err.downcast_ref::<PlatformError>(), Some(PlatformError::RestrictRoleDeployEnabled { .. })),
        "unexpected error: {}",
        err
    );
    Ok(())
}

#[tokio::test]
async fn runtime_config_snapshots_are_versioned() -> Result<()> {
    let (orchestrator, _tmpdir) = new_orchestrator().await?;
    let env = fixtures::module_environment("demo", Environment::Stag, AppType::Default);

    assert!(orchestrator.current_runtime_config(&env)?.is_none());
    let first = orchestrator.save_runtime_config(&env, Default::default())?;
    let second = orchestrator.save_runtime_config(&env, Default::default())?;

    assert_eq!(first.version, 1);
    assert_eq!(second.version, 2);
    assert_eq!(orchestrator.current_runtime_config(&env)?.map(|config| config.version), Some(2));
    Ok(())
}

#[tokio::test]
async fn webconsole_sessions_are_opaque_tokens() -> Result<()> {
    let (orchestrator, _tmpdir) = new_orchestrator().await?;
    let env = fixtures::module_environment("demo", Environment::Stag, AppType::Default);

    let session = orchestrator.create_webconsole(&env, "operator", "web", "web-abc123", "main", None)?;
    assert_eq!(session.split('.').count(), 3, "expected a signed JWT session token");
    Ok(())
}
