use anyhow::Result;
use uuid::Uuid;

use super::{DeploymentCoordinator, ReleaseStore};
use crate::fixtures;
use wharf_core::models::ReleasePhase;
use wharf_core::PlatformError;

#[tokio::test]
async fn lock_guards_against_concurrent_releases() -> Result<()> {
    let (_config, db, _tmpdir) = fixtures::new_db().await?;
    let coordinator = DeploymentCoordinator::new(&db, 600)?;
    let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

    coordinator.acquire_lock("demo/default/stag", first)?;
    let err = coordinator
        .acquire_lock("demo/default/stag", second)
        .expect_err("expected second acquire to fail");
    assert!(
        matches!(err.downcast_ref::<PlatformError>(), Some(PlatformError::CannotDeployOngoingExists)),
        "unexpected error: {}",
        err
    );
    assert_eq!(coordinator.get_current_deployment("demo/default/stag")?, Some(first));

    // Other environments are unaffected.
    coordinator.acquire_lock("demo/default/prod", second)?;
    Ok(())
}

#[tokio::test]
async fn lock_release_frees_the_environment() -> Result<()> {
    let (_config, db, _tmpdir) = fixtures::new_db().await?;
    let coordinator = DeploymentCoordinator::new(&db, 600)?;
    let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

    coordinator.acquire_lock("demo/default/stag", first)?;
    coordinator.release_lock("demo/default/stag", first)?;
    assert_eq!(coordinator.get_current_deployment("demo/default/stag")?, None);
    coordinator.acquire_lock("demo/default/stag", second)?;
    Ok(())
}

#[tokio::test]
async fn lock_release_by_non_holder_is_a_noop() -> Result<()> {
    let (_config, db, _tmpdir) = fixtures::new_db().await?;
    let coordinator = DeploymentCoordinator::new(&db, 600)?;
    let (holder, other) = (Uuid::new_v4(), Uuid::new_v4());

    coordinator.acquire_lock("demo/default/stag", holder)?;
    coordinator.release_lock("demo/default/stag", other)?;
    assert_eq!(
        coordinator.get_current_deployment("demo/default/stag")?,
        Some(holder),
        "expected the lock to remain held"
    );
    Ok(())
}

#[tokio::test]
async fn stale_locks_expire_through_their_ttl() -> Result<()> {
    let (_config, db, _tmpdir) = fixtures::new_db().await?;
    let coordinator = DeploymentCoordinator::new(&db, 0)?;
    let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

    coordinator.acquire_lock("demo/default/stag", first)?;
    assert_eq!(coordinator.get_current_deployment("demo/default/stag")?, None, "expected lock to be stale");
    coordinator.acquire_lock("demo/default/stag", second)?;
    Ok(())
}

#[tokio::test]
async fn release_versions_are_monotonic_per_engine_app() -> Result<()> {
    let (_config, db, _tmpdir) = fixtures::new_db().await?;
    let store = ReleaseStore::new(&db)?;
    let (app_a, app_b) = (Uuid::new_v4(), Uuid::new_v4());

    let first = store.create_release(app_a, Uuid::new_v4())?;
    let second = store.create_release(app_a, Uuid::new_v4())?;
    let other = store.create_release(app_b, Uuid::new_v4())?;

    assert_eq!(first.version, 1);
    assert_eq!(second.version, 2);
    assert_eq!(other.version, 1, "expected versions to be scoped per engine app");
    assert_eq!(store.list_releases(app_a)?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn interrupt_request_is_observable_on_the_deployment() -> Result<()> {
    let (_config, db, _tmpdir) = fixtures::new_db().await?;
    let store = ReleaseStore::new(&db)?;
    let env = fixtures::module_environment("demo", wharf_core::models::Environment::Stag, wharf_core::models::AppType::CloudNative);
    let ctx = fixtures::release_context(env, vec![], vec![]);
    store.save_deployment(&ctx.deployment)?;

    assert!(store.get_deployment(ctx.deployment.id)?.release_int_requested_at.is_none());
    store.request_interrupt(ctx.deployment.id)?;
    assert!(
        store.get_deployment(ctx.deployment.id)?.release_int_requested_at.is_some(),
        "expected interruption timestamp to be recorded"
    );
    Ok(())
}

#[tokio::test]
async fn phase_transitions_are_persisted() -> Result<()> {
    let (_config, db, _tmpdir) = fixtures::new_db().await?;
    let store = ReleaseStore::new(&db)?;
    let env = fixtures::module_environment("demo", wharf_core::models::Environment::Stag, wharf_core::models::AppType::Default);
    let ctx = fixtures::release_context(env, vec![], vec![]);
    store.save_deployment(&ctx.deployment)?;

    store.set_phase(ctx.deployment.id, ReleasePhase::Preparing)?;
    store.set_phase(ctx.deployment.id, ReleasePhase::Releasing)?;
    let deployment = store.set_phase(ctx.deployment.id, ReleasePhase::Released)?;

    assert_eq!(deployment.phase, ReleasePhase::Released);
    assert!(deployment.phase.is_terminal());
    Ok(())
}

#[tokio::test]
async fn mark_release_failed_records_the_summary() -> Result<()> {
    let (_config, db, _tmpdir) = fixtures::new_db().await?;
    let store = ReleaseStore::new(&db)?;
    let app = Uuid::new_v4();
    let release = store.create_release(app, Uuid::new_v4())?;

    store.mark_release_failed(&release, "builder pod vanished")?;

    let stored = store.list_releases(app)?.pop().expect("expected release row");
    assert!(stored.failed);
    assert_eq!(stored.summary.as_deref(), Some("builder pod vanished"));
    Ok(())
}
