use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;

use super::{digest_of_nodes, generate_state_from_nodes, node_matches_ignore_labels, ClusterRegistry, ClusterStateStore, EnvClusterService};
use crate::fixtures;
use wharf_core::models::{AppType, Environment};

#[tokio::test]
async fn generate_state_is_idempotent_by_content() -> Result<()> {
    let (_config, db, _tmpdir) = fixtures::new_db().await?;
    let store = ClusterStateStore::new(&db)?;
    let nodes = vec![
        fixtures::node("n-a", &[], Some("10.0.0.1")),
        fixtures::node("n-b", &[], Some("10.0.0.2")),
        fixtures::node("n-c", &[], None),
    ];

    let first = generate_state_from_nodes(&store, "c1", &nodes, &BTreeMap::new())?;
    let second = generate_state_from_nodes(&store, "c1", &nodes, &BTreeMap::new())?;

    let expected_digest = digest_of_nodes(&["n-a".into(), "n-b".into(), "n-c".into()]);
    assert_eq!(first.nodes_digest, expected_digest);
    assert_eq!(first.name, format!("eng-cstate-{}-1", &expected_digest[..8]));
    assert_eq!(second.name, first.name, "expected re-snapshot to return the existing row");
    assert_eq!(store.count("c1"), 1, "expected no second row to be created");
    Ok(())
}

#[tokio::test]
async fn generate_state_orders_ordinals_per_cluster() -> Result<()> {
    let (_config, db, _tmpdir) = fixtures::new_db().await?;
    let store = ClusterStateStore::new(&db)?;

    let first = generate_state_from_nodes(&store, "c1", &[fixtures::node("n-a", &[], None)], &BTreeMap::new())?;
    let second = generate_state_from_nodes(
        &store,
        "c1",
        &[fixtures::node("n-a", &[], None), fixtures::node("n-b", &[], None)],
        &BTreeMap::new(),
    )?;

    assert!(first.name.ends_with("-1"), "expected first state ordinal 1, got {}", first.name);
    assert!(second.name.ends_with("-2"), "expected second state ordinal 2, got {}", second.name);
    Ok(())
}

#[tokio::test]
async fn generate_state_drops_ignored_nodes() -> Result<()> {
    let (_config, db, _tmpdir) = fixtures::new_db().await?;
    let store = ClusterStateStore::new(&db)?;
    let nodes = vec![
        fixtures::node("n-a", &[], None),
        fixtures::node("n-master", &[("node-role", "master")], None),
    ];
    let mut ignore = BTreeMap::new();
    ignore.insert("node-role".to_string(), "master".to_string());

    let state = generate_state_from_nodes(&store, "c1", &nodes, &ignore)?;

    assert_eq!(state.nodes_name, vec!["n-a".to_string()]);
    assert_eq!(state.nodes_cnt, 1);
    assert_eq!(state.nodes_digest, digest_of_nodes(&["n-a".into()]));
    Ok(())
}

#[test]
fn digest_is_order_independent() {
    let a = digest_of_nodes(&["n-b".into(), "n-a".into()]);
    let b = digest_of_nodes(&["n-a".into(), "n-b".into()]);
    assert_eq!(a, b, "expected digest to be independent of input order");
}

#[test]
fn ignore_labels_require_exact_value_match() {
    let node = fixtures::node("n-a", &[("node-role", "worker")], None);
    let mut ignore = BTreeMap::new();
    ignore.insert("node-role".to_string(), "master".to_string());
    assert!(!node_matches_ignore_labels(&node, &ignore));
    ignore.insert("node-role".to_string(), "worker".to_string());
    assert!(node_matches_ignore_labels(&node, &ignore));
}

#[tokio::test]
async fn binding_pins_app_to_state() -> Result<()> {
    let (_config, db, _tmpdir) = fixtures::new_db().await?;
    let store = ClusterStateStore::new(&db)?;
    let app = fixtures::wl_app("demo");
    let state = generate_state_from_nodes(&store, "c1", &[fixtures::node("n-a", &[], None)], &BTreeMap::new())?;

    let binding = store.bind_app(&app, &state)?;
    assert_eq!(binding.state_name, state.name);

    let fetched = store.get_binding(&app)?.expect("expected binding to be recorded");
    assert_eq!(fetched.state_name, state.name);
    assert_eq!(fetched.cluster_name, "c1");
    Ok(())
}

#[tokio::test]
async fn egress_specs_are_recorded_per_engine_app() -> Result<()> {
    let (_config, db, _tmpdir) = fixtures::new_db().await?;
    let store = ClusterStateStore::new(&db)?;
    let app = fixtures::wl_app("demo");

    assert!(store.get_egress_spec(&app)?.is_none());
    store.save_egress_spec(&wharf_core::models::EgressSpec {
        engine_app: app.uuid,
        rules: vec![wharf_core::models::EgressRule {
            host: "db.internal".into(),
            dst_port: 5432,
            protocol: "TCP".into(),
            src_port: 5432,
            service_name: "demo-egress".into(),
        }],
    })?;

    let spec = store.get_egress_spec(&app)?.expect("expected egress spec to be recorded");
    assert_eq!(spec.rules.len(), 1);
    assert_eq!(spec.rules[0].host, "db.internal");
    Ok(())
}

#[tokio::test]
async fn env_cluster_resolution_prefers_explicit_binding() -> Result<()> {
    let (_config, db, _tmpdir) = fixtures::new_db().await?;
    let registry = Arc::new(ClusterRegistry::new(vec![
        fixtures::cluster("primary", "default", true),
        fixtures::cluster("secondary", "default", false),
    ]));
    let service = EnvClusterService::new(registry, &db)?;
    let env = fixtures::module_environment("demo", Environment::Stag, AppType::Default);

    let resolved = service.get_cluster(&env)?;
    assert_eq!(resolved.name, "primary", "expected tenant default to be resolved");

    service.bind_cluster(&env, "secondary")?;
    let resolved = service.get_cluster(&env)?;
    assert_eq!(resolved.name, "secondary", "expected explicit binding to win");
    Ok(())
}

#[tokio::test]
async fn env_cluster_binding_rejects_unknown_clusters() -> Result<()> {
    let (_config, db, _tmpdir) = fixtures::new_db().await?;
    let registry = Arc::new(ClusterRegistry::new(vec![fixtures::cluster("primary", "default", true)]));
    let service = EnvClusterService::new(registry, &db)?;
    let env = fixtures::module_environment("demo", Environment::Stag, AppType::Default);

    assert!(service.bind_cluster(&env, "ghost").is_err(), "expected unknown cluster to be rejected");
    Ok(())
}
