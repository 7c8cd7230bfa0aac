//! Shared test fixtures.

use std::sync::Arc;

use anyhow::Result;
use k8s_openapi::api::core::v1::{Node, NodeAddress, NodeStatus};
use kube::Resource;
use uuid::Uuid;

use crate::config::Config;
use crate::database::Database;
use wharf_core::models::{Application, AppType, Cluster, Environment, IngressConfig, Module, ModuleEnvironment, WlApp};
use wharf_core::plan::{Plan, ResourceSpec};

/// Open a fresh database backed by a temp dir.
pub async fn new_db() -> Result<(Arc<Config>, Database, tempfile::TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    Ok((config, db, tmpdir))
}

/// Build an engine app handle with the given name.
pub fn wl_app(name: &str) -> WlApp {
    WlApp {
        uuid: Uuid::new_v4(),
        name: name.into(),
        namespace: format!("bkapp-{}-stag", name.replace('_', "-")),
        cluster: None,
        app_type: AppType::Default,
        region: "default".into(),
        tenant_id: "default".into(),
    }
}

/// Build a full module environment around the given engine app name.
pub fn module_environment(name: &str, environment: Environment, app_type: AppType) -> ModuleEnvironment {
    let mut engine_app = wl_app(name);
    engine_app.app_type = app_type;
    ModuleEnvironment {
        application: Application {
            code: name.replace('_', "-"),
            name: name.into(),
            app_type,
            tenant_id: "default".into(),
            creator: "tester".into(),
            region: "default".into(),
        },
        module: Module {
            name: "default".into(),
            source_origin: "authorized_vcs".into(),
            language: "python".into(),
        },
        environment,
        engine_app,
    }
}

/// Build a plan with the given name & replica cap.
pub fn plan(name: &str, max_replicas: u32) -> Plan {
    Plan::new(
        name,
        max_replicas,
        ResourceSpec { cpu: "250m".into(), memory: "512Mi".into() },
        ResourceSpec { cpu: "1".into(), memory: "1Gi".into() },
    )
    .expect("fixture plan must validate")
}

/// Build a node with the given name, labels & internal IP.
pub fn node(name: &str, labels: &[(&str, &str)], internal_ip: Option<&str>) -> Node {
    let mut node = Node::default();
    node.meta_mut().name = Some(name.to_string());
    if !labels.is_empty() {
        node.meta_mut().labels = Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
    }
    if let Some(ip) = internal_ip {
        node.status = Some(NodeStatus {
            addresses: Some(vec![NodeAddress {
                type_: "InternalIP".into(),
                address: ip.into(),
            }]),
            ..Default::default()
        });
    }
    node
}

/// Build a kube client pointed at a non-existent local endpoint.
///
/// Usable for constructing contexts & manifests; tests never issue calls
/// through it.
pub fn fake_client() -> kube::Client {
    let config = kube::Config::new("http://localhost:8080".parse().expect("static url must parse"));
    kube::Client::try_from(config).expect("client must build from static config")
}

/// Build a release context around the given environment & process specs.
pub fn release_context(
    env: ModuleEnvironment, specs: Vec<wharf_core::models::ProcessSpec>, plans: Vec<Plan>,
) -> crate::release::ReleaseContext {
    use chrono::Utc;
    let build = wharf_core::models::Build {
        id: Uuid::new_v4(),
        engine_app: env.engine_app.uuid,
        slug_path: None,
        image: Some("registry.example.com/apps/demo:v4".into()),
        procfile: [("web".to_string(), "python app.py".to_string())].into_iter().collect(),
        branch: "main".into(),
        revision: "3f2a1c9".into(),
        env_variables: Default::default(),
        created: Utc::now(),
    };
    let release = wharf_core::models::Release {
        id: Uuid::new_v4(),
        engine_app: env.engine_app.uuid,
        version: 4,
        build: build.id,
        failed: false,
        summary: None,
        created: Utc::now(),
    };
    let deployment = wharf_core::models::Deployment {
        id: Uuid::new_v4(),
        env_key: env.release_key(),
        engine_app: env.engine_app.uuid,
        release: release.id,
        phase: wharf_core::models::ReleasePhase::Pending,
        release_int_requested_at: None,
        created: Utc::now(),
    };
    crate::release::ReleaseContext {
        client: fake_client(),
        cluster: std::sync::Arc::new(cluster("primary", "default", true)),
        deployment,
        release,
        build,
        plans: plans.into_iter().map(|plan| (plan.name.clone(), plan)).collect(),
        specs,
        runtime: Default::default(),
        binding: None,
        description: None,
        extra_envs: Default::default(),
        env,
    }
}

/// Build a process spec for the given engine app.
pub fn process_spec(engine_app: Uuid, name: &str, replicas: u32, port: Option<u16>) -> wharf_core::models::ProcessSpec {
    wharf_core::models::ProcessSpec {
        id: Uuid::new_v4(),
        engine_app,
        name: name.into(),
        proc_command: Some(format!("run {}", name)),
        command: vec![],
        args: vec![],
        port,
        target_replicas: replicas,
        target_status: wharf_core::models::TargetStatus::Start,
        plan: "default".into(),
        autoscaling: false,
        scaling_config: None,
        tenant_id: "default".into(),
    }
}

/// Build a registered cluster record.
pub fn cluster(name: &str, tenant_id: &str, is_default: bool) -> Cluster {
    Cluster {
        name: name.into(),
        bcs_cluster_id: Some(format!("BCS-{}", name.to_uppercase())),
        tenant_id: tenant_id.into(),
        is_default,
        ingress_config: IngressConfig::default(),
        credentials: String::new(),
    }
}
