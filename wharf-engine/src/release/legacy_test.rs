use std::sync::Arc;

use super::legacy::{
    build_deployment, build_ingress, build_service, deployment_name, ingress_name, merged_env, merged_node_selector, process_type_from_deployment_name,
    replicas_patch, service_name,
};
use crate::fixtures;
use crate::utils;
use wharf_core::models::{AppType, Domain, Environment, IngressConfig, RCStateAppBinding, TargetStatus};

fn ctx_with_web() -> crate::release::ReleaseContext {
    let env = fixtures::module_environment("demo_app", Environment::Stag, AppType::Default);
    let spec = fixtures::process_spec(env.engine_app.uuid, "web", 2, Some(5000));
    fixtures::release_context(env, vec![spec], vec![fixtures::plan("default", 5)])
}

#[tokio::test]
async fn workload_names_encode_region_app_type_and_language() {
    let ctx = ctx_with_web();
    assert_eq!(deployment_name(&ctx.env, "web"), "default-demo0us0app-web-python-deployment");
    assert_eq!(service_name(&ctx.env, "web"), "default-demo0us0app-web");
    assert_eq!(ingress_name(&ctx.env), "default-demo0us0app");
}

#[tokio::test]
async fn process_type_round_trips_through_deployment_name() {
    let ctx = ctx_with_web();
    let name = deployment_name(&ctx.env, "celery-worker");
    assert_eq!(process_type_from_deployment_name(&ctx.env, &name).as_deref(), Some("celery-worker"));
    assert_eq!(process_type_from_deployment_name(&ctx.env, "unrelated-name"), None);
}

#[tokio::test]
async fn deployment_replicas_follow_computed_replicas() {
    let mut ctx = ctx_with_web();
    let plan = ctx.plans.get("default").cloned().expect("expected default plan");

    let workload = build_deployment(&ctx, &ctx.specs[0], &plan).expect("expected deployment to build");
    assert_eq!(workload.spec.as_ref().and_then(|spec| spec.replicas), Some(2));

    ctx.specs[0].target_status = TargetStatus::Stop;
    let stopped = build_deployment(&ctx, &ctx.specs[0], &plan).expect("expected deployment to build");
    assert_eq!(
        stopped.spec.as_ref().and_then(|spec| spec.replicas),
        Some(0),
        "expected stopped process to render zero replicas"
    );
}

#[tokio::test]
async fn deployment_carries_plan_resources_and_merged_env() {
    let ctx = ctx_with_web();
    let plan = ctx.plans.get("default").cloned().expect("expected default plan");

    let workload = build_deployment(&ctx, &ctx.specs[0], &plan).expect("expected deployment to build");
    let pod_spec = workload
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .expect("expected pod spec");
    let container = &pod_spec.containers[0];
    assert_eq!(container.name, "main");
    assert_eq!(container.image.as_deref(), Some("registry.example.com/apps/demo:v4"));

    let resources = container.resources.as_ref().expect("expected resources");
    let requests = resources.requests.as_ref().expect("expected requests");
    assert_eq!(requests.get("cpu").map(|q| q.0.as_str()), Some("250m"));
    assert_eq!(requests.get("memory").map(|q| q.0.as_str()), Some("512Mi"));

    let env_vars = container.env.as_ref().expect("expected env vars");
    let get = |name: &str| env_vars.iter().find(|var| var.name == name).and_then(|var| var.value.clone());
    assert_eq!(get("PAAS_APP_CODE").as_deref(), Some("demo-app"));
    assert_eq!(get("PAAS_ENVIRONMENT").as_deref(), Some("stag"));
    assert_eq!(get("PORT").as_deref(), Some("5000"));
}

#[tokio::test]
async fn env_layering_later_layers_win() {
    let mut ctx = ctx_with_web();
    ctx.runtime.env_variables.insert("FOO".into(), "from-config".into());
    ctx.build.env_variables.insert("FOO".into(), "from-build".into());
    ctx.extra_envs.insert("FOO".into(), "from-caller".into());

    let merged = merged_env(&ctx, &ctx.specs[0]);
    assert_eq!(merged.get("FOO").map(String::as_str), Some("from-caller"));
}

#[tokio::test]
async fn node_selector_includes_state_binding_label() {
    let mut ctx = ctx_with_web();
    ctx.runtime.node_selector.insert("zone".into(), "z1".into());
    ctx.binding = Some(RCStateAppBinding {
        engine_app: ctx.env.engine_app.uuid,
        state_name: "eng-cstate-ab12cd34-1".into(),
        cluster_name: "primary".into(),
    });

    let selector = merged_node_selector(&ctx);
    assert_eq!(selector.get("zone").map(String::as_str), Some("z1"));
    assert_eq!(selector.get("eng-cstate-ab12cd34-1").map(String::as_str), Some("1"));
}

#[tokio::test]
async fn service_points_at_the_process_selector() {
    let ctx = ctx_with_web();
    let service = build_service(&ctx, &ctx.specs[0], 5000);
    assert_eq!(service.metadata.name.as_deref(), Some("default-demo0us0app-web"));
    let spec = service.spec.as_ref().expect("expected service spec");
    let selector = spec.selector.as_ref().expect("expected selector");
    assert_eq!(selector.get(utils::LABEL_PROCESS_TYPE).map(String::as_str), Some("web"));
    assert!(
        !selector.contains_key(utils::LABEL_RELEASE_VERSION),
        "selector must stay stable across releases"
    );
    assert_eq!(spec.ports.as_ref().map(|ports| ports[0].port), Some(5000));
}

#[tokio::test]
async fn ingress_routes_usable_domains_at_the_web_service() {
    let mut ctx = ctx_with_web();
    let mut cluster = fixtures::cluster("primary", "default", true);
    cluster.ingress_config = IngressConfig {
        app_root_domains: vec![
            Domain { name: "apps.example.com".into(), reserved: false, https_enabled: true },
            Domain { name: "reserved.example.com".into(), reserved: true, https_enabled: false },
        ],
        sub_path_domains: vec![Domain { name: "paas.example.com".into(), reserved: false, https_enabled: true }],
    };
    ctx.cluster = Arc::new(cluster);

    let ingress = build_ingress(&ctx, &ctx.specs[0], 5000);
    let rules = ingress.spec.as_ref().and_then(|spec| spec.rules.clone()).expect("expected rules");
    assert_eq!(rules.len(), 2, "expected the reserved domain to be excluded");
    assert_eq!(rules[0].host.as_deref(), Some("demo-app-stag.apps.example.com"));
    assert_eq!(rules[1].host.as_deref(), Some("paas.example.com"));

    for rule in &rules {
        let path = &rule.http.as_ref().expect("expected http rule").paths[0];
        let backend = path.backend.service.as_ref().expect("expected service backend");
        assert_eq!(backend.name, "default-demo0us0app-web", "expected service_name to point at the web service");
    }
    assert_eq!(
        rules[1].http.as_ref().expect("expected http rule").paths[0].path.as_deref(),
        Some("/demo-app/")
    );
}

#[test]
fn replicas_patch_touches_only_the_replica_count() {
    let patch = replicas_patch(0);
    assert_eq!(patch, serde_json::json!({"spec": {"replicas": 0}}));
}
