//! Legacy release path: raw Deployments, Services, Ingresses & HPAs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment as K8sDeployment, DeploymentSpec};
use k8s_openapi::api::autoscaling::v2beta2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec, MetricSpec, MetricTarget, ResourceMetricSource,
};
use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar, LocalObjectReference, PodSpec, PodTemplateSpec, Service, ServicePort, Toleration};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule, IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::client::Client;
use kube::Resource;

use crate::config::Config;
use crate::k8s::{ensure_namespace, restart_deployment, PatchBody, ResourceClient, UpdateMethod};
use crate::release::{ReleaseContext, ReleaseOutcome, ReleaseStrategy};
use crate::utils;
use wharf_core::models::{computed_replicas, Environment, ModuleEnvironment, ProcessSpec, WlApp};
use wharf_core::plan::Plan;
use wharf_core::PlatformError;

/// The name of the main container of every process pod.
///
/// NOTE WELL: do not change the name of this container. It will cause breaking changes.
const CONTAINER_NAME_MAIN: &str = "main";

/// The period between availability polls during a release.
const AVAILABILITY_CHECK_PERIOD: Duration = Duration::from_secs(3);

/// The name of the backing Deployment of a process.
pub fn deployment_name(env: &ModuleEnvironment, process_type: &str) -> String {
    format!(
        "{}-{}-{}-{}-deployment",
        env.application.region,
        env.engine_app.scheduler_safe_name(),
        process_type,
        env.module.language
    )
}

/// The name of the Service fronting a process.
pub fn service_name(env: &ModuleEnvironment, process_type: &str) -> String {
    format!("{}-{}-{}", env.application.region, env.engine_app.scheduler_safe_name(), process_type)
}

/// The name of the Ingress of the environment's web process.
pub fn ingress_name(env: &ModuleEnvironment) -> String {
    format!("{}-{}", env.application.region, env.engine_app.scheduler_safe_name())
}

/// Extract the process type from a managed Deployment name.
pub fn process_type_from_deployment_name(env: &ModuleEnvironment, name: &str) -> Option<String> {
    let prefix = format!("{}-{}-", env.application.region, env.engine_app.scheduler_safe_name());
    let suffix = format!("-{}-deployment", env.module.language);
    name.strip_prefix(prefix.as_str())
        .and_then(|rest| rest.strip_suffix(suffix.as_str()))
        .map(String::from)
}

/// The strategic patch body setting a Deployment's replica count.
pub fn replicas_patch(replicas: u32) -> serde_json::Value {
    serde_json::json!({ "spec": { "replicas": replicas } })
}

/// Merge the environment variable layers of a release, latest wins:
/// platform built-ins, config snapshot, build variables, caller extras.
pub fn merged_env(ctx: &ReleaseContext, spec: &ProcessSpec) -> BTreeMap<String, String> {
    let mut platform = BTreeMap::new();
    platform.insert("PAAS_APP_CODE".into(), ctx.env.application.code.clone());
    platform.insert("PAAS_MODULE_NAME".into(), ctx.env.module.name.clone());
    platform.insert("PAAS_ENVIRONMENT".into(), ctx.env.environment.to_string());
    platform.insert("PAAS_ENGINE_APP_NAME".into(), ctx.env.engine_app.scheduler_safe_name());
    if let Some(port) = spec.port {
        platform.insert("PORT".into(), port.to_string());
    }
    utils::merge_maps(&[&platform, &ctx.runtime.env_variables, &ctx.build.env_variables, &ctx.extra_envs])
}

/// The merged node selector of a process: config overlay plus the
/// cluster-state binding label when the app is pinned.
pub fn merged_node_selector(ctx: &ReleaseContext) -> BTreeMap<String, String> {
    let mut selector = ctx.runtime.node_selector.clone();
    if let Some(binding) = &ctx.binding {
        selector.insert(binding.state_name.clone(), "1".into());
    }
    selector
}

fn workload_labels(wl_app: &WlApp, process_type: &str, version: u64) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    utils::set_canonical_labels(&mut labels, wl_app);
    labels.insert(utils::LABEL_PROCESS_TYPE.into(), process_type.to_string());
    labels.insert(utils::LABEL_RELEASE_VERSION.into(), version.to_string());
    labels
}

/// Build the backing Deployment of a process.
pub fn build_deployment(ctx: &ReleaseContext, spec: &ProcessSpec, plan: &Plan) -> Result<K8sDeployment> {
    let env = &ctx.env;
    let labels = workload_labels(&env.engine_app, &spec.name, ctx.release.version);
    // Selectors must stay stable across releases.
    let mut selector_labels = labels.clone();
    selector_labels.remove(utils::LABEL_RELEASE_VERSION);

    let image = ctx
        .build
        .image
        .clone()
        .or_else(|| ctx.runtime.image.clone())
        .or_else(|| ctx.runtime.runtime.image.clone())
        .ok_or_else(|| PlatformError::CannotDeployApp("release carries no runnable image".to_string()))?;

    let procfile = ctx.release.get_procfile(&ctx.build, &ctx.specs);
    let args = if !spec.args.is_empty() {
        spec.args.clone()
    } else {
        ctx.runtime.runtime.command_for(&spec.name, &procfile)
    };
    let command = if !spec.command.is_empty() {
        spec.command.clone()
    } else {
        ctx.runtime.runtime.entrypoint.clone()
    };

    let env_vars: Vec<EnvVar> = merged_env(ctx, spec)
        .into_iter()
        .map(|(name, value)| EnvVar {
            name,
            value: Some(value),
            ..Default::default()
        })
        .collect();

    let tolerations: Vec<Toleration> = ctx
        .runtime
        .tolerations
        .iter()
        .filter_map(|raw| match serde_json::from_value(raw.clone()) {
            Ok(toleration) => Some(toleration),
            Err(err) => {
                tracing::warn!(error = ?err, "dropping undecodable toleration overlay entry");
                None
            }
        })
        .collect();

    let resources = k8s_openapi::api::core::v1::ResourceRequirements {
        requests: Some(quantity_map(&plan.requests)),
        limits: Some(quantity_map(&plan.limits)),
    };

    let mut workload = K8sDeployment::default();
    workload.meta_mut().name = Some(deployment_name(env, &spec.name));
    workload.meta_mut().namespace = Some(env.engine_app.namespace.clone());
    workload.meta_mut().labels = Some(labels.clone());
    workload.spec = Some(DeploymentSpec {
        replicas: Some(computed_replicas(spec) as i32),
        selector: LabelSelector {
            match_labels: Some(selector_labels.clone()),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                node_selector: non_empty_map(merged_node_selector(ctx)),
                tolerations: if tolerations.is_empty() { None } else { Some(tolerations) },
                image_pull_secrets: pull_secrets(ctx),
                containers: vec![Container {
                    name: CONTAINER_NAME_MAIN.into(),
                    image: Some(image),
                    image_pull_policy: ctx.runtime.runtime.image_pull_policy.clone().or_else(|| Some("IfNotPresent".into())),
                    command: if command.is_empty() { None } else { Some(command) },
                    args: if args.is_empty() { None } else { Some(args) },
                    env: Some(env_vars),
                    resources: Some(resources),
                    ports: spec.port.map(|port| {
                        vec![ContainerPort {
                            container_port: port as i32,
                            protocol: Some("TCP".into()),
                            ..Default::default()
                        }]
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        },
        ..Default::default()
    });
    Ok(workload)
}

/// Build the Service fronting a process with a port.
pub fn build_service(ctx: &ReleaseContext, spec: &ProcessSpec, port: u16) -> Service {
    let env = &ctx.env;
    let mut selector = workload_labels(&env.engine_app, &spec.name, ctx.release.version);
    selector.remove(utils::LABEL_RELEASE_VERSION);

    let mut service = Service::default();
    service.meta_mut().name = Some(service_name(env, &spec.name));
    service.meta_mut().namespace = Some(env.engine_app.namespace.clone());
    service.meta_mut().labels = Some(selector.clone());

    let svc_spec = service.spec.get_or_insert_with(Default::default);
    svc_spec.type_ = Some("ClusterIP".into());
    svc_spec.selector = Some(selector);
    svc_spec.ports = Some(vec![ServicePort {
        name: Some(spec.name.clone()),
        port: port as i32,
        protocol: Some("TCP".into()),
        target_port: Some(IntOrString::Int(port as i32)),
        ..Default::default()
    }]);
    service
}

/// Build the Ingress routing the environment's hostnames at the web Service.
pub fn build_ingress(ctx: &ReleaseContext, web: &ProcessSpec, port: u16) -> Ingress {
    let env = &ctx.env;
    let backend = IngressBackend {
        service: Some(IngressServiceBackend {
            name: service_name(env, &web.name),
            port: Some(ServiceBackendPort {
                number: Some(port as i32),
                ..Default::default()
            }),
        }),
        ..Default::default()
    };
    let path_for = |path: &str| HTTPIngressRuleValue {
        paths: vec![HTTPIngressPath {
            backend: backend.clone(),
            path: Some(path.to_string()),
            path_type: "Prefix".into(),
        }],
    };

    let mut rules = vec![];
    for domain in ctx.cluster.ingress_config.usable_root_domains() {
        let host = match env.environment {
            Environment::Prod => format!("{}.{}", env.application.code, domain.name),
            Environment::Stag => format!("{}-stag.{}", env.application.code, domain.name),
        };
        rules.push(IngressRule {
            host: Some(host),
            http: Some(path_for("/")),
        });
    }
    for domain in ctx.cluster.ingress_config.sub_path_domains.iter().filter(|domain| !domain.reserved) {
        rules.push(IngressRule {
            host: Some(domain.name.clone()),
            http: Some(path_for(&format!("/{}/", env.application.code))),
        });
    }

    let mut ingress = Ingress::default();
    ingress.meta_mut().name = Some(ingress_name(env));
    ingress.meta_mut().namespace = Some(env.engine_app.namespace.clone());
    let mut labels = BTreeMap::new();
    utils::set_canonical_labels(&mut labels, &env.engine_app);
    ingress.meta_mut().labels = Some(labels);
    ingress.spec = Some(IngressSpec {
        rules: Some(rules),
        ..Default::default()
    });
    ingress
}

/// Build the HPA of an autoscaled process.
pub fn build_hpa(ctx: &ReleaseContext, spec: &ProcessSpec) -> Option<HorizontalPodAutoscaler> {
    let scaling = spec.scaling_config.as_ref()?;
    let env = &ctx.env;
    let mut hpa = HorizontalPodAutoscaler::default();
    hpa.meta_mut().name = Some(deployment_name(env, &spec.name));
    hpa.meta_mut().namespace = Some(env.engine_app.namespace.clone());
    hpa.meta_mut().labels = Some(workload_labels(&env.engine_app, &spec.name, ctx.release.version));
    hpa.spec = Some(HorizontalPodAutoscalerSpec {
        scale_target_ref: CrossVersionObjectReference {
            api_version: Some("apps/v1".into()),
            kind: "Deployment".into(),
            name: deployment_name(env, &spec.name),
        },
        min_replicas: Some(scaling.min_replicas as i32),
        max_replicas: scaling.max_replicas as i32,
        metrics: Some(vec![MetricSpec {
            type_: "Resource".into(),
            resource: Some(ResourceMetricSource {
                name: "cpu".into(),
                target: MetricTarget {
                    type_: "Utilization".into(),
                    average_utilization: Some(85),
                    ..Default::default()
                },
            }),
            ..Default::default()
        }]),
        ..Default::default()
    });
    Some(hpa)
}

fn quantity_map(spec: &wharf_core::plan::ResourceSpec) -> BTreeMap<String, Quantity> {
    maplit::btreemap! {
        "cpu".into() => Quantity(spec.cpu.clone()),
        "memory".into() => Quantity(spec.memory.clone()),
    }
}

fn non_empty_map(map: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

fn pull_secrets(ctx: &ReleaseContext) -> Option<Vec<LocalObjectReference>> {
    let secrets: Vec<LocalObjectReference> = ctx
        .runtime
        .runtime
        .image_pull_secrets
        .iter()
        .map(|name| LocalObjectReference { name: Some(name.clone()) })
        .collect();
    if secrets.is_empty() {
        None
    } else {
        Some(secrets)
    }
}

//////////////////////////////////////////////////////////////////////////////
// Strategy //////////////////////////////////////////////////////////////////

/// The legacy release strategy.
pub struct LegacyReleaseStrategy {
    config: Arc<Config>,
}

impl LegacyReleaseStrategy {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ReleaseStrategy for LegacyReleaseStrategy {
    async fn execute(&self, ctx: &ReleaseContext) -> Result<ReleaseOutcome> {
        let env = &ctx.env;
        ensure_namespace(ctx.client.clone(), &env.engine_app.namespace).await?;

        let deployments: ResourceClient<K8sDeployment> = ResourceClient::namespaced(ctx.client.clone(), &env.engine_app.namespace);
        let services: ResourceClient<Service> = ResourceClient::namespaced(ctx.client.clone(), &env.engine_app.namespace);
        let ingresses: ResourceClient<Ingress> = ResourceClient::namespaced(ctx.client.clone(), &env.engine_app.namespace);
        let hpas: ResourceClient<HorizontalPodAutoscaler> = ResourceClient::namespaced(ctx.client.clone(), &env.engine_app.namespace);

        let mut applied_names = vec![];
        for spec in &ctx.specs {
            let plan = ctx.plans.get(&spec.plan).ok_or_else(|| PlatformError::ResourceMissing {
                kind: "Plan".into(),
                name: spec.plan.clone(),
            })?;
            let workload = build_deployment(ctx, spec, plan)?;
            let name = deployment_name(env, &spec.name);
            deployments
                .create_or_update(&name, &workload)
                .await
                .with_context(|| format!("error applying Deployment for process {}", spec.name))?;
            applied_names.push((name, computed_replicas(spec)));

            if let Some(port) = spec.port {
                let service = build_service(ctx, spec, port);
                services
                    .get_or_create(&service_name(env, &spec.name), &service)
                    .await
                    .with_context(|| format!("error ensuring Service for process {}", spec.name))?;

                if spec.name == "web" {
                    let ingress = build_ingress(ctx, spec, port);
                    ingresses
                        .get_or_create(&ingress_name(env), &ingress)
                        .await
                        .context("error ensuring Ingress for web process")?;
                }
            }

            if spec.autoscaling {
                if let Some(hpa) = build_hpa(ctx, spec) {
                    let name = deployment_name(env, &spec.name);
                    let (_existing, created) = hpas
                        .get_or_create(&name, &hpa)
                        .await
                        .with_context(|| format!("error ensuring HPA for process {}", spec.name))?;
                    if !created {
                        hpas.replace_or_patch(&name, &hpa, UpdateMethod::Patch)
                            .await
                            .with_context(|| format!("error updating HPA for process {}", spec.name))?;
                    }
                }
            }
        }

        cleanup_stale_processes(ctx, &deployments, &hpas).await?;

        wait_for_available(
            &deployments,
            &applied_names,
            Duration::from_secs(self.config.release_timeout_seconds),
        )
        .await?;
        Ok(ReleaseOutcome::Released)
    }
}

/// Delete workloads of process types which no longer have a spec.
///
/// Only Deployments & HPAs are removed; Services and Ingresses are kept to
/// preserve DNS continuity.
async fn cleanup_stale_processes(
    ctx: &ReleaseContext, deployments: &ResourceClient<K8sDeployment>, hpas: &ResourceClient<HorizontalPodAutoscaler>,
) -> Result<()> {
    let env = &ctx.env;
    let selector = utils::app_label_selector(&env.engine_app);
    let live = deployments.list(&selector).await?;
    for workload in live {
        let name = match workload.metadata.name.as_deref() {
            Some(name) => name.to_string(),
            None => continue,
        };
        let process_type = match process_type_from_deployment_name(env, &name) {
            Some(process_type) => process_type,
            None => continue,
        };
        if ctx.specs.iter().any(|spec| spec.name == process_type) {
            continue;
        }
        tracing::info!(process = process_type.as_str(), "removing workloads of dropped process");
        deployments.delete(&name, false).await?;
        let hpa_selector = format!("{},{}={}", selector, utils::LABEL_PROCESS_TYPE, process_type);
        hpas.delete_collection(&hpa_selector).await?;
    }
    Ok(())
}

/// Poll until every applied Deployment reports enough available replicas:
/// `availableReplicas >= desired - maxUnavailable`.
async fn wait_for_available(deployments: &ResourceClient<K8sDeployment>, applied: &[(String, u32)], overall_timeout: Duration) -> Result<()> {
    let started = Instant::now();
    loop {
        let mut pending = vec![];
        for (name, desired) in applied {
            let workload = deployments.get(name).await?;
            let available = workload
                .status
                .as_ref()
                .and_then(|status| status.available_replicas)
                .unwrap_or(0)
                .max(0) as u32;
            // Default rolling-update tolerance of 25%, rounded down.
            let max_unavailable = desired / 4;
            if available + max_unavailable < *desired {
                pending.push(name.clone());
            }
        }
        if pending.is_empty() {
            return Ok(());
        }
        if started.elapsed() >= overall_timeout {
            return Err(PlatformError::ReadTargetStatusTimeout {
                name: pending.join(","),
                elapsed_seconds: started.elapsed().as_secs(),
            }
            .into());
        }
        tokio::time::sleep(AVAILABILITY_CHECK_PERIOD).await;
    }
}

//////////////////////////////////////////////////////////////////////////////
// Process Operations ////////////////////////////////////////////////////////

/// Patch the given processes down to zero replicas.
///
/// Services and Ingresses are left untouched to preserve DNS and TLS
/// continuity; only the Deployment's replica count changes.
#[tracing::instrument(level = "debug", skip(client, env, process_types))]
pub async fn shutdown_processes(client: Client, env: &ModuleEnvironment, process_types: &[String]) -> Result<()> {
    let deployments: ResourceClient<K8sDeployment> = ResourceClient::namespaced(client, &env.engine_app.namespace);
    for process_type in process_types {
        let name = deployment_name(env, process_type);
        deployments
            .patch(&name, PatchBody::Strategic(replicas_patch(0)))
            .await
            .with_context(|| format!("error shutting down process {}", process_type))?;
        tracing::info!(process = process_type.as_str(), "process shut down");
    }
    Ok(())
}

/// Patch the given processes to their target replica counts.
#[tracing::instrument(level = "debug", skip(client, env, targets))]
pub async fn scale_processes(client: Client, env: &ModuleEnvironment, targets: &[(String, u32)]) -> Result<()> {
    let deployments: ResourceClient<K8sDeployment> = ResourceClient::namespaced(client, &env.engine_app.namespace);
    for (process_type, replicas) in targets {
        let name = deployment_name(env, process_type);
        deployments
            .patch(&name, PatchBody::Strategic(replicas_patch(*replicas)))
            .await
            .with_context(|| format!("error scaling process {}", process_type))?;
        tracing::info!(process = process_type.as_str(), replicas, "process scaled");
    }
    Ok(())
}

/// Trigger a rollout restart of the given process.
#[tracing::instrument(level = "debug", skip(client, env, process_type))]
pub async fn restart_process(client: Client, env: &ModuleEnvironment, process_type: &str) -> Result<()> {
    let name = deployment_name(env, process_type);
    restart_deployment(client, &name, &env.engine_app.namespace).await?;
    tracing::info!(process = process_type, "process restarted");
    Ok(())
}
