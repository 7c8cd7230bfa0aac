//! Process controller.
//!
//! CRUD over running processes: consolidates Deployment & Pod state into
//! `Process`/`Instance` views, patches replica counts at the edge, reads
//! container logs, and allocates web-console sessions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment as K8sDeployment;
use k8s_openapi::api::core::v1::Pod;
use kube::client::Client;
use kube::Resource;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::is_api_code;
use crate::k8s::{self, LogOptions, ResourceClient};
use crate::release::legacy;
use crate::utils;
use wharf_core::models::ModuleEnvironment;
use wharf_core::PlatformError;

/// A running process of an environment.
#[derive(Clone, Debug, Serialize)]
pub struct Process {
    #[serde(rename = "type")]
    pub process_type: String,
    /// Desired replicas of the backing Deployment.
    pub replicas: u32,
    pub status: ProcessStatus,
    pub instances: Vec<Instance>,
}

/// Consolidated Deployment status counts.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ProcessStatus {
    pub replicas: u32,
    pub success: u32,
    pub failed: u32,
}

/// One pod of a process.
#[derive(Clone, Debug, Serialize)]
pub struct Instance {
    pub name: String,
    pub process_type: Option<String>,
    pub host_ip: Option<String>,
    pub start_time: Option<String>,
    pub state: String,
    pub state_message: Option<String>,
    pub image: Option<String>,
    pub ready: bool,
    pub restart_count: u32,
    pub version: Option<String>,
}

/// The full process listing of an environment, with resource-version
/// watermarks for change detection.
#[derive(Clone, Debug, Serialize)]
pub struct ProcessListSnapshot {
    pub processes: Vec<Process>,
    pub rv_proc: String,
    pub rv_inst: String,
}

/// Build a `Process` view from a managed Deployment.
pub fn process_from_deployment(env: &ModuleEnvironment, workload: &K8sDeployment) -> Option<Process> {
    let name = workload.meta().name.as_deref()?;
    let process_type = workload
        .meta()
        .labels
        .as_ref()
        .and_then(|labels| labels.get(utils::LABEL_PROCESS_TYPE).cloned())
        .or_else(|| legacy::process_type_from_deployment_name(env, name))?;
    let status = workload.status.as_ref();
    Some(Process {
        process_type,
        replicas: workload.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(0).max(0) as u32,
        status: ProcessStatus {
            replicas: status.and_then(|s| s.replicas).unwrap_or(0).max(0) as u32,
            success: status.and_then(|s| s.available_replicas).unwrap_or(0).max(0) as u32,
            failed: status.and_then(|s| s.unavailable_replicas).unwrap_or(0).max(0) as u32,
        },
        instances: vec![],
    })
}

/// Build an `Instance` view from a pod.
pub fn instance_from_pod(pod: &Pod) -> Instance {
    let labels = pod.meta().labels.clone().unwrap_or_default();
    let status = pod.status.as_ref();
    let container_status = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|cs| cs.name == "main").or_else(|| statuses.first()));

    let (state, state_message) = match container_status.and_then(|cs| cs.state.as_ref()) {
        Some(state) => {
            if state.running.is_some() {
                ("Running".to_string(), None)
            } else if let Some(waiting) = &state.waiting {
                ("Waiting".to_string(), waiting.reason.clone().or_else(|| waiting.message.clone()))
            } else if let Some(terminated) = &state.terminated {
                ("Terminated".to_string(), terminated.reason.clone().or_else(|| terminated.message.clone()))
            } else {
                ("Unknown".to_string(), None)
            }
        }
        None => (
            status.and_then(|s| s.phase.clone()).unwrap_or_else(|| "Unknown".into()),
            None,
        ),
    };

    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| conditions.iter().any(|cond| cond.type_ == "Ready" && cond.status == "True"))
        .unwrap_or(false);

    Instance {
        name: pod.meta().name.clone().unwrap_or_default(),
        process_type: labels.get(utils::LABEL_PROCESS_TYPE).cloned(),
        host_ip: status.and_then(|s| s.host_ip.clone()),
        start_time: status.and_then(|s| s.start_time.as_ref()).map(|time| time.0.to_rfc3339()),
        state,
        state_message,
        image: pod
            .spec
            .as_ref()
            .and_then(|spec| spec.containers.iter().find(|c| c.name == "main").or_else(|| spec.containers.first()))
            .and_then(|container| container.image.clone()),
        ready,
        restart_count: container_status.map(|cs| cs.restart_count).unwrap_or(0).max(0) as u32,
        version: labels.get(utils::LABEL_RELEASE_VERSION).cloned(),
    }
}

/// The larger of two resource versions; numeric when both parse, else
/// lexicographic.
fn max_resource_version(current: String, candidate: Option<&String>) -> String {
    let candidate = match candidate {
        Some(candidate) => candidate,
        None => return current,
    };
    match (current.parse::<u64>(), candidate.parse::<u64>()) {
        (Ok(a), Ok(b)) if b > a => candidate.clone(),
        (Ok(_), Ok(_)) => current,
        _ => {
            if candidate.as_str() > current.as_str() {
                candidate.clone()
            } else {
                current
            }
        }
    }
}

/// Attach instances to their processes by process type.
pub fn attach_instances(processes: &mut Vec<Process>, instances: Vec<Instance>) {
    let mut by_type: BTreeMap<String, Vec<Instance>> = BTreeMap::new();
    for instance in instances {
        if let Some(process_type) = instance.process_type.clone() {
            by_type.entry(process_type).or_default().push(instance);
        }
    }
    for process in processes.iter_mut() {
        if let Some(instances) = by_type.remove(&process.process_type) {
            process.instances = instances;
        }
    }
}

/// The process controller of one engine cluster.
pub struct ProcessController {
    config: Arc<Config>,
}

impl ProcessController {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// List the processes of the given environment with their instances.
    #[tracing::instrument(level = "debug", skip(self, client, env))]
    pub async fn list_processes(&self, client: Client, env: &ModuleEnvironment) -> Result<ProcessListSnapshot> {
        let selector = utils::app_label_selector(&env.engine_app);
        let deployments: ResourceClient<K8sDeployment> = ResourceClient::namespaced(client.clone(), &env.engine_app.namespace);
        let pods: ResourceClient<Pod> = ResourceClient::namespaced(client, &env.engine_app.namespace);

        let workloads = deployments.list(&selector).await?;
        let mut rv_proc = String::new();
        let mut processes: Vec<Process> = vec![];
        for workload in &workloads {
            rv_proc = max_resource_version(rv_proc, workload.meta().resource_version.as_ref());
            if let Some(process) = process_from_deployment(env, workload) {
                processes.push(process);
            }
        }

        let pod_list = pods.list(&selector).await?;
        let mut rv_inst = String::new();
        let mut instances = vec![];
        for pod in &pod_list {
            rv_inst = max_resource_version(rv_inst, pod.meta().resource_version.as_ref());
            instances.push(instance_from_pod(pod));
        }
        attach_instances(&mut processes, instances);

        Ok(ProcessListSnapshot { processes, rv_proc, rv_inst })
    }

    /// Read the log of one process instance in one shot.
    #[tracing::instrument(level = "debug", skip(self, client, env, opts))]
    pub async fn get_instance_logs(&self, client: Client, env: &ModuleEnvironment, instance_name: &str, opts: LogOptions) -> Result<String> {
        k8s::get_pod_log(client, instance_name, &env.engine_app.namespace, opts)
            .await
            .map_err(|err| map_instance_err(err, instance_name))
    }

    /// Follow the log of one process instance as a lazy line stream.
    pub async fn get_instance_logs_stream(
        &self, client: Client, env: &ModuleEnvironment, instance_name: &str, opts: LogOptions,
    ) -> Result<impl futures::Stream<Item = String>> {
        k8s::pod_log_lines(client, instance_name, &env.engine_app.namespace, opts)
            .await
            .map_err(|err| map_instance_err(err, instance_name))
    }

    /// Watch the environment's pods as a finite stream of instance events.
    ///
    /// Callers resume from the `rv_inst` watermark of a prior listing by
    /// consuming the stream; cancellation is dropping it.
    pub fn watch_instances(
        &self, client: Client, env: &ModuleEnvironment, timeout_seconds: Option<u32>,
    ) -> impl futures::Stream<Item = std::result::Result<kube::runtime::watcher::Event<Pod>, kube::runtime::watcher::Error>> {
        let selector = utils::app_label_selector(&env.engine_app);
        let pods: ResourceClient<Pod> = ResourceClient::namespaced(client, &env.engine_app.namespace);
        pods.create_watch_stream(&selector, timeout_seconds)
    }

    /// The image every instance of the environment is running.
    ///
    /// Fails when no instance reports an image or when more than one distinct
    /// image is live.
    #[tracing::instrument(level = "debug", skip(self, client, env))]
    pub async fn get_running_image(&self, client: Client, env: &ModuleEnvironment) -> Result<String> {
        let snapshot = self.list_processes(client, env).await?;
        let images: BTreeSet<String> = snapshot
            .processes
            .iter()
            .flat_map(|process| process.instances.iter())
            .filter_map(|instance| instance.image.clone())
            .collect();
        match images.len() {
            0 => Err(PlatformError::InvalidInput("no running image found for environment".into()).into()),
            1 => Ok(images.into_iter().next().unwrap_or_default()),
            _ => Err(PlatformError::InvalidInput(format!("multiple running images found: {}", images.into_iter().collect::<Vec<_>>().join(", "))).into()),
        }
    }

    /// Allocate a web-console session in the target pod.
    ///
    /// Returns a signed session token opaque to the caller.
    pub fn create_webconsole(
        &self, env: &ModuleEnvironment, operator: &str, process_type: &str, instance_name: &str, container_name: &str, command: &str,
    ) -> Result<String> {
        let secret = self
            .config
            .webconsole_signing_secret
            .as_deref()
            .ok_or_else(|| PlatformError::InvalidInput("web-console sessions are not configured".into()))?;
        let secret = base64::decode(secret).context("error decoding web-console signing secret")?;
        let claims = WebConsoleClaims {
            operator: operator.to_string(),
            namespace: env.engine_app.namespace.clone(),
            process_type: process_type.to_string(),
            pod: instance_name.to_string(),
            container: container_name.to_string(),
            command: command.to_string(),
            iat: Utc::now().timestamp(),
            exp: (Utc::now() + chrono::Duration::minutes(30)).timestamp(),
        };
        jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(&secret),
        )
        .context("error signing web-console session token")
    }
}

/// Claims of a web-console session token.
#[derive(Debug, Serialize, Deserialize)]
struct WebConsoleClaims {
    operator: String,
    namespace: String,
    process_type: String,
    pod: String,
    container: String,
    command: String,
    iat: i64,
    exp: i64,
}

/// Map pod-log API failures onto `InstanceNotFound`.
///
/// A 404, or a 400 for a missing previous terminated container, both mean
/// the instance is not there to read from.
fn map_instance_err(err: anyhow::Error, instance_name: &str) -> anyhow::Error {
    if let Some(platform_err) = err.downcast_ref::<PlatformError>() {
        if platform_err.is_not_found() {
            return PlatformError::InstanceNotFound(instance_name.to_string()).into();
        }
    }
    if let Some(kube_err) = err.downcast_ref::<kube::Error>() {
        if is_api_code(kube_err, 404) {
            return PlatformError::InstanceNotFound(instance_name.to_string()).into();
        }
        if let kube::Error::Api(api_err) = kube_err {
            if api_err.code == 400 && api_err.message.contains("previous terminated container") {
                return PlatformError::InstanceNotFound(instance_name.to_string()).into();
            }
        }
    }
    err
}

#[cfg(test)]
mod mod_test;
