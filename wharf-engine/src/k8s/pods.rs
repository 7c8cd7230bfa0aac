//! Pod & Deployment helpers built on the typed client layer.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::prelude::*;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, ServiceAccount};
use kube::api::{Api, LogParams, Patch, PatchParams};
use kube::client::Client;
use tokio::time::timeout;

use crate::error::is_not_found;
use crate::k8s::API_TIMEOUT;
use crate::utils;
use wharf_core::PlatformError;

/// The annotation patched to trigger a rollout restart of a Deployment.
pub const ANNOTATION_RESTARTED_AT: &str = "kubectl.kubernetes.io/restartedAt";

/// Options for a pod log read.
#[derive(Clone, Debug, Default)]
pub struct LogOptions {
    pub container: Option<String>,
    pub previous: bool,
    pub timestamps: bool,
    pub tail_lines: Option<i64>,
    pub since_seconds: Option<i64>,
}

impl LogOptions {
    fn into_params(self, follow: bool) -> LogParams {
        LogParams {
            container: self.container,
            follow,
            previous: self.previous,
            timestamps: self.timestamps,
            tail_lines: self.tail_lines,
            since_seconds: self.since_seconds,
            ..Default::default()
        }
    }
}

/// The phase of the given pod, defaulting to `Unknown`.
pub fn pod_phase(pod: &Pod) -> String {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.clone())
        .unwrap_or_else(|| "Unknown".into())
}

/// Poll the named pod until its phase is one of the expected states.
///
/// Fails with `PodAbsent` if the pod disappears and `PodTimeout` if no
/// expected state is reached within the given timeout.
#[tracing::instrument(level = "debug", skip(client, namespace, name, expected_states))]
pub async fn wait_for_status(
    client: Client, name: &str, expected_states: &[&str], namespace: &str, overall_timeout: Duration, check_period: Duration,
) -> Result<String> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let started = Instant::now();
    loop {
        let res = timeout(API_TIMEOUT, api.get(name)).await.context("timeout while fetching pod")?;
        match res {
            Ok(pod) => {
                let phase = pod_phase(&pod);
                if expected_states.contains(&phase.as_str()) {
                    return Ok(phase);
                }
            }
            Err(err) if is_not_found(&err) => return Err(PlatformError::PodAbsent(name.to_string()).into()),
            Err(err) => return Err(err).context("error fetching pod"),
        }
        if started.elapsed() >= overall_timeout {
            return Err(PlatformError::PodTimeout {
                name: name.to_string(),
                elapsed_seconds: started.elapsed().as_secs(),
            }
            .into());
        }
        tokio::time::sleep(check_period).await;
    }
}

/// Read the named pod's log in one shot.
#[tracing::instrument(level = "debug", skip(client, namespace, name, opts))]
pub async fn get_pod_log(client: Client, name: &str, namespace: &str, opts: LogOptions) -> Result<String> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    api.logs(name, &opts.into_params(false)).await.context("error reading pod log")
}

/// Follow the named pod's log as a lazy stream of UTF-8 lines.
///
/// The stream ends cleanly when the upstream pod terminates; lines which fail
/// to decode are dropped with a logged warning and the stream continues.
pub async fn pod_log_lines(client: Client, name: &str, namespace: &str, opts: LogOptions) -> Result<impl Stream<Item = String>> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let reader = api.log_stream(name, &opts.into_params(true)).await.context("error opening pod log stream")?;
    let reader = reader.map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err)).into_async_read();
    Ok(reader.lines().filter_map(|line_res| async move {
        match line_res {
            Ok(line) => Some(line),
            Err(err) => {
                tracing::warn!(error = ?err, "dropping undecodable log line");
                None
            }
        }
    }))
}

/// Whether the default ServiceAccount of the namespace exists.
#[tracing::instrument(level = "debug", skip(client, namespace))]
pub async fn default_sa_exists(client: Client, namespace: &str) -> Result<bool> {
    let api: Api<ServiceAccount> = Api::namespaced(client, namespace);
    let res = timeout(API_TIMEOUT, api.get("default"))
        .await
        .context("timeout while fetching default ServiceAccount")?;
    match res {
        Ok(_sa) => Ok(true),
        Err(err) if is_not_found(&err) => Ok(false),
        Err(err) => Err(err).context("error fetching default ServiceAccount"),
    }
}

/// Poll until the default ServiceAccount of the namespace exists.
///
/// Pod creation in a freshly provisioned namespace fails until the token
/// controller has populated it, so callers wait here first.
#[tracing::instrument(level = "debug", skip(client, namespace))]
pub async fn wait_for_default_sa(client: Client, namespace: &str, overall_timeout: Duration, check_period: Duration) -> Result<()> {
    let started = Instant::now();
    loop {
        if default_sa_exists(client.clone(), namespace).await? {
            return Ok(());
        }
        if started.elapsed() >= overall_timeout {
            return Err(PlatformError::CreateServiceAccountTimeout {
                namespace: namespace.to_string(),
                elapsed_seconds: started.elapsed().as_secs(),
            }
            .into());
        }
        tokio::time::sleep(check_period).await;
    }
}

/// The strategic patch body of a rollout restart: only the pod template's
/// `kubectl.kubernetes.io/restartedAt` annotation, nothing else.
pub fn restart_patch_body() -> serde_json::Value {
    serde_json::json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": { ANNOTATION_RESTARTED_AT: utils::now_rfc3339() }
                }
            }
        }
    })
}

/// Trigger a rollout restart of the named Deployment.
#[tracing::instrument(level = "debug", skip(client, namespace, name))]
pub async fn restart_deployment(client: Client, name: &str, namespace: &str) -> Result<Deployment> {
    let api: Api<Deployment> = Api::namespaced(client, namespace);
    timeout(API_TIMEOUT, api.patch(name, &PatchParams::default(), &Patch::Strategic(restart_patch_body())))
        .await
        .context("timeout while restarting Deployment")?
        .map_err(|err| crate::error::map_resource_err(err, "Deployment", name))
}
