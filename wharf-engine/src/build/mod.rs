//! Build subsystem.
//!
//! Runs builder pods in the application namespace, streams their logs, waits
//! for terminal state, publishes the resulting artifact, and records a
//! `Build` row. Two builder flavors exist: slug buildpack builders and Cloud
//! Native Buildpacks builders; both are orchestrated identically here.

pub mod registry;
pub mod source;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use k8s_openapi::api::core::v1::{Container, EnvVar, LocalObjectReference, Pod, PodSpec};
use kube::client::Client;
use kube::Resource;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::Config;
use crate::database::{decode_model, encode_model, Database, Tree};
use crate::error::retry_transient;
use crate::k8s::{self, ensure_namespace, pod_phase, LogOptions, ResourceClient};
use crate::utils;
use self::registry::RegistryClient;
use wharf_core::models::{Build, BuildProcess, BuildStatus, Buildpack, BuildpackKind, ModuleEnvironment, SourceBlob};
use wharf_core::procfile::{validate_procfile, Procfile};
use wharf_core::PlatformError;

/// The period between builder pod status polls.
const BUILD_CHECK_PERIOD: Duration = Duration::from_secs(3);
/// The period between default-ServiceAccount existence polls.
const SA_CHECK_PERIOD: Duration = Duration::from_secs(2);
/// Minimum length of a log stream channel id.
const STREAM_CHANNEL_ID_MIN_LEN: usize = 32;

const METRIC_BUILDS_SUCCEEDED: &str = "wharf_builds_succeeded";
const METRIC_BUILDS_FAILED: &str = "wharf_builds_failed";

/// The artifact a builder pod is expected to produce.
#[derive(Clone, Debug)]
pub enum BuildArtifact {
    /// A slug tarball written to the blob store; published to the registry as
    /// a single-layer image once the builder finishes.
    Slug { path: String, get_url: String },
    /// An OCI image pushed by the CNB builder itself.
    Image { tag: String },
}

/// Inputs of one build attempt.
#[derive(Clone, Debug)]
pub struct BuildParams {
    pub source: SourceBlob,
    pub branch: String,
    pub revision: String,
    pub procfile: Procfile,
    pub extra_envs: BTreeMap<String, String>,
    pub builder_image: String,
    pub buildpacks: Vec<Buildpack>,
    /// Channel key for streaming builder logs back to the caller.
    pub stream_channel_id: String,
    pub artifact: BuildArtifact,
}

/// The build subsystem.
pub struct BuildSubsystem {
    config: Arc<Config>,
    builds: Tree,
    build_processes: Tree,
    registry: Arc<RegistryClient>,
    http: reqwest::Client,
}

impl BuildSubsystem {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, db: &Database) -> Result<Self> {
        metrics::register_counter!(METRIC_BUILDS_SUCCEEDED, metrics::Unit::Count, "builds which reached a successful terminal state");
        metrics::register_counter!(METRIC_BUILDS_FAILED, metrics::Unit::Count, "builds which reached a failed terminal state");
        let http = reqwest::Client::new();
        Ok(Self {
            registry: Arc::new(RegistryClient::new(config.registry.clone(), http.clone())),
            builds: db.builds()?,
            build_processes: db.build_processes()?,
            config,
            http,
        })
    }

    /// All recorded builds of the given engine app, oldest first.
    pub fn list_builds(&self, engine_app: Uuid) -> Result<Vec<Build>> {
        let mut builds: Vec<Build> = crate::database::scan_prefix_models(&self.builds, &format!("{}/", engine_app))?;
        builds.sort_by_key(|build| build.created);
        Ok(builds)
    }

    /// Resolve the build a deploy request names.
    ///
    /// `branch` picks the newest build of the branch (optionally pinned to a
    /// revision); `image` matches an exact image ref; `build` an exact id.
    pub fn resolve_build(&self, engine_app: Uuid, version_type: &str, version_name: &str, revision: &str) -> Result<Build> {
        let builds = self.list_builds(engine_app)?;
        let found = match version_type {
            "branch" => builds
                .into_iter()
                .rev()
                .find(|build| build.branch == version_name && (revision.is_empty() || build.revision == revision)),
            "image" => builds.into_iter().rev().find(|build| build.image.as_deref() == Some(version_name)),
            "build" => version_name
                .parse::<Uuid>()
                .ok()
                .and_then(|id| builds.into_iter().find(|build| build.id == id)),
            _other => None,
        };
        found.ok_or_else(|| PlatformError::CannotGetRevision(format!("{} {} {}", version_type, version_name, revision)).into())
    }

    /// Fetch the recorded build with the given id.
    pub fn get_build(&self, engine_app: Uuid, build: Uuid) -> Result<Build> {
        let raw = self
            .builds
            .get(format!("{}/{}", engine_app, build).as_bytes())
            .context("error reading build")?
            .ok_or(PlatformError::ResourceMissing {
                kind: "Build".into(),
                name: build.to_string(),
            })?;
        decode_model(&raw)
    }

    /// Run a full build attempt for the given environment.
    ///
    /// Builder log lines are forwarded to `log_tx` as they arrive. On success
    /// a `Build` row is recorded and returned; on interruption the attempt is
    /// marked `interrupted`; all other terminal states mark it `failed`.
    #[tracing::instrument(level = "debug", skip(self, client, env, params, log_tx))]
    pub async fn build_source(&self, client: Client, env: &ModuleEnvironment, params: BuildParams, log_tx: mpsc::Sender<String>) -> Result<Build> {
        let wl_app = &env.engine_app;
        let procfile = validate_procfile(&params.procfile).map_err(anyhow::Error::from)?;
        if params.stream_channel_id.len() < STREAM_CHANNEL_ID_MIN_LEN {
            return Err(PlatformError::InvalidInput(format!(
                "stream_channel_id must be at least {} characters",
                STREAM_CHANNEL_ID_MIN_LEN
            ))
            .into());
        }

        // Verify the source tarball is fetchable before any cluster work.
        source::fetch_verified(&self.http, &params.source.url, &params.source.sha256)
            .await
            .context("error verifying source blob")?;

        let pod_name = utils::builder_pod_name(wl_app);
        let pods: ResourceClient<Pod> = ResourceClient::namespaced(client.clone(), &wl_app.namespace);

        // Refuse to launch while a previous builder is still active.
        match pods.get(&pod_name).await {
            Ok(existing) => {
                let phase = pod_phase(&existing);
                if phase == "Running" || phase == "Pending" {
                    return Err(PlatformError::ResourceDuplicate {
                        kind: "Pod".into(),
                        name: pod_name,
                    }
                    .into());
                }
                // A finished builder from an earlier attempt; clear it out.
                pods.delete(&pod_name, false).await?;
            }
            Err(err) if err.downcast_ref::<PlatformError>().map(PlatformError::is_not_found).unwrap_or(false) => (),
            Err(err) => return Err(err),
        }

        ensure_namespace(client.clone(), &wl_app.namespace).await?;
        k8s::wait_for_default_sa(
            client.clone(),
            &wl_app.namespace,
            Duration::from_secs(self.config.sa_wait_timeout_seconds),
            SA_CHECK_PERIOD,
        )
        .await?;

        let mut attempt = BuildProcess {
            id: Uuid::new_v4(),
            engine_app: wl_app.uuid,
            status: BuildStatus::Pending,
            build: None,
            source: params.source.clone(),
            extra_envs: params.extra_envs.clone(),
            builder_image: params.builder_image.clone(),
            buildpacks: params.buildpacks.clone(),
            stream_channel_id: params.stream_channel_id.clone(),
            created: Utc::now(),
        };
        self.save_attempt(&attempt)?;

        let pod = build_builder_pod(&pod_name, wl_app, &params, &self.config);
        pods.get_or_create(&pod_name, &pod).await.context("error creating builder pod")?;
        tracing::info!(pod = pod_name.as_str(), namespace = wl_app.namespace.as_str(), "builder pod launched");

        // Logs are not attachable while the pod is still Pending.
        let startup_res = k8s::wait_for_status(
            client.clone(),
            &pod_name,
            &["Running", "Succeeded", "Failed", "Unknown"],
            &wl_app.namespace,
            Duration::from_secs(self.config.build_timeout_seconds),
            BUILD_CHECK_PERIOD,
        )
        .await;

        let wait_res = match startup_res {
            Err(err) => Err(err),
            Ok(_phase) => {
                // Forward builder logs until the stream ends.
                let log_task = {
                    let (client, namespace, pod_name) = (client.clone(), wl_app.namespace.clone(), pod_name.clone());
                    tokio::spawn(async move {
                        use futures::StreamExt;
                        let stream = match k8s::pod_log_lines(client, &pod_name, &namespace, LogOptions::default()).await {
                            Ok(stream) => stream,
                            Err(err) => {
                                tracing::warn!(error = ?err, "error opening builder log stream");
                                return;
                            }
                        };
                        tokio::pin!(stream);
                        while let Some(line) = stream.next().await {
                            if log_tx.send(line).await.is_err() {
                                break; // Caller went away.
                            }
                        }
                    })
                };
                let res = wait_build_succeeded(
                    client.clone(),
                    &wl_app.namespace,
                    &pod_name,
                    Duration::from_secs(self.config.build_timeout_seconds),
                )
                .await;
                let _ = log_task.await;
                res
            }
        };

        match wait_res {
            Ok(()) => (),
            Err(err) => {
                let status = match err.downcast_ref::<PlatformError>() {
                    // The pod was deleted under us: an interruption.
                    Some(PlatformError::PodAbsent(_)) => BuildStatus::Interrupted,
                    _ => BuildStatus::Failed,
                };
                // A pod stuck past its deadline is left in place for forensic
                // inspection; other terminal pods are cleaned up.
                if status == BuildStatus::Failed && !matches!(err.downcast_ref::<PlatformError>(), Some(PlatformError::PodTimeout { .. })) {
                    let _ = pods.delete(&pod_name, false).await;
                }
                attempt.status = status;
                self.save_attempt(&attempt)?;
                metrics::increment_counter!(METRIC_BUILDS_FAILED);
                return Err(err);
            }
        }

        // Publish the produced artifact & record the build.
        let (slug_path, image) = self.publish_artifact(env, &params).await?;
        let build = Build {
            id: Uuid::new_v4(),
            engine_app: wl_app.uuid,
            slug_path,
            image,
            procfile,
            branch: params.branch.clone(),
            revision: params.revision.clone(),
            env_variables: params.extra_envs.clone(),
            created: Utc::now(),
        };
        self.builds
            .insert(format!("{}/{}", wl_app.uuid, build.id).as_bytes(), encode_model(&build)?)
            .context("error writing build record")?;
        attempt.status = BuildStatus::Successful;
        attempt.build = Some(build.id);
        self.save_attempt(&attempt)?;
        metrics::increment_counter!(METRIC_BUILDS_SUCCEEDED);

        // Terminal state observed and logs drained; clean the app's builder
        // pods up.
        if let Ok(pod) = pods.get(&pod_name).await {
            let phase = pod_phase(&pod);
            if phase != "Running" && phase != "Pending" {
                let selector = format!("{},{}=true", utils::app_label_selector(wl_app), utils::LABEL_BUILDER);
                pods.delete_individual(&selector, false).await?;
            }
        }

        tracing::info!(build = %build.id, "build recorded");
        Ok(build)
    }

    /// Delete the builder pod of the given engine app, if present.
    ///
    /// Reports whether the pod existed at the time of the call. The waiting
    /// build task observes the deletion and reports `interrupted`.
    #[tracing::instrument(level = "debug", skip(self, client, env))]
    pub async fn interrupt_build(&self, client: Client, env: &ModuleEnvironment) -> Result<bool> {
        let pod_name = utils::builder_pod_name(&env.engine_app);
        let pods: ResourceClient<Pod> = ResourceClient::namespaced(client, &env.engine_app.namespace);
        match pods.get(&pod_name).await {
            Ok(_pod) => {
                pods.delete(&pod_name, false).await?;
                tracing::info!(pod = pod_name.as_str(), "builder pod deleted on interrupt");
                Ok(true)
            }
            Err(err) if err.downcast_ref::<PlatformError>().map(PlatformError::is_not_found).unwrap_or(false) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn save_attempt(&self, attempt: &BuildProcess) -> Result<()> {
        self.build_processes
            .insert(format!("{}/{}", attempt.engine_app, attempt.id).as_bytes(), encode_model(attempt)?)
            .context("error writing build attempt")?;
        Ok(())
    }

    /// Publish the build output, returning `(slug_path, image)`.
    async fn publish_artifact(&self, env: &ModuleEnvironment, params: &BuildParams) -> Result<(Option<String>, Option<String>)> {
        match &params.artifact {
            BuildArtifact::Slug { path, get_url } => {
                let slug = source::fetch_blob(&self.http, get_url).await.context("error fetching produced slug")?;
                let repo = format!("{}-{}", env.application.code, env.module.name);
                let tag = params.revision.clone();
                let registry = Arc::clone(&self.registry);
                let image = retry_transient(
                    || async { registry.publish_slug(&repo, &tag, &slug).await },
                    |_err| true,
                )
                .await
                .context("error publishing slug image")?;
                Ok((Some(path.clone()), Some(image)))
            }
            BuildArtifact::Image { tag } => {
                // The CNB builder pushed the image itself; verify it landed.
                let repo = format!("{}-{}", env.application.code, env.module.name);
                let exists = self.registry.manifest_exists(&repo, tag).await.unwrap_or(false);
                if !exists {
                    tracing::warn!(tag = tag.as_str(), "produced image not yet visible in registry");
                }
                Ok((None, Some(tag.clone())))
            }
        }
    }
}

/// Poll the builder pod until it succeeds.
///
/// `Pending`/`Running` past the timeout fails with `PodTimeout`;
/// `Failed`/`Unknown` with `PodNotSucceeded`; an absent pod with `PodAbsent`.
pub async fn wait_build_succeeded(client: Client, namespace: &str, pod_name: &str, overall_timeout: Duration) -> Result<()> {
    let started = std::time::Instant::now();
    let pods: ResourceClient<Pod> = ResourceClient::namespaced(client, namespace);
    loop {
        let phase = match pods.get(pod_name).await {
            Ok(pod) => pod_phase(&pod),
            Err(err) if err.downcast_ref::<PlatformError>().map(PlatformError::is_not_found).unwrap_or(false) => {
                return Err(PlatformError::PodAbsent(pod_name.to_string()).into());
            }
            Err(err) => return Err(err),
        };
        match phase.as_str() {
            "Succeeded" => return Ok(()),
            "Failed" | "Unknown" => {
                return Err(PlatformError::PodNotSucceeded {
                    name: pod_name.to_string(),
                    phase,
                }
                .into());
            }
            _pending_or_running => {
                if started.elapsed() >= overall_timeout {
                    return Err(PlatformError::PodTimeout {
                        name: pod_name.to_string(),
                        elapsed_seconds: started.elapsed().as_secs(),
                    }
                    .into());
                }
            }
        }
        tokio::time::sleep(BUILD_CHECK_PERIOD).await;
    }
}

/// Encode the buildpack list for the `REQUIRED_BUILDPACKS` builder env var.
///
/// One `type name url version` clause per buildpack, `;`-joined.
pub fn encode_required_buildpacks(buildpacks: &[Buildpack]) -> String {
    buildpacks
        .iter()
        .map(|bp| {
            let kind = match bp.kind {
                BuildpackKind::Tar => "tar",
                BuildpackKind::Git => "git",
            };
            format!("{} {} {} {}", kind, bp.name, bp.url, bp.version)
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Build the builder pod manifest.
fn build_builder_pod(pod_name: &str, wl_app: &wharf_core::models::WlApp, params: &BuildParams, config: &Config) -> Pod {
    let mut pod = Pod::default();
    pod.meta_mut().name = Some(pod_name.to_string());
    pod.meta_mut().namespace = Some(wl_app.namespace.clone());
    let labels = pod.meta_mut().labels.get_or_insert_with(Default::default);
    utils::set_canonical_labels(labels, wl_app);
    labels.insert(utils::LABEL_BUILDER.into(), "true".into());

    let mut env = vec![
        EnvVar {
            name: "SOURCE_GET_URL".into(),
            value: Some(params.source.url.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "SOURCE_SHA256".into(),
            value: Some(params.source.sha256.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "REQUIRED_BUILDPACKS".into(),
            value: Some(encode_required_buildpacks(&params.buildpacks)),
            ..Default::default()
        },
    ];
    match &params.artifact {
        BuildArtifact::Slug { path, .. } => env.push(EnvVar {
            name: "SLUG_SET_PATH".into(),
            value: Some(path.clone()),
            ..Default::default()
        }),
        BuildArtifact::Image { tag } => env.push(EnvVar {
            name: "OUTPUT_IMAGE".into(),
            value: Some(tag.clone()),
            ..Default::default()
        }),
    }
    for (key, value) in &params.extra_envs {
        env.push(EnvVar {
            name: key.clone(),
            value: Some(value.clone()),
            ..Default::default()
        });
    }

    pod.spec = Some(PodSpec {
        restart_policy: Some("Never".into()),
        image_pull_secrets: Some(vec![LocalObjectReference {
            name: Some(config.builder_pull_secret.clone()),
        }]),
        containers: vec![Container {
            name: "builder".into(),
            image: Some(params.builder_image.clone()),
            image_pull_policy: Some("IfNotPresent".into()),
            env: Some(env),
            ..Default::default()
        }],
        ..Default::default()
    });
    pod
}

#[cfg(test)]
mod mod_test;
