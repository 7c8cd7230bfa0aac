//! Kubernetes client layer.
//!
//! Uniform, typed access to cluster resources regardless of API group or
//! version. All calls are wrapped in a client-side timeout, and failures are
//! mapped onto the platform error taxonomy at this boundary: 404s surface as
//! `ResourceMissing`, 409s as `ResourceDuplicate`, and everything else
//! propagates upward.

mod pods;

use std::fmt::Debug;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, ListParams, ObjectList, Patch, PatchParams, PostParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Error as WatcherError, Event};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::timeout;

use crate::error::{is_conflict, is_not_found, map_resource_err};

pub use pods::{
    default_sa_exists, get_pod_log, pod_log_lines, pod_phase, restart_deployment, restart_patch_body, wait_for_default_sa, wait_for_status, LogOptions,
    ANNOTATION_RESTARTED_AT,
};

/// The default timeout to use for API calls.
pub const API_TIMEOUT: Duration = Duration::from_secs(5);

type EventResult<T> = std::result::Result<Event<T>, WatcherError>;

/// How `replace_or_patch` applies the given body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateMethod {
    Replace,
    Patch,
}

/// The patch flavor used by [`ResourceClient::patch`].
#[derive(Clone, Debug)]
pub enum PatchBody {
    Strategic(serde_json::Value),
    Merge(serde_json::Value),
    Json(serde_json::Value),
}

/// A typed client for one namespaced resource kind.
pub struct ResourceClient<K> {
    api: Api<K>,
    kind: String,
}

impl<K> ResourceClient<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    K::DynamicType: Default,
{
    /// Create a new instance scoped to the given namespace.
    pub fn namespaced(client: Client, namespace: &str) -> Self {
        let kind = K::kind(&K::DynamicType::default()).to_string();
        Self {
            api: Api::namespaced(client, namespace),
            kind,
        }
    }

    /// Fetch the named resource, failing with `ResourceMissing` if absent.
    #[tracing::instrument(level = "debug", skip(self, name))]
    pub async fn get(&self, name: &str) -> Result<K> {
        timeout(API_TIMEOUT, self.api.get(name))
            .await
            .with_context(|| format!("timeout while fetching {}", self.kind))?
            .map_err(|err| map_resource_err(err, &self.kind, name))
    }

    /// Fetch the named resource, creating it from the given body if absent.
    ///
    /// Idempotent. The boolean indicates whether a create happened.
    #[tracing::instrument(level = "debug", skip(self, name, body))]
    pub async fn get_or_create(&self, name: &str, body: &K) -> Result<(K, bool)> {
        match timeout(API_TIMEOUT, self.api.get(name))
            .await
            .with_context(|| format!("timeout while fetching {}", self.kind))?
        {
            Ok(obj) => Ok((obj, false)),
            Err(err) if is_not_found(&err) => {
                let res = timeout(API_TIMEOUT, self.api.create(&PostParams::default(), body))
                    .await
                    .with_context(|| format!("timeout while creating {}", self.kind))?;
                match res {
                    Ok(obj) => Ok((obj, true)),
                    // Lost a race with a concurrent creator; the object exists now.
                    Err(err) if is_conflict(&err) => {
                        let obj = self.get(name).await?;
                        Ok((obj, false))
                    }
                    Err(err) => Err(err).with_context(|| format!("error creating {}", self.kind)),
                }
            }
            Err(err) => Err(err).with_context(|| format!("error fetching {}", self.kind)),
        }
    }

    /// Create the named resource, replacing it if it already exists.
    ///
    /// Re-reads the live object on conflict so the replace carries the most
    /// recent resource version.
    #[tracing::instrument(level = "debug", skip(self, name, body))]
    pub async fn create_or_update(&self, name: &str, body: &K) -> Result<(K, bool)> {
        let res = timeout(API_TIMEOUT, self.api.create(&PostParams::default(), body))
            .await
            .with_context(|| format!("timeout while creating {}", self.kind))?;
        match res {
            Ok(obj) => Ok((obj, true)),
            Err(err) if is_conflict(&err) => {
                let existing = self.get(name).await?;
                let mut body = body.clone();
                body.meta_mut().resource_version = existing.meta().resource_version.clone();
                let obj = timeout(API_TIMEOUT, self.api.replace(name, &PostParams::default(), &body))
                    .await
                    .with_context(|| format!("timeout while replacing {}", self.kind))?
                    .with_context(|| format!("error replacing {}", self.kind))?;
                Ok((obj, false))
            }
            Err(err) => Err(err).with_context(|| format!("error creating {}", self.kind)),
        }
    }

    /// Update the named resource with the given body, by full replace or by
    /// merge patch.
    #[tracing::instrument(level = "debug", skip(self, name, body))]
    pub async fn replace_or_patch(&self, name: &str, body: &K, update_method: UpdateMethod) -> Result<K> {
        match update_method {
            UpdateMethod::Replace => {
                let existing = self.get(name).await?;
                let mut body = body.clone();
                body.meta_mut().resource_version = existing.meta().resource_version.clone();
                timeout(API_TIMEOUT, self.api.replace(name, &PostParams::default(), &body))
                    .await
                    .with_context(|| format!("timeout while replacing {}", self.kind))?
                    .map_err(|err| map_resource_err(err, &self.kind, name))
            }
            UpdateMethod::Patch => {
                let body = serde_json::to_value(body).context("error serializing patch body")?;
                self.patch(name, PatchBody::Merge(body)).await
            }
        }
    }

    /// Patch the named resource.
    #[tracing::instrument(level = "debug", skip(self, name, patch))]
    pub async fn patch(&self, name: &str, patch: PatchBody) -> Result<K> {
        let params = PatchParams::default();
        let res = match patch {
            PatchBody::Strategic(body) => timeout(API_TIMEOUT, self.api.patch(name, &params, &Patch::Strategic(body))).await,
            PatchBody::Merge(body) => timeout(API_TIMEOUT, self.api.patch(name, &params, &Patch::Merge(body))).await,
            PatchBody::Json(body) => {
                let ops: json_patch::Patch = serde_json::from_value(body).context("error building JSON patch")?;
                timeout(API_TIMEOUT, self.api.patch(name, &params, &Patch::Json::<()>(ops))).await
            }
        };
        res.with_context(|| format!("timeout while patching {}", self.kind))?
            .map_err(|err| map_resource_err(err, &self.kind, name))
    }

    /// Delete the named resource.
    ///
    /// Silent on absence by default; pass `raise_if_non_exists` to surface a
    /// `ResourceMissing` instead.
    #[tracing::instrument(level = "debug", skip(self, name))]
    pub async fn delete(&self, name: &str, raise_if_non_exists: bool) -> Result<()> {
        let res = timeout(API_TIMEOUT, self.api.delete(name, &DeleteParams::default()))
            .await
            .with_context(|| format!("timeout while deleting {}", self.kind))?;
        match res {
            Ok(_val) => Ok(()),
            Err(err) if is_not_found(&err) && !raise_if_non_exists => Ok(()),
            Err(err) => Err(map_resource_err(err, &self.kind, name)),
        }
    }

    /// List resources matching the given label selector.
    #[tracing::instrument(level = "debug", skip(self, labels))]
    pub async fn list(&self, labels: &str) -> Result<ObjectList<K>> {
        let params = ListParams {
            label_selector: Some(labels.to_string()),
            ..Default::default()
        };
        timeout(API_TIMEOUT, self.api.list(&params))
            .await
            .with_context(|| format!("timeout while listing {}", self.kind))?
            .with_context(|| format!("error listing {}", self.kind))
    }

    /// Delete all resources matching the given label selector in one call.
    #[tracing::instrument(level = "debug", skip(self, labels))]
    pub async fn delete_collection(&self, labels: &str) -> Result<()> {
        let params = ListParams {
            label_selector: Some(labels.to_string()),
            ..Default::default()
        };
        timeout(API_TIMEOUT, self.api.delete_collection(&DeleteParams::default(), &params))
            .await
            .with_context(|| format!("timeout while deleting {} collection", self.kind))?
            .with_context(|| format!("error deleting {} collection", self.kind))
            .map(|_| ())
    }

    /// Delete matching resources one by one, optionally without a grace period.
    #[tracing::instrument(level = "debug", skip(self, labels))]
    pub async fn delete_individual(&self, labels: &str, non_grace_period: bool) -> Result<()> {
        let params = if non_grace_period {
            DeleteParams {
                grace_period_seconds: Some(0),
                ..Default::default()
            }
        } else {
            DeleteParams::default()
        };
        let list = self.list(labels).await?;
        for obj in list {
            let name = match obj.meta().name.as_deref() {
                Some(name) => name.to_string(),
                None => continue,
            };
            let res = timeout(API_TIMEOUT, self.api.delete(&name, &params))
                .await
                .with_context(|| format!("timeout while deleting {}", self.kind))?;
            match res {
                Ok(_val) => (),
                Err(err) if is_not_found(&err) => (),
                Err(err) => return Err(map_resource_err(err, &self.kind, &name)),
            }
        }
        Ok(())
    }

    /// Create a finite watch stream of events for matching resources.
    ///
    /// The stream is lazy and is cancelled by dropping it.
    pub fn create_watch_stream(&self, labels: &str, timeout_seconds: Option<u32>) -> impl futures::Stream<Item = EventResult<K>>
    where
        K: Send + 'static,
    {
        let params = ListParams {
            label_selector: Some(labels.to_string()),
            timeout: timeout_seconds,
            ..Default::default()
        };
        watcher(self.api.clone(), params)
    }
}

/// Ensure the given namespace exists, creating it as needed.
#[tracing::instrument(level = "debug", skip(client, name))]
pub async fn ensure_namespace(client: Client, name: &str) -> Result<Namespace> {
    let api: Api<Namespace> = Api::all(client);
    match timeout(API_TIMEOUT, api.get(name)).await.context("timeout while fetching namespace")? {
        Ok(ns) => Ok(ns),
        Err(err) if is_not_found(&err) => {
            let mut ns = Namespace::default();
            ns.meta_mut().name = Some(name.to_string());
            let res = timeout(API_TIMEOUT, api.create(&PostParams::default(), &ns))
                .await
                .context("timeout while creating namespace")?;
            match res {
                Ok(ns) => {
                    tracing::info!(namespace = name, "created namespace");
                    Ok(ns)
                }
                Err(err) if is_conflict(&err) => timeout(API_TIMEOUT, api.get(name))
                    .await
                    .context("timeout while fetching namespace")?
                    .context("error fetching namespace"),
                Err(err) => Err(err).context("error creating namespace"),
            }
        }
        Err(err) => Err(err).context("error fetching namespace"),
    }
}
