//! Container registry access via the V2 HTTP API.
//!
//! Uploads follow the chunked flow: initiate upload, patch chunks, commit
//! with digest, verify via HEAD. Transient failures are retried by callers.

use anyhow::{bail, Context, Result};
use reqwest::StatusCode;

use crate::build::source::sha256_hex;
use crate::config::RegistryConfig;

/// The media type used for slug layer blobs.
const MEDIA_TYPE_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
/// The media type used for image config blobs.
const MEDIA_TYPE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
/// The media type used for image manifests.
const MEDIA_TYPE_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// A client for one configured registry.
pub struct RegistryClient {
    config: RegistryConfig,
    http: reqwest::Client,
}

impl RegistryClient {
    /// Create a new instance.
    pub fn new(config: RegistryConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    /// The image tag encoding an application build: `{code}/{module}:v{version}`.
    pub fn image_tag_for(&self, app_code: &str, module: &str, version: u64) -> String {
        format!("{}/{}/{}-{}:v{}", self.config.host, self.config.namespace, app_code, module, version)
    }

    fn repo_url(&self, repo: &str) -> String {
        format!("https://{}/v2/{}/{}", self.config.host, self.config.namespace, repo)
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match (&self.config.username, &self.config.password) {
            (Some(user), Some(pass)) => req.basic_auth(user, Some(pass)),
            _ => req,
        }
    }

    /// Whether the blob with the given digest exists in the repo.
    pub async fn blob_exists(&self, repo: &str, digest: &str) -> Result<bool> {
        let url = format!("{}/blobs/{}", self.repo_url(repo), digest);
        let res = self.with_auth(self.http.head(&url)).send().await.context("error checking blob")?;
        Ok(res.status() == StatusCode::OK)
    }

    /// Upload a blob, returning its `sha256:` digest reference.
    ///
    /// Idempotent: an existing blob is verified via HEAD and not re-uploaded.
    #[tracing::instrument(level = "debug", skip(self, repo, data))]
    pub async fn push_blob(&self, repo: &str, data: &[u8]) -> Result<String> {
        let digest = format!("sha256:{}", sha256_hex(data));
        if self.blob_exists(repo, &digest).await? {
            return Ok(digest);
        }

        // Initiate the upload session.
        let url = format!("{}/blobs/uploads/", self.repo_url(repo));
        let res = self.with_auth(self.http.post(&url)).send().await.context("error initiating blob upload")?;
        if res.status() != StatusCode::ACCEPTED {
            bail!("unexpected status {} initiating blob upload", res.status());
        }
        let location = upload_location(&res, &self.config.host)?;

        // Patch the content as a single chunk.
        let res = self
            .with_auth(self.http.patch(&location))
            .header("content-type", "application/octet-stream")
            .body(data.to_vec())
            .send()
            .await
            .context("error patching blob chunk")?;
        if res.status() != StatusCode::ACCEPTED {
            bail!("unexpected status {} patching blob chunk", res.status());
        }
        let location = upload_location(&res, &self.config.host)?;

        // Commit the upload with the digest.
        let sep = if location.contains('?') { '&' } else { '?' };
        let commit_url = format!("{}{}digest={}", location, sep, digest);
        let res = self.with_auth(self.http.put(&commit_url)).send().await.context("error committing blob upload")?;
        if res.status() != StatusCode::CREATED {
            bail!("unexpected status {} committing blob upload", res.status());
        }

        // Verify the committed blob.
        if !self.blob_exists(repo, &digest).await? {
            bail!("blob {} missing after commit", digest);
        }
        Ok(digest)
    }

    /// Publish a slug artifact as a single-layer image under the given tag.
    #[tracing::instrument(level = "debug", skip(self, repo, tag, slug))]
    pub async fn publish_slug(&self, repo: &str, tag: &str, slug: &[u8]) -> Result<String> {
        let layer_digest = self.push_blob(repo, slug).await?;
        let config_body = serde_json::to_vec(&serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": { "type": "layers", "diff_ids": [layer_digest] },
        }))
        .context("error serializing image config")?;
        let config_digest = self.push_blob(repo, &config_body).await?;

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_MANIFEST,
            "config": { "mediaType": MEDIA_TYPE_CONFIG, "size": config_body.len(), "digest": config_digest },
            "layers": [ { "mediaType": MEDIA_TYPE_LAYER, "size": slug.len(), "digest": layer_digest } ],
        });
        let url = format!("{}/manifests/{}", self.repo_url(repo), tag);
        let res = self
            .with_auth(self.http.put(&url))
            .header("content-type", MEDIA_TYPE_MANIFEST)
            .json(&manifest)
            .send()
            .await
            .context("error pushing manifest")?;
        if res.status() != StatusCode::CREATED {
            bail!("unexpected status {} pushing manifest", res.status());
        }

        if !self.manifest_exists(repo, tag).await? {
            bail!("manifest {} missing after push", tag);
        }
        Ok(format!("{}/{}/{}:{}", self.config.host, self.config.namespace, repo, tag))
    }

    /// Whether the manifest with the given tag exists in the repo.
    pub async fn manifest_exists(&self, repo: &str, tag: &str) -> Result<bool> {
        let url = format!("{}/manifests/{}", self.repo_url(repo), tag);
        let res = self
            .with_auth(self.http.head(&url))
            .header("accept", MEDIA_TYPE_MANIFEST)
            .send()
            .await
            .context("error checking manifest")?;
        Ok(res.status() == StatusCode::OK)
    }
}

/// Extract the upload location of the given response, making it absolute.
fn upload_location(res: &reqwest::Response, host: &str) -> Result<String> {
    let location = res
        .headers()
        .get("location")
        .and_then(|val| val.to_str().ok())
        .context("registry response carried no upload location")?;
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(location.to_string())
    } else {
        Ok(format!("https://{}{}", host, location))
    }
}
