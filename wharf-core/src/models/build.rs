//! Build records & build attempts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::procfile::Procfile;
use crate::PlatformError;

/// The terminal-or-pending status of a build attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Successful,
    Failed,
    Interrupted,
}

/// How a buildpack is distributed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildpackKind {
    Tar,
    Git,
}

/// One buildpack entry passed to a builder pod.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Buildpack {
    #[serde(rename = "type")]
    pub kind: BuildpackKind,
    pub name: String,
    pub url: String,
    pub version: String,
}

impl Buildpack {
    /// Parse a buildpack from its loosely-typed wire form, rejecting unknown kinds.
    pub fn parse(kind: &str, name: &str, url: &str, version: &str) -> Result<Self, PlatformError> {
        let kind = match kind {
            "tar" => BuildpackKind::Tar,
            "git" => BuildpackKind::Git,
            other => {
                return Err(PlatformError::InvalidInput(format!("invalid buildpack type {}, expected tar or git", other)));
            }
        };
        Ok(Self {
            kind,
            name: name.into(),
            url: url.into(),
            version: version.into(),
        })
    }
}

/// A pointer to a source tarball in the object store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceBlob {
    /// Blob-store path of the tarball.
    pub path: String,
    /// Hex SHA-256 of the tarball contents.
    pub sha256: String,
    /// Pre-signed URL used by the builder pod to fetch the tarball.
    pub url: String,
}

/// An immutable record of a completed build.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Build {
    pub id: Uuid,
    pub engine_app: Uuid,
    /// Blob-store path of the produced slug, for slug builds.
    #[serde(default)]
    pub slug_path: Option<String>,
    /// Registry reference of the produced image, for CNB builds.
    #[serde(default)]
    pub image: Option<String>,
    pub procfile: Procfile,
    pub branch: String,
    pub revision: String,
    #[serde(default)]
    pub env_variables: BTreeMap<String, String>,
    pub created: DateTime<Utc>,
}

/// A long-running build attempt.
///
/// At most one active attempt per engine app may exist; the caller enforces
/// this and the build subsystem assumes it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildProcess {
    pub id: Uuid,
    pub engine_app: Uuid,
    pub status: BuildStatus,
    /// The resulting build, once finished.
    #[serde(default)]
    pub build: Option<Uuid>,
    pub source: SourceBlob,
    #[serde(default)]
    pub extra_envs: BTreeMap<String, String>,
    /// Image of the builder to run.
    pub builder_image: String,
    #[serde(default)]
    pub buildpacks: Vec<Buildpack>,
    /// Channel key for streaming builder logs back to the caller.
    pub stream_channel_id: String,
    pub created: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buildpack_kinds_are_closed() {
        assert!(Buildpack::parse("tar", "bp", "https://x", "v1").is_ok());
        assert!(Buildpack::parse("git", "bp", "https://x", "v1").is_ok());
        assert!(Buildpack::parse("oci", "bp", "https://x", "v1").is_err());
        assert!(Buildpack::parse("", "bp", "https://x", "v1").is_err());
    }
}
