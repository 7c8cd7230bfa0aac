//! Releases & release attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Build, ProcessSpec};
use crate::procfile::Procfile;

/// An immutable release artifact pairing a build with a version number.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Release {
    pub id: Uuid,
    pub engine_app: Uuid,
    /// Monotonically increasing per engine app.
    pub version: u64,
    pub build: Uuid,
    pub failed: bool,
    #[serde(default)]
    pub summary: Option<String>,
    pub created: DateTime<Utc>,
}

impl Release {
    /// The proc-type -> command map used to materialize manifests.
    ///
    /// The build's procfile wins; process specs carrying a `proc_command`
    /// fill in any types the build left out.
    pub fn get_procfile(&self, build: &Build, specs: &[ProcessSpec]) -> Procfile {
        let mut procfile = build.procfile.clone();
        for spec in specs {
            if procfile.contains_key(&spec.name) {
                continue;
            }
            if let Some(command) = &spec.proc_command {
                procfile.insert(spec.name.clone(), command.clone());
            }
        }
        procfile
    }
}

/// The phase of an in-flight release attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleasePhase {
    Pending,
    Preparing,
    PreparingFailed,
    Releasing,
    Polling,
    Skipped,
    Released,
    ReleasedFailed,
    Interrupted,
}

impl ReleasePhase {
    /// Whether this phase is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PreparingFailed | Self::Released | Self::ReleasedFailed | Self::Interrupted
        )
    }
}

/// A release attempt coordinated per (application, module, environment).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    /// The `release_key` of the target environment.
    pub env_key: String,
    pub engine_app: Uuid,
    pub release: Uuid,
    pub phase: ReleasePhase,
    /// The cancellation channel of this release: once set, the next poll tick
    /// observes it and transitions to `interrupted`.
    #[serde(default)]
    pub release_int_requested_at: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
}

/// Status of a cloud-native model deploy, mapped from CRD conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployStatus {
    Pending,
    Progressing,
    Ready,
    Error,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TargetStatus;
    use std::collections::BTreeMap;

    #[test]
    fn procfile_prefers_build_entries_and_falls_back_to_specs() {
        let engine_app = Uuid::new_v4();
        let mut build_procfile = BTreeMap::new();
        build_procfile.insert("web".to_string(), "python app.py".to_string());
        let build = Build {
            id: Uuid::new_v4(),
            engine_app,
            slug_path: Some("apps/demo/slug.tgz".into()),
            image: None,
            procfile: build_procfile,
            branch: "main".into(),
            revision: "3f2a1c9".into(),
            env_variables: Default::default(),
            created: Utc::now(),
        };
        let release = Release {
            id: Uuid::new_v4(),
            engine_app,
            version: 1,
            build: build.id,
            failed: false,
            summary: None,
            created: Utc::now(),
        };
        let specs = vec![
            ProcessSpec {
                id: Uuid::new_v4(),
                engine_app,
                name: "web".into(),
                proc_command: Some("overridden".into()),
                command: vec![],
                args: vec![],
                port: None,
                target_replicas: 1,
                target_status: TargetStatus::Start,
                plan: "default".into(),
                autoscaling: false,
                scaling_config: None,
                tenant_id: "default".into(),
            },
            ProcessSpec {
                id: Uuid::new_v4(),
                engine_app,
                name: "worker".into(),
                proc_command: Some("celery -A app worker".into()),
                command: vec![],
                args: vec![],
                port: None,
                target_replicas: 1,
                target_status: TargetStatus::Start,
                plan: "default".into(),
                autoscaling: false,
                scaling_config: None,
                tenant_id: "default".into(),
            },
        ];

        let procfile = release.get_procfile(&build, &specs);
        assert_eq!(procfile.get("web").map(String::as_str), Some("python app.py"), "build entry must win");
        assert_eq!(procfile.get("worker").map(String::as_str), Some("celery -A app worker"));
    }
}

/// One row per attempted CRD apply for cloud-native applications.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppModelDeploy {
    pub id: Uuid,
    pub application: String,
    pub module: String,
    pub environment: String,
    pub status: DeployStatus,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}
