//! Application, module & engine-app handles.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::plan::ResourceSpec;

/// The application type, which selects the release path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppType {
    Default,
    CloudNative,
}

impl Default for AppType {
    fn default() -> Self {
        Self::Default
    }
}

/// A deployment environment of a module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Stag,
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stag => "stag",
            Self::Prod => "prod",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A read-only handle to an application owned by an external collaborator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Application {
    /// Stable, URL-safe application code.
    pub code: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub app_type: AppType,
    pub tenant_id: String,
    pub creator: String,
    /// Legacy partition tag.
    pub region: String,
}

/// A sub-unit of an application.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub source_origin: String,
    pub language: String,
}

/// The pair of a module and an environment name; owns exactly one engine app.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModuleEnvironment {
    pub application: Application,
    pub module: Module,
    pub environment: Environment,
    pub engine_app: WlApp,
}

impl ModuleEnvironment {
    /// The key identifying this environment for release coordination.
    pub fn release_key(&self) -> String {
        format!("{}/{}/{}", self.application.code, self.module.name, self.environment)
    }
}

/// The cluster-facing workload identity bound to one module environment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WlApp {
    pub uuid: Uuid,
    /// The raw engine-app name; may contain underscores and mixed case.
    pub name: String,
    pub namespace: String,
    /// The current cluster binding, if any.
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(rename = "type", default)]
    pub app_type: AppType,
    pub region: String,
    pub tenant_id: String,
}

impl WlApp {
    /// The scheduler-safe name of this engine app.
    ///
    /// Lowercased, with underscores replaced by the `0us0` marker so the
    /// derivation stays injective.
    pub fn scheduler_safe_name(&self) -> String {
        self.name.to_lowercase().replace('_', "0us0")
    }
}

/// A versioned snapshot of an engine app's runtime settings.
///
/// Appended, never updated in place; "current" means most recent.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub version: u64,
    #[serde(default)]
    pub env_variables: BTreeMap<String, String>,
    /// Resource requirement overrides keyed by process type.
    #[serde(default)]
    pub resource_requirements: BTreeMap<String, ResourceSpec>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    /// Tolerations overlay, kept as raw values and deserialized on the K8s boundary.
    #[serde(default)]
    pub tolerations: Vec<serde_json::Value>,
    #[serde(default)]
    pub runtime: RuntimeSpec,
}

/// Container runtime settings of a config snapshot.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RuntimeSpec {
    /// The container entrypoint.
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub image_pull_policy: Option<String>,
    #[serde(default)]
    pub image_pull_secrets: Vec<String>,
}

impl RuntimeSpec {
    /// Resolve the container args for the given process type from a procfile.
    pub fn command_for(&self, process_type: &str, procfile: &crate::procfile::Procfile) -> Vec<String> {
        procfile
            .get(process_type)
            .map(|command| command.split_whitespace().map(String::from).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wl_app(name: &str) -> WlApp {
        WlApp {
            uuid: Uuid::new_v4(),
            name: name.into(),
            namespace: "bkapp-demo-stag".into(),
            cluster: None,
            app_type: AppType::Default,
            region: "default".into(),
            tenant_id: "default".into(),
        }
    }

    #[test]
    fn scheduler_safe_name_is_injective_for_underscores() {
        let a = wl_app("demo_app");
        let b = wl_app("demo-app");
        assert_eq!(a.scheduler_safe_name(), "demo0us0app");
        assert_ne!(a.scheduler_safe_name(), b.scheduler_safe_name());
    }

    #[test]
    fn scheduler_safe_name_lowercases() {
        assert_eq!(wl_app("Demo_App").scheduler_safe_name(), "demo0us0app");
    }
}
