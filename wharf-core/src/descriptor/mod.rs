//! Declarative app description loader.
//!
//! Parses a versioned YAML description into the internal desired-state struct
//! used by process-spec sync and release construction. The loader performs
//! schema validation and normalization only; it does no IO and never talks to
//! storage.
//!
//! Three wire formats are recognized, selected by `spec_version`. The split
//! here is deliberate: wire DTOs (`v1` / `v2` / `v3` modules), a pure
//! validation pass, and domain constructors producing [`AppDescription`].

mod wire;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crd::EnvOverlay;
use crate::models::{ProcessTmpl, ScalingConfig};
use crate::procfile::PROC_TYPE_PATTERN;
use crate::PlatformError;

/// Basic identity of the described application.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppBasicInfo {
    pub bk_app_code: String,
    pub bk_app_name: String,
}

/// The normalized description of one module.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModuleDescription {
    pub name: String,
    pub is_default: bool,
    pub language: String,
    #[serde(default)]
    pub source_origin: Option<String>,
    #[serde(default)]
    pub env_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub svc_discovery: Vec<String>,
    /// Process templates with lowercased names.
    pub processes: Vec<ProcessTmpl>,
    /// Environment overlay carried through to the cloud-native CRD; present
    /// for spec version 3 only.
    #[serde(default)]
    pub env_overlay: Option<EnvOverlay>,
}

/// The normalized, version-independent application description.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppDescription {
    pub spec_version: u8,
    pub app: AppBasicInfo,
    pub modules: Vec<ModuleDescription>,
}

impl AppDescription {
    /// Parse a YAML document into a normalized description.
    pub fn load(raw: &str) -> Result<Self, PlatformError> {
        let probe: wire::VersionProbe =
            serde_yaml::from_str(raw).map_err(|err| PlatformError::InvalidInput(format!("malformed app description: {}", err)))?;
        let desc = match probe.spec_version {
            1 => wire::load_v1(raw)?,
            2 => wire::load_v2(raw)?,
            3 => wire::load_v3(raw)?,
            other => {
                return Err(PlatformError::InvalidInput(format!("unsupported spec_version {}, expected 1, 2 or 3", other)));
            }
        };
        desc.validate()?;
        Ok(desc)
    }

    /// The default module of this description.
    pub fn default_module(&self) -> Option<&ModuleDescription> {
        self.modules.iter().find(|module| module.is_default).or_else(|| self.modules.first())
    }

    fn validate(&self) -> Result<(), PlatformError> {
        if self.modules.is_empty() {
            return Ok(());
        }
        if self.modules.iter().filter(|module| module.is_default).count() > 1 {
            return Err(PlatformError::InvalidInput("more than one module is marked as default".into()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for module in &self.modules {
            if !seen.insert(module.name.as_str()) {
                return Err(PlatformError::InvalidInput(format!("duplicate module name {}", module.name)));
            }
            for process in &module.processes {
                if !PROC_TYPE_PATTERN.is_match(&process.name) {
                    return Err(PlatformError::InvalidInput(format!(
                        "invalid process name {} in module {}",
                        process.name, module.name
                    )));
                }
                if let Some(config) = &process.scaling_config {
                    if config.min_replicas > config.max_replicas {
                        return Err(PlatformError::InvalidInput(format!(
                            "scaling config of process {} has min_replicas > max_replicas",
                            process.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Normalize a raw process entry into a template with a lowercased name.
#[allow(clippy::too_many_arguments)]
pub(crate) fn normalize_process(
    name: &str, command: Option<String>, command_parts: Vec<String>, args: Vec<String>, replicas: Option<u32>, port: Option<u16>, plan: Option<String>,
    autoscaling: bool, scaling_config: Option<ScalingConfig>,
) -> ProcessTmpl {
    ProcessTmpl {
        name: name.to_lowercase(),
        command,
        command_parts,
        args,
        replicas,
        port,
        plan,
        autoscaling,
        scaling_config,
    }
}

#[cfg(test)]
mod mod_test;
