//! Wire-format DTOs for the versioned app description documents.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{normalize_process, AppBasicInfo, AppDescription, ModuleDescription};
use crate::crd::EnvOverlay;
use crate::models::{ProcessTmpl, ScalingConfig};
use crate::PlatformError;

/// Minimal probe used to dispatch on the document version.
#[derive(Debug, Deserialize)]
pub(super) struct VersionProbe {
    #[serde(default = "default_spec_version")]
    pub spec_version: u8,
}

fn default_spec_version() -> u8 {
    1
}

fn parse<T: DeserializeOwned>(raw: &str) -> Result<T, PlatformError> {
    serde_yaml::from_str(raw).map_err(|err| PlatformError::InvalidInput(format!("malformed app description: {}", err)))
}

/// A process entry given either as a bare command string or as a table.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProcessEntry {
    Command(String),
    Table(ProcessTable),
}

#[derive(Debug, Default, Deserialize)]
struct ProcessTable {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    replicas: Option<u32>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    plan: Option<String>,
    #[serde(default)]
    autoscaling: bool,
    #[serde(default)]
    scaling_config: Option<ScalingConfig>,
}

fn processes_from_map(map: BTreeMap<String, ProcessEntry>) -> Vec<ProcessTmpl> {
    map.into_iter()
        .map(|(name, entry)| match entry {
            ProcessEntry::Command(command) => normalize_process(&name, Some(command), vec![], vec![], None, None, None, false, None),
            ProcessEntry::Table(table) => normalize_process(
                &name,
                table.command,
                vec![],
                table.args,
                table.replicas,
                table.port,
                table.plan,
                table.autoscaling,
                table.scaling_config,
            ),
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct ProcessListEntry {
    name: String,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    replicas: Option<u32>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    plan: Option<String>,
    #[serde(default)]
    autoscaling: bool,
    #[serde(default)]
    scaling_config: Option<ScalingConfig>,
}

impl ProcessListEntry {
    fn normalize(self) -> ProcessTmpl {
        normalize_process(
            &self.name,
            self.command,
            vec![],
            self.args,
            self.replicas,
            self.port,
            self.plan,
            self.autoscaling,
            self.scaling_config,
        )
    }
}

#[derive(Debug, Default, Deserialize)]
struct EnvVarEntry {
    key: String,
    value: String,
}

fn env_map(entries: Vec<EnvVarEntry>) -> BTreeMap<String, String> {
    entries.into_iter().map(|entry| (entry.key, entry.value)).collect()
}

//////////////////////////////////////////////////////////////////////////////
// Version 1 /////////////////////////////////////////////////////////////////

/// Version 1: a flat single-module document with a process map.
#[derive(Debug, Deserialize)]
struct DocV1 {
    app_code: String,
    #[serde(default)]
    app_name: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    env_variables: Vec<EnvVarEntry>,
    #[serde(default)]
    processes: BTreeMap<String, ProcessEntry>,
}

pub(super) fn load_v1(raw: &str) -> Result<AppDescription, PlatformError> {
    let doc: DocV1 = parse(raw)?;
    let module = ModuleDescription {
        name: "default".into(),
        is_default: true,
        language: doc.language.unwrap_or_default(),
        source_origin: None,
        env_variables: env_map(doc.env_variables),
        svc_discovery: vec![],
        processes: processes_from_map(doc.processes),
        env_overlay: None,
    };
    Ok(AppDescription {
        spec_version: 1,
        app: AppBasicInfo {
            bk_app_name: doc.app_name.unwrap_or_else(|| doc.app_code.clone()),
            bk_app_code: doc.app_code,
        },
        modules: vec![module],
    })
}

//////////////////////////////////////////////////////////////////////////////
// Version 2 /////////////////////////////////////////////////////////////////

/// Version 2: `app` + a module map; a top-level process list belongs to the
/// default module.
#[derive(Debug, Deserialize)]
struct DocV2 {
    app: AppInfoV2,
    #[serde(default)]
    modules: BTreeMap<String, ModuleV2>,
    #[serde(default)]
    processes: Vec<ProcessListEntry>,
}

#[derive(Debug, Deserialize)]
struct AppInfoV2 {
    bk_app_code: String,
    #[serde(default)]
    bk_app_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ModuleV2 {
    #[serde(default)]
    is_default: bool,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    source_origin: Option<String>,
    #[serde(default)]
    env_variables: Vec<EnvVarEntry>,
    #[serde(default)]
    svc_discovery: SvcDiscoveryV2,
    #[serde(default)]
    processes: Vec<ProcessListEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct SvcDiscoveryV2 {
    #[serde(default)]
    bk_saas: Vec<String>,
}

pub(super) fn load_v2(raw: &str) -> Result<AppDescription, PlatformError> {
    let doc: DocV2 = parse(raw)?;
    let mut modules: Vec<ModuleDescription> = doc
        .modules
        .into_iter()
        .map(|(name, module)| ModuleDescription {
            name,
            is_default: module.is_default,
            language: module.language.unwrap_or_default(),
            source_origin: module.source_origin,
            env_variables: env_map(module.env_variables),
            svc_discovery: module.svc_discovery.bk_saas,
            processes: module.processes.into_iter().map(ProcessListEntry::normalize).collect(),
            env_overlay: None,
        })
        .collect();

    // A top-level process list applies to the default module.
    if !doc.processes.is_empty() {
        let top_level: Vec<ProcessTmpl> = doc.processes.into_iter().map(ProcessListEntry::normalize).collect();
        let target = modules
            .iter()
            .position(|module| module.is_default)
            .or(if modules.is_empty() { None } else { Some(0) });
        match target {
            Some(idx) if modules[idx].processes.is_empty() => modules[idx].processes = top_level,
            Some(_) => {
                return Err(PlatformError::InvalidInput(
                    "processes given both at the top level and inside the default module".into(),
                ));
            }
            None => modules.push(ModuleDescription {
                name: "default".into(),
                is_default: true,
                language: String::new(),
                source_origin: None,
                env_variables: Default::default(),
                svc_discovery: vec![],
                processes: top_level,
                env_overlay: None,
            }),
        }
    }

    Ok(AppDescription {
        spec_version: 2,
        app: AppBasicInfo {
            bk_app_name: doc.app.bk_app_name.unwrap_or_else(|| doc.app.bk_app_code.clone()),
            bk_app_code: doc.app.bk_app_code,
        },
        modules,
    })
}

//////////////////////////////////////////////////////////////////////////////
// Version 3 /////////////////////////////////////////////////////////////////

/// Version 3 (cloud-native): modules as a list, each carrying a `spec` block
/// whose shape mirrors the BkApp CRD, including `envOverlay`.
#[derive(Debug, Deserialize)]
struct DocV3 {
    app: AppInfoV2,
    #[serde(default)]
    modules: Vec<ModuleV3>,
}

#[derive(Debug, Deserialize)]
struct ModuleV3 {
    name: String,
    #[serde(default)]
    is_default: bool,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    source_origin: Option<String>,
    spec: ModuleSpecV3,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModuleSpecV3 {
    #[serde(default)]
    processes: Vec<ProcessV3>,
    #[serde(default)]
    configuration: ConfigurationV3,
    #[serde(default)]
    env_overlay: Option<EnvOverlay>,
    #[serde(default)]
    svc_discovery: SvcDiscoveryV3,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessV3 {
    name: String,
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    replicas: Option<u32>,
    #[serde(default)]
    target_port: Option<u16>,
    #[serde(default)]
    res_quota_plan: Option<String>,
    #[serde(default)]
    autoscaling: Option<AutoscalingV3>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AutoscalingV3 {
    min_replicas: u32,
    max_replicas: u32,
    #[serde(default)]
    policy: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigurationV3 {
    #[serde(default)]
    env: Vec<NameValueV3>,
}

#[derive(Debug, Deserialize)]
struct NameValueV3 {
    name: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SvcDiscoveryV3 {
    #[serde(default)]
    bk_saas: Vec<SvcDiscoveryEntryV3>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SvcDiscoveryEntryV3 {
    bk_app_code: String,
}

pub(super) fn load_v3(raw: &str) -> Result<AppDescription, PlatformError> {
    let doc: DocV3 = parse(raw)?;
    let modules = doc
        .modules
        .into_iter()
        .map(|module| ModuleDescription {
            name: module.name,
            is_default: module.is_default,
            language: module.language.unwrap_or_default(),
            source_origin: module.source_origin,
            env_variables: module
                .spec
                .configuration
                .env
                .into_iter()
                .map(|entry| (entry.name, entry.value))
                .collect(),
            svc_discovery: module.spec.svc_discovery.bk_saas.into_iter().map(|entry| entry.bk_app_code).collect(),
            processes: module
                .spec
                .processes
                .into_iter()
                .map(|process| {
                    let scaling_config = process.autoscaling.as_ref().map(|autoscaling| ScalingConfig {
                        min_replicas: autoscaling.min_replicas,
                        max_replicas: autoscaling.max_replicas,
                        metrics: autoscaling.policy.clone().into_iter().collect(),
                    });
                    normalize_process(
                        &process.name,
                        None,
                        process.command,
                        process.args,
                        process.replicas,
                        process.target_port,
                        process.res_quota_plan,
                        scaling_config.is_some(),
                        scaling_config,
                    )
                })
                .collect(),
            env_overlay: module.spec.env_overlay,
        })
        .collect();
    Ok(AppDescription {
        spec_version: 3,
        app: AppBasicInfo {
            bk_app_name: doc.app.bk_app_name.unwrap_or_else(|| doc.app.bk_app_code.clone()),
            bk_app_code: doc.app.bk_app_code,
        },
        modules,
    })
}
