//! Process specs: the persistent desired state for named processes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The desired serving status of a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Start,
    Stop,
}

/// Autoscaling settings attached to a process spec.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScalingConfig {
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Metric names driving the autoscaler, e.g. `cpu`.
    #[serde(default)]
    pub metrics: Vec<String>,
}

/// The persistent desired state for one process type of one engine app.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub id: Uuid,
    pub engine_app: Uuid,
    /// Lowercased process type name.
    pub name: String,
    /// The one-line startup command, when sourced from a procfile.
    #[serde(default)]
    pub proc_command: Option<String>,
    /// Structured command & args, when sourced from a cloud-native description.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub port: Option<u16>,
    pub target_replicas: u32,
    pub target_status: TargetStatus,
    /// Name of the referenced plan.
    pub plan: String,
    #[serde(default)]
    pub autoscaling: bool,
    #[serde(default)]
    pub scaling_config: Option<ScalingConfig>,
    pub tenant_id: String,
}

/// The replica count which drives all downstream workloads.
///
/// Zero iff the target status is `stop`, otherwise the target replicas.
pub fn computed_replicas(spec: &ProcessSpec) -> u32 {
    match spec.target_status {
        TargetStatus::Stop => 0,
        TargetStatus::Start => spec.target_replicas,
    }
}

/// A normalized process template, the input unit of the process-spec store.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProcessTmpl {
    pub name: String,
    /// The one-line startup command, procfile style.
    #[serde(default)]
    pub command: Option<String>,
    /// Structured command parts, used by cloud-native descriptions.
    #[serde(default)]
    pub command_parts: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub replicas: Option<u32>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub autoscaling: bool,
    #[serde(default)]
    pub scaling_config: Option<ScalingConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(target_replicas: u32, target_status: TargetStatus) -> ProcessSpec {
        ProcessSpec {
            id: Uuid::new_v4(),
            engine_app: Uuid::new_v4(),
            name: "web".into(),
            proc_command: Some("python app.py".into()),
            command: vec![],
            args: vec![],
            port: Some(5000),
            target_replicas,
            target_status,
            plan: "default".into(),
            autoscaling: false,
            scaling_config: None,
            tenant_id: "default".into(),
        }
    }

    #[test]
    fn computed_replicas_is_zero_iff_stopped() {
        assert_eq!(computed_replicas(&spec(3, TargetStatus::Stop)), 0);
        assert_eq!(computed_replicas(&spec(3, TargetStatus::Start)), 3);
        assert_eq!(computed_replicas(&spec(0, TargetStatus::Start)), 0);
    }
}
