//! Resource plans.
//!
//! A plan is a named, globally-scoped bundle of resource requests/limits and a
//! replica cap. Plans are not tenant-aware and are never deleted while in use.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::PlatformError;

/// The name of the plan used when nothing else is configured.
pub const PLAN_NAME_DEFAULT: &str = "default";

/// CPU and memory quantities for one side of a resource requirement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// CPU quantity, in millicores (`250m`) or whole cores (`4`).
    pub cpu: String,
    /// Memory quantity, in `Mi` or `Gi`.
    pub memory: String,
}

impl ResourceSpec {
    /// Validate both quantities, failing fast on malformed specs.
    pub fn validate(&self) -> Result<(), PlatformError> {
        parse_cpu_millis(&self.cpu)?;
        parse_memory_mib(&self.memory)?;
        Ok(())
    }
}

/// A named resource plan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    /// The cap applied to `target_replicas` of any spec referencing this plan.
    pub max_replicas: u32,
    pub limits: ResourceSpec,
    pub requests: ResourceSpec,
    pub is_active: bool,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Plan {
    /// Create a new plan, validating its resource quantities.
    pub fn new(name: impl Into<String>, max_replicas: u32, requests: ResourceSpec, limits: ResourceSpec) -> Result<Self, PlatformError> {
        requests.validate()?;
        limits.validate()?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            max_replicas,
            limits,
            requests,
            is_active: true,
            created: now,
            updated: now,
        })
    }
}

/// Parse a CPU quantity into millicores.
pub fn parse_cpu_millis(val: &str) -> Result<u64, PlatformError> {
    let err = || PlatformError::InvalidInput(format!("invalid cpu spec {}", val));
    if let Some(millis) = val.strip_suffix('m') {
        return millis.parse::<u64>().map_err(|_| err());
    }
    val.parse::<u64>().map(|cores| cores * 1000).map_err(|_| err())
}

/// Parse a memory quantity into MiB.
pub fn parse_memory_mib(val: &str) -> Result<u64, PlatformError> {
    let err = || PlatformError::InvalidInput(format!("invalid memory spec {}", val));
    if let Some(mib) = val.strip_suffix("Mi") {
        return mib.parse::<u64>().map_err(|_| err());
    }
    if let Some(gib) = val.strip_suffix("Gi") {
        return gib.parse::<u64>().map(|v| v * 1024).map_err(|_| err());
    }
    Err(err())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_quantities_parse() {
        assert_eq!(parse_cpu_millis("250m").unwrap(), 250);
        assert_eq!(parse_cpu_millis("4").unwrap(), 4000);
        assert!(parse_cpu_millis("4x").is_err());
        assert!(parse_cpu_millis("").is_err());
    }

    #[test]
    fn memory_quantities_parse() {
        assert_eq!(parse_memory_mib("512Mi").unwrap(), 512);
        assert_eq!(parse_memory_mib("2Gi").unwrap(), 2048);
        assert!(parse_memory_mib("512").is_err());
        assert!(parse_memory_mib("1Ti").is_err());
    }

    #[test]
    fn new_plan_rejects_malformed_quantities() {
        let bad = ResourceSpec { cpu: "two".into(), memory: "1Gi".into() };
        let good = ResourceSpec { cpu: "2".into(), memory: "1Gi".into() };
        assert!(Plan::new("starter", 5, bad, good).is_err());
    }
}
