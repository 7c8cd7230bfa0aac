//! Procfile parsing & validation.
//!
//! A procfile is a map of process-type -> startup command, carried by a Build
//! and used to materialize workload manifests.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::Regex;

use crate::PlatformError;

lazy_static! {
    /// Pattern which all process type names must match.
    pub static ref PROC_TYPE_PATTERN: Regex = Regex::new(r"^[a-zA-Z0-9]+(-[a-zA-Z0-9]+)*$").expect("invalid proc type pattern");
}

/// A map of process-type -> startup command.
pub type Procfile = BTreeMap<String, String>;

/// Validate the given procfile, returning a copy with lowercased keys.
///
/// Keys must match `PROC_TYPE_PATTERN` and values must be non-empty.
pub fn validate_procfile(procfile: &Procfile) -> Result<Procfile, PlatformError> {
    let mut validated = Procfile::new();
    for (proc_type, command) in procfile {
        if !PROC_TYPE_PATTERN.is_match(proc_type) {
            return Err(PlatformError::InvalidInput(format!(
                "invalid proc type {}, must match {}",
                proc_type,
                PROC_TYPE_PATTERN.as_str()
            )));
        }
        if command.trim().is_empty() {
            return Err(PlatformError::InvalidInput(format!("proc type {} has an empty command", proc_type)));
        }
        validated.insert(proc_type.to_lowercase(), command.clone());
    }
    Ok(validated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_well_formed_types() {
        let mut procfile = Procfile::new();
        procfile.insert("web".into(), "python app.py".into());
        procfile.insert("celery-worker".into(), "celery -A app worker".into());
        let validated = validate_procfile(&procfile).expect("expected procfile to validate");
        assert_eq!(validated.len(), 2);
    }

    #[test]
    fn validate_lowercases_keys() {
        let mut procfile = Procfile::new();
        procfile.insert("Web".into(), "python app.py".into());
        let validated = validate_procfile(&procfile).expect("expected procfile to validate");
        assert!(validated.contains_key("web"), "expected key to be lowercased, got {:?}", validated);
    }

    #[test]
    fn validate_rejects_bad_type_names() {
        for bad in ["-web", "web-", "we_b", "web--api", ""] {
            let mut procfile = Procfile::new();
            procfile.insert(bad.into(), "run".into());
            assert!(validate_procfile(&procfile).is_err(), "expected proc type {:?} to be rejected", bad);
        }
    }

    #[test]
    fn validate_rejects_empty_commands() {
        let mut procfile = Procfile::new();
        procfile.insert("web".into(), "  ".into());
        assert!(validate_procfile(&procfile).is_err(), "expected empty command to be rejected");
    }
}
