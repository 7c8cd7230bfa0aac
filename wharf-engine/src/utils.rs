#![allow(dead_code)]

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};

use wharf_core::models::WlApp;

/// The app name used by the engine.
pub const APP_NAME: &str = "wharf-engine";

/// The canonical label carrying the engine-app name on managed objects.
pub const LABEL_APP: &str = "app";
/// The canonical label marking objects controlled by the engine.
pub const LABEL_CONTROLLED_BY: &str = "wharf.dev/controlled-by";
/// The canonical label carrying the process type of a workload.
pub const LABEL_PROCESS_TYPE: &str = "wharf.dev/process-type";
/// The canonical label carrying the release version of a workload.
pub const LABEL_RELEASE_VERSION: &str = "wharf.dev/release-version";
/// The canonical label marking builder pods.
pub const LABEL_BUILDER: &str = "wharf.dev/builder";

/// Set the canonical labels on an object controlled by the engine.
pub fn set_canonical_labels(labels: &mut BTreeMap<String, String>, wl_app: &WlApp) {
    labels.insert(LABEL_APP.into(), wl_app.scheduler_safe_name());
    labels.insert(LABEL_CONTROLLED_BY.into(), APP_NAME.into());
}

/// The label selector matching all managed workloads of the given engine app.
pub fn app_label_selector(wl_app: &WlApp) -> String {
    format!("{}={},{}={}", LABEL_APP, wl_app.scheduler_safe_name(), LABEL_CONTROLLED_BY, APP_NAME)
}

/// The current time in the RFC3339 form used for rollout-restart annotations.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// The normalized name of the builder pod for the given engine app.
///
/// Invalid characters are stripped and the result lowercased; the derivation
/// is injective because the underlying scheduler-safe name is.
pub fn builder_pod_name(wl_app: &WlApp) -> String {
    let safe = wl_app.scheduler_safe_name();
    let name: String = safe.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '-').collect();
    format!("slug-builder-{}", name)
}

/// Convert a nested mapping into the comma-joined dotted-path form used by
/// Kubernetes field selectors, e.g. `a.b.c=v1,a.b.d=v2`.
pub fn field_filter(fields: &serde_json::Value) -> String {
    let mut pairs = vec![];
    flatten_fields(fields, String::new(), &mut pairs);
    pairs.sort();
    pairs.join(",")
}

fn flatten_fields(val: &serde_json::Value, path: String, pairs: &mut Vec<String>) {
    match val {
        serde_json::Value::Object(map) => {
            for (key, nested) in map {
                let nested_path = if path.is_empty() { key.clone() } else { format!("{}.{}", path, key) };
                flatten_fields(nested, nested_path, pairs);
            }
        }
        leaf => {
            let rendered = match leaf {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            pairs.push(format!("{}={}", path, rendered));
        }
    }
}

/// Merge the given maps left to right, with later entries winning.
pub fn merge_maps(layers: &[&BTreeMap<String, String>]) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for layer in layers {
        for (key, value) in layer.iter() {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}
