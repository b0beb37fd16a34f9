//! Job option building.
//!
//! Each automation mode carries a default mapping from payload paths to job
//! option names; a dynamic override mapping (from configuration) layers on
//! top. Option names are sanitized to a conservative identifier charset
//! before they reach the job runner.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::event::AutomationMode;
use crate::fields::{normalize_custom_fields, resolve, sanitize_option_key, value_to_string};

/// Prefix for options injected by the pass-all custom-field flag.
const PASS_ALL_PREFIX: &str = "cf_";

/// Errors from option building.
#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    /// The payload root was not a JSON object.
    #[error("payload root is not a JSON object")]
    PayloadShape,
}

/// Path-to-option mappings for both automation modes.
#[derive(Debug, Clone)]
pub struct OptionMaps {
    /// Default mapping for diagnosis jobs.
    pub diagnosis_defaults: BTreeMap<String, String>,
    /// Default mapping for remediation jobs.
    pub remediation_defaults: BTreeMap<String, String>,
    /// Dynamic overrides applied on top of the mode defaults.
    pub overrides: BTreeMap<String, String>,
    /// When set, remaining custom fields are injected under a `cf_` prefix.
    pub pass_all_custom_fields: bool,
}

impl Default for OptionMaps {
    fn default() -> Self {
        let diagnosis_defaults = BTreeMap::from([(
            "data.custom_fields.environment_orn".to_string(),
            "env_orn".to_string(),
        )]);
        let remediation_defaults = BTreeMap::from([
            (
                "data.custom_fields.environment_orn".to_string(),
                "env_orn".to_string(),
            ),
            ("data.custom_fields.asset".to_string(), "asset".to_string()),
        ]);
        Self {
            diagnosis_defaults,
            remediation_defaults,
            overrides: BTreeMap::new(),
            pass_all_custom_fields: false,
        }
    }
}

impl OptionMaps {
    /// Returns the merged path→option mapping for a mode (overrides win).
    #[must_use]
    pub fn merged(&self, mode: AutomationMode) -> BTreeMap<String, String> {
        let mut merged = match mode {
            AutomationMode::Diagnosis => self.diagnosis_defaults.clone(),
            AutomationMode::Remediation => self.remediation_defaults.clone(),
        };
        merged.extend(self.overrides.clone());
        merged
    }
}

/// Builds the job option set for a payload and mode.
///
/// Every source path in the merged mapping is resolved via the field
/// resolver; absent paths are skipped. When the pass-all flag is enabled,
/// remaining custom fields are injected as `cf_<sanitized slug>` unless the
/// option name is already taken.
///
/// # Errors
///
/// Returns [`OptionsError::PayloadShape`] if the payload root is not an
/// object.
pub fn build_options(
    payload: &Value,
    mode: AutomationMode,
    maps: &OptionMaps,
) -> Result<BTreeMap<String, String>, OptionsError> {
    if !payload.is_object() {
        return Err(OptionsError::PayloadShape);
    }

    let mut options = BTreeMap::new();
    for (source, dest) in maps.merged(mode) {
        if let Some(value) = resolve(payload, &source) {
            let key = sanitize_option_key(&dest);
            tracing::debug!(source = %source, dest = %key, mode = %mode, "option mapped");
            options.insert(key, value_to_string(&value));
        }
    }

    if maps.pass_all_custom_fields {
        let fields = payload
            .get("data")
            .and_then(|data| data.get("custom_fields"))
            .map(normalize_custom_fields)
            .unwrap_or_default();
        for (slug, value) in fields {
            let key = format!("{PASS_ALL_PREFIX}{}", sanitize_option_key(&slug));
            options.entry(key).or_insert(value);
        }
    }

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Value {
        json!({
            "data": {
                "id": "inc-1",
                "custom_fields": {
                    "environment_orn": "orn:env:prod-eu",
                    "asset": "db-primary",
                    "extra flag": "yes",
                },
            },
        })
    }

    #[test]
    fn diagnosis_defaults_map_environment_only() {
        let options = build_options(&payload(), AutomationMode::Diagnosis, &OptionMaps::default())
            .expect("build options");
        assert_eq!(options.get("env_orn").map(String::as_str), Some("orn:env:prod-eu"));
        assert!(!options.contains_key("asset"));
    }

    #[test]
    fn remediation_defaults_include_asset() {
        let options = build_options(&payload(), AutomationMode::Remediation, &OptionMaps::default())
            .expect("build options");
        assert_eq!(options.get("env_orn").map(String::as_str), Some("orn:env:prod-eu"));
        assert_eq!(options.get("asset").map(String::as_str), Some("db-primary"));
    }

    #[test]
    fn overrides_win_and_absent_paths_are_skipped() {
        let mut maps = OptionMaps::default();
        maps.overrides.insert("data.custom_fields.environment_orn".into(), "target env".into());
        maps.overrides.insert("data.missing.path".into(), "never".into());
        let options =
            build_options(&payload(), AutomationMode::Diagnosis, &maps).expect("build options");
        assert_eq!(options.get("target_env").map(String::as_str), Some("orn:env:prod-eu"));
        assert!(!options.contains_key("env_orn"));
        assert!(!options.contains_key("never"));
    }

    #[test]
    fn pass_all_injects_prefixed_fields_without_clobbering() {
        let mut maps = OptionMaps::default();
        maps.pass_all_custom_fields = true;
        maps.overrides.insert("data.custom_fields.asset".into(), "cf_asset".into());
        let options =
            build_options(&payload(), AutomationMode::Diagnosis, &maps).expect("build options");
        // Explicitly mapped name is not overwritten by the pass-all sweep.
        assert_eq!(options.get("cf_asset").map(String::as_str), Some("db-primary"));
        assert_eq!(options.get("cf_extra_flag").map(String::as_str), Some("yes"));
        assert_eq!(options.get("cf_environment_orn").map(String::as_str), Some("orn:env:prod-eu"));
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let err = build_options(&json!([1, 2]), AutomationMode::Diagnosis, &OptionMaps::default())
            .expect_err("array payload");
        assert!(matches!(err, OptionsError::PayloadShape));
    }
}
