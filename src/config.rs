//! Controller configuration
//!
//! Two layers: [`ControllerOptions`] is the bootstrap configuration fixed at
//! construction (identity, ConfigMap coordinates, rate-control defaults),
//! while [`ControllerConfig`] is the live configuration parsed from the
//! config ConfigMap's `data.config` YAML document and replaced on every
//! config watch event.

use std::collections::HashMap;
use std::time::Duration;

use coxswain_common::{yaml, Error, Result, CONFIG_DATA_KEY, CONFIG_MAP_SUFFIX, DEFAULT_CONTROLLER_ID, DEFAULT_NAMESPACE, STORE_MAP_SUFFIX};
use serde::Deserialize;
use serde_json::Value;

/// Bootstrap options recognized at controller construction.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Identity prefix for managed resources; the loaded config's
    /// `controller-id` overrides it at runtime
    pub controller_id: String,
    /// Namespace of the config ConfigMap
    pub config_namespace: String,
    /// Name of the config ConfigMap
    pub config_name: String,
    /// Whether the persistent store is created at startup
    pub store_enabled: bool,
    /// Namespace of the store ConfigMap
    pub store_namespace: String,
    /// Name of the store ConfigMap
    pub store_name: String,
    /// Minimum delay before retrying a plugin whose last action failed
    pub failed_action_wait: Duration,
}

impl ControllerOptions {
    /// Options for the given controller id with spec defaults:
    /// `kube-system/{id}-config`, `kube-system/{id}-store`, store enabled,
    /// 30 s failure back-off.
    pub fn new(controller_id: impl Into<String>) -> Self {
        let id = controller_id.into();
        Self {
            config_namespace: DEFAULT_NAMESPACE.to_string(),
            config_name: format!("{id}{CONFIG_MAP_SUFFIX}"),
            store_enabled: true,
            store_namespace: DEFAULT_NAMESPACE.to_string(),
            store_name: format!("{id}{STORE_MAP_SUFFIX}"),
            failed_action_wait: Duration::from_secs(30),
            controller_id: id,
        }
    }

    /// Resource path of the config ConfigMap
    pub(crate) fn config_map_path(&self) -> String {
        format!(
            "/api/v1/namespaces/{}/configmaps/{}",
            self.config_namespace, self.config_name
        )
    }

    /// Watch path of the config ConfigMap
    pub(crate) fn config_watch_path(&self) -> String {
        format!(
            "/api/v1/watch/namespaces/{}/configmaps/{}",
            self.config_namespace, self.config_name
        )
    }
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self::new(DEFAULT_CONTROLLER_ID)
    }
}

/// Parsed contents of the config ConfigMap.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ControllerConfig {
    /// Master switch; false unloads every plugin
    #[serde(default)]
    pub enabled: bool,
    /// Optional override of the bootstrap controller id
    #[serde(rename = "controller-id", default)]
    pub controller_id: Option<String>,
    /// Per-plugin settings keyed by plugin id
    #[serde(default)]
    pub plugins: HashMap<String, PluginSettings>,
}

/// Per-plugin block of the live configuration.
///
/// Everything besides `enabled` is opaque to the framework and handed to
/// the plugin as its own sub-config.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PluginSettings {
    /// Whether the plugin is constructed on config load
    #[serde(default)]
    pub enabled: bool,
    /// Plugin-specific options, passed through untouched
    #[serde(flatten)]
    pub options: serde_json::Map<String, Value>,
}

impl PluginSettings {
    /// The opaque options as a JSON object value
    pub fn options_value(&self) -> Value {
        Value::Object(self.options.clone())
    }
}

/// Parse a config ConfigMap object into a [`ControllerConfig`].
///
/// The object's `data.config` entry must hold a YAML document matching the
/// controller config schema.
pub fn parse_controller_config(object: &Value) -> Result<ControllerConfig> {
    let doc = object["data"][CONFIG_DATA_KEY].as_str().ok_or_else(|| {
        Error::config(format!(
            "config ConfigMap has no data.{CONFIG_DATA_KEY} entry"
        ))
    })?;
    yaml::from_yaml(doc).map_err(|e| Error::config(e.to_string()))
}
