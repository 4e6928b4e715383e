//! Common types for coxswain: errors, YAML bridging, and shared constants

#![deny(missing_docs)]

pub mod error;
pub mod yaml;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default namespace for the controller's own ConfigMaps
pub const DEFAULT_NAMESPACE: &str = "kube-system";

/// Default controller identity prefix for managed resources
pub const DEFAULT_CONTROLLER_ID: &str = "coxswain";

/// Suffix appended to the controller id to name the config ConfigMap
pub const CONFIG_MAP_SUFFIX: &str = "-config";

/// Suffix appended to the controller id to name the store ConfigMap
pub const STORE_MAP_SUFFIX: &str = "-store";

/// Key inside the config ConfigMap's `data` holding the YAML document
pub const CONFIG_DATA_KEY: &str = "config";
