//! Error types for the coxswain framework
//!
//! Errors carry structured context to aid debugging in production: the
//! plugin they belong to, the store key being written, the request path
//! that failed. Recoverable conditions are logged by the scheduler and the
//! loop continues; only gateway/watch-stream failures terminate the
//! controller.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for coxswain operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error from the kube client
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Cluster gateway transport or watch-stream error
    #[error("gateway error [{path}]: {message}")]
    Gateway {
        /// Request path or watch name involved
        path: String,
        /// Description of what failed
        message: String,
    },

    /// Controller configuration invalid or unparseable
    #[error("config error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// Persistent store operation error
    #[error("store error: {message}")]
    Store {
        /// Description of what failed
        message: String,
        /// The store key being accessed, when one applies
        key: Option<String>,
    },

    /// Plugin registration error, raised synchronously at registration
    #[error("registration error for plugin {plugin}: {message}")]
    Registration {
        /// Id of the plugin being registered
        plugin: String,
        /// Description of what's wrong with the registration
        message: String,
    },

    /// Error surfaced by a plugin hook
    #[error("plugin error [{plugin}]: {message}")]
    Plugin {
        /// Id of the plugin that failed
        plugin: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error [{context}]: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// What was being processed (e.g. "yaml", "store-value")
        context: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g. "scheduler", "watch-set")
        context: String,
    },
}

impl Error {
    /// Create a gateway error for the given request path or watch name
    pub fn gateway(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Gateway {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a store error with the given message
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store {
            message: msg.into(),
            key: None,
        }
    }

    /// Create a store error for a specific key
    pub fn store_for_key(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Store {
            message: msg.into(),
            key: Some(key.into()),
        }
    }

    /// Create a registration error for the given plugin id
    pub fn registration(plugin: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Registration {
            plugin: plugin.into(),
            message: msg.into(),
        }
    }

    /// Create a plugin error for the given plugin id
    pub fn plugin(plugin: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create a serialization error with processing context
    pub fn serialization_in(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_in(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Config, registration, and serialization errors are not retryable:
    /// they require a configuration or code fix. Gateway, store, and plugin
    /// errors may succeed on a later attempt. Kubernetes errors depend on
    /// the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry transient API errors, not 4xx client errors
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Gateway { .. } => true,
            Error::Config { .. } => false,
            Error::Store { .. } => true,
            Error::Registration { .. } => false,
            Error::Plugin { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the plugin id if this error is associated with a specific plugin
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            Error::Registration { plugin, .. } => Some(plugin),
            Error::Plugin { plugin, .. } => Some(plugin),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Serialization { context, .. } => Some(context),
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}
