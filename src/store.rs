//! Cluster-persisted key/value store
//!
//! A single ConfigMap holds the durable state of every plugin: each `data`
//! entry maps a key to a JSON-encoded value. Writes go straight through to
//! the cluster; the in-memory cache is refreshed only by the store's own
//! watch, so a reader sees its own write after at most one watch advance.
//! Last writer wins at the cluster API.

use std::collections::HashMap;
use std::sync::Arc;

use coxswain_common::{Error, Result};
use http::Method;
use k8s_openapi::api::core::v1::ConfigMap;
use serde_json::{json, Value};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::gateway::{is_failure_status, resource_version, status_message, ClusterGateway};
use crate::watch::{WatchEvent, WatchParams, WatchSet};

/// Durable key→JSON map backed by a cluster ConfigMap.
pub struct Store {
    gateway: Arc<dyn ClusterGateway>,
    namespace: String,
    name: String,
    cache: HashMap<String, Value>,
    initialized: bool,
    watches: WatchSet,
}

impl Store {
    /// Create an uninitialized store for the ConfigMap at
    /// `(namespace, name)`. Nothing touches the cluster until [`init`].
    ///
    /// [`init`]: Store::init
    pub fn new(gateway: Arc<dyn ClusterGateway>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            gateway,
            namespace: namespace.into(),
            name: name.into(),
            cache: HashMap::new(),
            initialized: false,
            watches: WatchSet::new(),
        }
    }

    /// Whether `init` has completed
    pub fn initialized(&self) -> bool {
        self.initialized
    }

    fn map_path(&self) -> String {
        format!(
            "/api/v1/namespaces/{}/configmaps/{}",
            self.namespace, self.name
        )
    }

    fn collection_path(&self) -> String {
        format!("/api/v1/namespaces/{}/configmaps", self.namespace)
    }

    fn watch_path(&self) -> String {
        format!(
            "/api/v1/watch/namespaces/{}/configmaps/{}",
            self.namespace, self.name
        )
    }

    /// Fetch or create the backing ConfigMap, load the cache, and open the
    /// refresh watch.
    ///
    /// Safe to call again after a failure; the tick loop retries every 5 s
    /// until it succeeds.
    pub async fn init(&mut self) -> Result<()> {
        let mut object = self
            .gateway
            .request(Method::GET, &self.map_path(), None)
            .await?;

        if is_failure_status(&object) {
            info!(
                namespace = %self.namespace,
                name = %self.name,
                "store ConfigMap missing, creating it"
            );
            let manifest = json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"namespace": self.namespace, "name": self.name},
            });
            object = self
                .gateway
                .request(Method::POST, &self.collection_path(), Some(manifest))
                .await?;
            if is_failure_status(&object) {
                return Err(Error::store(format!(
                    "failed to create store ConfigMap: {}",
                    status_message(&object)
                )));
            }
        }

        let version = resource_version(&object)
            .ok_or_else(|| Error::store("store ConfigMap has no resourceVersion"))?
            .to_string();

        self.cache = decode_data(&object);

        let mut watches = WatchSet::new();
        watches.add(self.gateway.open_watch(
            "store",
            &self.watch_path(),
            WatchParams::at(version),
        ));
        self.watches = watches;
        self.initialized = true;

        info!(
            namespace = %self.namespace,
            name = %self.name,
            keys = self.cache.len(),
            "store initialized"
        );
        Ok(())
    }

    /// Drain the store watch and fold the events into the cache.
    pub async fn advance_watches(&mut self, budget: Duration) -> Result<()> {
        let events = self.watches.advance(budget).await?;
        for (_, event) in events {
            self.apply_event(event);
        }
        Ok(())
    }

    fn apply_event(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => {
                self.cache = decode_data(&object);
                debug!(keys = self.cache.len(), "store cache refreshed");
            }
            WatchEvent::Deleted(_) => {
                self.cache.clear();
                warn!(
                    namespace = %self.namespace,
                    name = %self.name,
                    "store ConfigMap deleted, cache cleared"
                );
            }
        }
    }

    /// Read a value from the cache.
    ///
    /// Purely local; reflects the cluster as of the latest watch advance.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.cache.get(key).cloned()
    }

    /// Write a value through to the cluster.
    ///
    /// Patches a single `data` entry with the JSON encoding of `value`.
    /// The cache is not touched; the next watch advance reconciles it.
    /// Returns false (and logs the server's message) when the write is
    /// rejected or the request fails.
    pub async fn set(&self, key: &str, value: &Value) -> bool {
        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(key, error = %e, "store value not encodable");
                return false;
            }
        };
        let patch = json!({"data": {key: encoded}});
        match self
            .gateway
            .request(Method::PATCH, &self.map_path(), Some(patch))
            .await
        {
            Ok(response) if is_failure_status(&response) => {
                warn!(key, message = status_message(&response), "store write rejected");
                false
            }
            Ok(_) => true,
            Err(e) => {
                warn!(key, error = %e, "store write failed");
                false
            }
        }
    }
}

/// Decode a ConfigMap object's `data` into the cache shape.
///
/// Values that are not valid JSON are logged and skipped; a missing or null
/// `data` field yields an empty map.
fn decode_data(object: &Value) -> HashMap<String, Value> {
    let config_map: ConfigMap = match serde_json::from_value(object.clone()) {
        Ok(cm) => cm,
        Err(e) => {
            warn!(error = %e, "store object is not a ConfigMap, treating as empty");
            return HashMap::new();
        }
    };
    let mut cache = HashMap::new();
    for (key, raw) in config_map.data.unwrap_or_default() {
        match serde_json::from_str(&raw) {
            Ok(value) => {
                cache.insert(key, value);
            }
            Err(e) => {
                warn!(key = %key, error = %e, "store value is not valid JSON, skipping");
            }
        }
    }
    cache
}
