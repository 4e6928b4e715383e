//! Cluster API gateway
//!
//! The framework talks to the cluster through the [`ClusterGateway`] trait:
//! point-in-time JSON requests plus channel-backed streaming watches. The
//! production implementation wraps a `kube::Client` and does the raw path
//! requests itself; tests substitute a mock or a scripted gateway.
//!
//! API-level failures (the apiserver answering with a `Status` object of
//! `status: Failure`, e.g. a 404 on a missing ConfigMap) are returned as
//! ordinary values so callers can inspect them, mirroring what the
//! apiserver actually puts on the wire. Only transport-level problems
//! become errors.

use std::path::Path;

use async_trait::async_trait;
use coxswain_common::{Error, Result};
use http::Method;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{ErrorResponse, WatchEvent as KubeWatchEvent};
use kube::{Client, Config};
use serde_json::{json, Value};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::watch::{WatchEvent, WatchHandle, WatchParams};

/// Delay between watch stream reconnect attempts
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Point-in-time and streaming access to the cluster API.
///
/// `request` decodes the response body as JSON; `Status/Failure` bodies are
/// values, not errors. `open_watch` spawns whatever machinery feeds the
/// returned handle; dropping the handle must stop it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Perform a single request against the cluster API.
    ///
    /// `PATCH` bodies are sent as strategic-merge patches; everything else
    /// as plain JSON.
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value>;

    /// Open a streaming watch on the given path.
    ///
    /// Events are delivered through the returned handle's channel. The
    /// implementation is responsible for resuming the stream from the last
    /// observed `resourceVersion` and restarting from scratch when the
    /// version has expired.
    fn open_watch(&self, name: &str, path: &str, params: WatchParams) -> WatchHandle;
}

/// Whether a response value is a `Status` object reporting failure
pub fn is_failure_status(value: &Value) -> bool {
    value["kind"] == "Status" && value["status"] == "Failure"
}

/// Human-readable message of a failure `Status`, for logging
pub fn status_message(value: &Value) -> &str {
    value["message"].as_str().unwrap_or("unknown error")
}

/// `resourceVersion` of an object value, when present
pub fn resource_version(value: &Value) -> Option<&str> {
    value["metadata"]["resourceVersion"].as_str()
}

/// Build the URI for a watch request
fn watch_uri(path: &str, params: &WatchParams, resume_from: Option<&str>) -> String {
    let mut query = vec!["watch=true".to_string(), "allowWatchBookmarks=true".to_string()];
    if let Some(rv) = resume_from {
        query.push(format!("resourceVersion={rv}"));
    }
    if let Some(labels) = &params.label_selector {
        query.push(format!("labelSelector={labels}"));
    }
    if let Some(fields) = &params.field_selector {
        query.push(format!("fieldSelector={fields}"));
    }
    format!("{path}?{}", query.join("&"))
}

/// Shape an apiserver error into the `Status` object it came from
fn status_value(err: &ErrorResponse) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "message": err.message,
        "reason": err.reason,
        "code": err.code,
    })
}

/// Create a kube client from an optional kubeconfig path.
///
/// Falls back to the in-cluster / default environment configuration when no
/// path is given.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| Error::internal_in("gateway", format!("failed to read kubeconfig: {e}")))?;
            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::internal_in("gateway", format!("failed to load kubeconfig: {e}")))?;
            Ok(Client::try_from(config)?)
        }
        None => Ok(Client::try_default().await?),
    }
}

/// Production gateway backed by a `kube::Client`.
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
}

impl KubeGateway {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the default environment (in-cluster or local kubeconfig)
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(create_client(None).await?))
    }
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let payload = match &body {
            Some(value) => serde_json::to_vec(value)
                .map_err(|e| Error::serialization_in("request-body", e.to_string()))?,
            None => Vec::new(),
        };
        let content_type = if method == Method::PATCH {
            "application/strategic-merge-patch+json"
        } else {
            "application/json"
        };
        let request = http::Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::CONTENT_TYPE, content_type)
            .header(http::header::ACCEPT, "application/json")
            .body(payload)
            .map_err(|e| Error::gateway(path, e.to_string()))?;

        match self.client.request::<Value>(request).await {
            Ok(value) => Ok(value),
            // Hand API-level failures back as the Status object they are
            Err(kube::Error::Api(err)) => Ok(status_value(&err)),
            Err(e) => Err(e.into()),
        }
    }

    fn open_watch(&self, name: &str, path: &str, params: WatchParams) -> WatchHandle {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = WatchHandle::new(name, rx, cancel.clone());

        let client = self.client.clone();
        let name = name.to_string();
        let path = path.to_string();
        tokio::spawn(async move {
            let mut resume_from = params.resource_version.clone();
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let uri = watch_uri(&path, &params, resume_from.as_deref());
                let request = match http::Request::get(&uri).body(Vec::new()) {
                    Ok(req) => req,
                    Err(e) => {
                        let _ = tx.send(Err(Error::gateway(&path, e.to_string())));
                        return;
                    }
                };

                match client.request_events::<Value>(request).await {
                    Ok(stream) => {
                        use futures::StreamExt;
                        tokio::pin!(stream);
                        loop {
                            tokio::select! {
                                _ = cancel.cancelled() => {
                                    debug!(watch = %name, "watch cancelled");
                                    return;
                                }
                                event = stream.next() => match event {
                                    Some(Ok(KubeWatchEvent::Added(obj))) => {
                                        if let Some(rv) = resource_version(&obj) {
                                            resume_from = Some(rv.to_string());
                                        }
                                        if tx.send(Ok(WatchEvent::Added(obj))).is_err() {
                                            return;
                                        }
                                    }
                                    Some(Ok(KubeWatchEvent::Modified(obj))) => {
                                        if let Some(rv) = resource_version(&obj) {
                                            resume_from = Some(rv.to_string());
                                        }
                                        if tx.send(Ok(WatchEvent::Modified(obj))).is_err() {
                                            return;
                                        }
                                    }
                                    Some(Ok(KubeWatchEvent::Deleted(obj))) => {
                                        if let Some(rv) = resource_version(&obj) {
                                            resume_from = Some(rv.to_string());
                                        }
                                        if tx.send(Ok(WatchEvent::Deleted(obj))).is_err() {
                                            return;
                                        }
                                    }
                                    Some(Ok(KubeWatchEvent::Bookmark(bookmark))) => {
                                        resume_from = Some(bookmark.metadata.resource_version);
                                    }
                                    Some(Ok(KubeWatchEvent::Error(err))) => {
                                        if err.code == 410 {
                                            // Resource version expired; restart from scratch
                                            warn!(watch = %name, "watch expired, restarting without resourceVersion");
                                            resume_from = None;
                                        } else {
                                            warn!(watch = %name, code = err.code, message = %err.message, "watch stream error, reconnecting");
                                        }
                                        break;
                                    }
                                    Some(Err(e)) => {
                                        warn!(watch = %name, error = %e, "watch transport error, reconnecting");
                                        break;
                                    }
                                    None => {
                                        debug!(watch = %name, "watch stream ended, reconnecting");
                                        break;
                                    }
                                },
                            }
                        }
                    }
                    Err(kube::Error::Api(err)) if err.code == 410 => {
                        warn!(watch = %name, "watch expired at connect, restarting without resourceVersion");
                        resume_from = None;
                    }
                    Err(kube::Error::Api(err)) if (400..500).contains(&err.code) => {
                        // The watch target is unservable; the controller must know
                        let _ = tx.send(Err(Error::gateway(&path, err.message)));
                        return;
                    }
                    Err(e) => {
                        warn!(watch = %name, error = %e, "watch connect failed, retrying");
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(RECONNECT_DELAY) => {}
                }
            }
        });

        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_status_is_detected() {
        let failure = json!({
            "kind": "Status",
            "status": "Failure",
            "message": "configmaps \"coxswain-store\" not found",
            "code": 404,
        });
        assert!(is_failure_status(&failure));
        assert_eq!(
            status_message(&failure),
            "configmaps \"coxswain-store\" not found"
        );
    }

    #[test]
    fn success_status_is_not_failure() {
        let ok = json!({"kind": "Status", "status": "Success"});
        assert!(!is_failure_status(&ok));
    }

    #[test]
    fn plain_objects_are_not_failures() {
        let cm = json!({"kind": "ConfigMap", "metadata": {"name": "x"}});
        assert!(!is_failure_status(&cm));
        assert_eq!(status_message(&cm), "unknown error");
    }

    #[test]
    fn resource_version_extraction() {
        let cm = json!({"metadata": {"name": "x", "resourceVersion": "1234"}});
        assert_eq!(resource_version(&cm), Some("1234"));
        assert_eq!(resource_version(&json!({})), None);
    }

    #[test]
    fn watch_uri_minimal() {
        let uri = watch_uri(
            "/api/v1/watch/namespaces/kube-system/configmaps/c",
            &WatchParams::default(),
            None,
        );
        assert_eq!(
            uri,
            "/api/v1/watch/namespaces/kube-system/configmaps/c?watch=true&allowWatchBookmarks=true"
        );
    }

    #[test]
    fn watch_uri_with_resume_and_selectors() {
        let params = WatchParams::default().labels("app=edge").fields("metadata.name=cm");
        let uri = watch_uri("/api/v1/pods", &params, Some("99"));
        assert!(uri.contains("resourceVersion=99"));
        assert!(uri.contains("labelSelector=app=edge"));
        assert!(uri.contains("fieldSelector=metadata.name=cm"));
    }

    #[test]
    fn api_errors_become_status_values() {
        let err = ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        };
        let value = status_value(&err);
        assert!(is_failure_status(&value));
        assert_eq!(value["code"], 404);
        assert_eq!(value["reason"], "NotFound");
    }
}
