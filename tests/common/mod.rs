//! Scripted cluster gateway for end-to-end controller tests
//!
//! Point requests answer from a programmable response table (defaulting to
//! a 404 Status) and every opened watch exposes its sender so the test can
//! push events into the controller from outside.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use coxswain::{ClusterGateway, Result, WatchEvent, WatchHandle, WatchParams};
use http::Method;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{sleep, Duration};

type EventSender = UnboundedSender<Result<WatchEvent>>;

/// Gateway double driven entirely by the test.
#[derive(Default)]
pub struct ScriptedGateway {
    responses: Mutex<HashMap<(String, String), Value>>,
    requests: Mutex<Vec<(String, String, Option<Value>)>>,
    watch_senders: Mutex<HashMap<String, EventSender>>,
}

impl ScriptedGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script the response for a `(method, path)` pair
    pub fn respond(&self, method: Method, path: &str, value: Value) {
        self.responses
            .lock()
            .unwrap()
            .insert((method.to_string(), path.to_string()), value);
    }

    /// Requests seen so far as `(method, path, body)` tuples
    #[allow(dead_code)]
    pub fn requests(&self) -> Vec<(String, String, Option<Value>)> {
        self.requests.lock().unwrap().clone()
    }

    /// Wait until the controller opens the named watch, then hand over the
    /// sender feeding it.
    pub async fn watch_sender(&self, name: &str) -> EventSender {
        loop {
            if let Some(tx) = self.watch_senders.lock().unwrap().get(name) {
                return tx.clone();
            }
            sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl ClusterGateway for ScriptedGateway {
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        self.requests
            .lock()
            .unwrap()
            .push((method.to_string(), path.to_string(), body));
        let scripted = self
            .responses
            .lock()
            .unwrap()
            .get(&(method.to_string(), path.to_string()))
            .cloned();
        Ok(scripted.unwrap_or_else(|| {
            json!({
                "kind": "Status",
                "status": "Failure",
                "message": format!("{path} not found"),
                "reason": "NotFound",
                "code": 404,
            })
        }))
    }

    fn open_watch(&self, name: &str, _path: &str, _params: WatchParams) -> WatchHandle {
        let (handle, tx) = WatchHandle::channel(name);
        self.watch_senders
            .lock()
            .unwrap()
            .insert(name.to_string(), tx);
        handle
    }
}
