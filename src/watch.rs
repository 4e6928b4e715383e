//! Watch plumbing: channel-backed handles advanced under a time budget
//!
//! Every streaming watch is produced by a background task (see
//! [`crate::gateway`]) that pushes decoded events into an unbounded channel.
//! The scheduler owns the receiving [`WatchHandle`] and drains it inside the
//! tick, so all event handling runs on the single scheduler task. A
//! [`WatchSet`] groups the handles belonging to one owner (the controller's
//! config watch, the store, or a plugin) and advances them together under
//! one deadline per tick.

use coxswain_common::Result;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A decoded cluster watch event.
///
/// Bookmarks and stream-level errors are handled inside the gateway; by the
/// time an event reaches a handle it is one of the three object events.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// Object added (also delivered for objects existing at watch start)
    Added(Value),
    /// Object modified
    Modified(Value),
    /// Object deleted
    Deleted(Value),
}

impl WatchEvent {
    /// The cluster API event type string
    pub fn type_str(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "ADDED",
            WatchEvent::Modified(_) => "MODIFIED",
            WatchEvent::Deleted(_) => "DELETED",
        }
    }

    /// The object carried by the event
    pub fn object(&self) -> &Value {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }

    /// `metadata.name` of the carried object, when present
    pub fn object_name(&self) -> Option<&str> {
        self.object()["metadata"]["name"].as_str()
    }
}

/// Parameters for opening a watch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchParams {
    /// Resource version to resume from
    pub resource_version: Option<String>,
    /// Label selector filter
    pub label_selector: Option<String>,
    /// Field selector filter
    pub field_selector: Option<String>,
}

impl WatchParams {
    /// Params resuming from the given resource version
    pub fn at(resource_version: impl Into<String>) -> Self {
        Self {
            resource_version: Some(resource_version.into()),
            ..Self::default()
        }
    }

    /// Set a label selector
    pub fn labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    /// Set a field selector
    pub fn fields(mut self, selector: impl Into<String>) -> Self {
        self.field_selector = Some(selector.into());
        self
    }
}

/// Receiving end of one streaming watch.
///
/// Dropping the handle cancels the producer task.
pub struct WatchHandle {
    name: String,
    events: mpsc::UnboundedReceiver<Result<WatchEvent>>,
    cancel: CancellationToken,
}

impl WatchHandle {
    /// Wrap an event channel and its producer's cancellation token.
    pub fn new(
        name: impl Into<String>,
        events: mpsc::UnboundedReceiver<Result<WatchEvent>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            events,
            cancel,
        }
    }

    /// Create a handle together with the sender feeding it.
    ///
    /// Used by gateway implementations and scripted test gateways.
    pub fn channel(name: impl Into<String>) -> (Self, mpsc::UnboundedSender<Result<WatchEvent>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(name, rx, CancellationToken::new()), tx)
    }

    /// Name the watch was registered under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drain events until the deadline passes.
    ///
    /// Buffered events are collected immediately; the call then waits out
    /// the remaining budget for more. A closed channel ends the call early
    /// with whatever was collected. A stream error from the producer
    /// propagates and terminates the controller.
    pub async fn advance(&mut self, deadline: Instant) -> Result<Vec<WatchEvent>> {
        let mut collected = Vec::new();
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return Ok(collected),
                item = self.events.recv() => match item {
                    Some(Ok(event)) => {
                        debug!(watch = %self.name, event = event.type_str(), "watch event");
                        collected.push(event);
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(collected),
                },
            }
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle").field("name", &self.name).finish()
    }
}

/// An ordered collection of watches advanced together each tick.
#[derive(Debug, Default)]
pub struct WatchSet {
    handles: Vec<WatchHandle>,
}

impl WatchSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a watch; it is advanced on every subsequent tick
    pub fn add(&mut self, handle: WatchHandle) {
        self.handles.push(handle);
    }

    /// Number of registered watches
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the set has no watches
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Advance every handle in registration order under one shared deadline.
    ///
    /// Returns `(watch name, event)` pairs: all events of the first watch,
    /// then the second, and so on. An error from any stream aborts the
    /// advance.
    pub async fn advance(&mut self, budget: Duration) -> Result<Vec<(String, WatchEvent)>> {
        let deadline = Instant::now() + budget;
        let mut out = Vec::new();
        for handle in &mut self.handles {
            let events = handle.advance(deadline).await?;
            let name = handle.name().to_string();
            out.extend(events.into_iter().map(|ev| (name.clone(), ev)));
        }
        Ok(out)
    }
}
