//! Plugin contract and per-plugin runtime state
//!
//! A plugin is a user-written reconciler that pushes some external system
//! (a firewall, an ingress device, a DNS provider) toward the cluster's
//! declared state. The framework owns scheduling; the plugin owns domain
//! logic and its own private state. Hooks run serially on the scheduler
//! task and never overlap with another plugin's.
//!
//! The usual shape: `init` opens watches and loads a snapshot from the
//! store, watch events call [`PluginContext::mark_action_required`], and
//! `do_action` performs one idempotent reconcile pass against the external
//! system, returning whether it succeeded.

use std::sync::Arc;

use async_trait::async_trait;
use coxswain_common::Result;
use serde_json::Value;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::gateway::ClusterGateway;
use crate::registry::Registry;
use crate::scheduler::ActionState;
use crate::store::Store;
use crate::watch::{WatchEvent, WatchHandle, WatchParams, WatchSet};

/// A user-written reconciler driven by the controller.
///
/// Hook order within a tick: `pre_read_watches`, then `on_watch_event` for
/// every event drained from the plugin's watches, then
/// `post_read_watches`, then (when the reconcile predicate passes)
/// `do_action`. `init` runs exactly once before the first tick serves the
/// instance; `deinit` exactly once before it is dropped.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Called once after construction, before the first tick.
    ///
    /// The usual place to open watches and load snapshot state.
    async fn init(&mut self, _ctx: &mut PluginContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Called once before the instance is discarded. No further hooks
    /// follow.
    async fn deinit(&mut self, _ctx: &mut PluginContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Called each tick before the plugin's watches are advanced.
    async fn pre_read_watches(&mut self, _ctx: &mut PluginContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Called for every event drained from the plugin's own watches,
    /// strictly between `pre_read_watches` and `post_read_watches`.
    async fn on_watch_event(
        &mut self,
        _ctx: &mut PluginContext<'_>,
        _watch: &str,
        _event: WatchEvent,
    ) {
    }

    /// Called each tick after the plugin's watches are advanced.
    async fn post_read_watches(&mut self, _ctx: &mut PluginContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Perform one reconcile pass.
    ///
    /// `Ok(true)` means reconciled: the latch clears. `Ok(false)` or `Err`
    /// means retry later under the back-off gate.
    async fn do_action(&mut self, ctx: &mut PluginContext<'_>) -> Result<bool>;

    /// Minimum quiet period after the first latch edge before `do_action`
    /// may run. Zero disables the settle gate.
    fn settle_time(&self) -> Duration {
        Duration::ZERO
    }

    /// Minimum interval between successive `do_action` attempts. Zero
    /// disables the throttle gate.
    fn throttle_time(&self) -> Duration {
        Duration::ZERO
    }
}

type PluginFactory = Box<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// Static registration of a plugin: a unique id plus the factory that
/// constructs instances on config load.
pub struct PluginDescriptor {
    id: String,
    factory: PluginFactory,
}

impl PluginDescriptor {
    /// Describe a plugin under the given id
    pub fn new<F>(id: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            factory: Box::new(factory),
        }
    }

    /// The plugin id, matched against `plugins` keys of the live config
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn construct(&self) -> Box<dyn Plugin> {
        (self.factory)()
    }
}

impl std::fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDescriptor").field("id", &self.id).finish()
    }
}

/// Runtime record of one constructed plugin instance.
pub(crate) struct ActivePlugin {
    pub(crate) id: String,
    pub(crate) config: Value,
    pub(crate) plugin: Box<dyn Plugin>,
    pub(crate) watches: WatchSet,
    pub(crate) state: ActionState,
}

impl ActivePlugin {
    pub(crate) fn new(id: impl Into<String>, config: Value, plugin: Box<dyn Plugin>) -> Self {
        Self {
            id: id.into(),
            config,
            plugin,
            watches: WatchSet::new(),
            state: ActionState::new(),
        }
    }
}

/// What a plugin sees of the controller during a hook call.
pub struct PluginContext<'a> {
    pub(crate) plugin_id: &'a str,
    pub(crate) config: &'a Value,
    pub(crate) state: &'a mut ActionState,
    pub(crate) watches: &'a mut WatchSet,
    pub(crate) store: Option<&'a Store>,
    pub(crate) registry: &'a Registry,
    pub(crate) gateway: &'a Arc<dyn ClusterGateway>,
}

impl<'a> PluginContext<'a> {
    /// The id this instance was registered under
    pub fn plugin_id(&self) -> &str {
        self.plugin_id
    }

    /// The plugin's opaque block of the live configuration
    pub fn plugin_config(&self) -> &Value {
        self.config
    }

    /// Latch the action flag; the scheduler will run `do_action` once the
    /// settle/throttle/back-off gates allow it.
    ///
    /// The first call while unlatched stamps the settle edge; repeated
    /// calls while latched are no-ops.
    pub fn mark_action_required(&mut self) {
        self.state.mark_required(Instant::now());
        debug!(plugin = %self.plugin_id, "action required");
    }

    /// Read-only view of the plugin's rate-control state
    pub fn action_state(&self) -> &ActionState {
        self.state
    }

    /// Register a watch; it is advanced on every subsequent tick.
    pub fn add_watch(&mut self, handle: WatchHandle) {
        self.watches.add(handle);
    }

    /// Open a watch through the cluster gateway and register it.
    pub fn open_watch(&mut self, name: &str, path: &str, params: WatchParams) {
        let handle = self.gateway.open_watch(name, path, params);
        self.watches.add(handle);
    }

    /// Log one line describing a watch event, prefixed with this plugin's id.
    pub fn log_event(&self, watch: &str, event: &WatchEvent) {
        tracing::info!(
            plugin = %self.plugin_id,
            watch,
            event = event.type_str(),
            object = event.object_name().unwrap_or("<unnamed>"),
            "watch event"
        );
    }

    /// Shared handles parked on the controller before `run()`
    pub fn registry(&self) -> &Registry {
        self.registry
    }

    /// The cluster gateway, for point-in-time requests
    pub fn gateway(&self) -> &Arc<dyn ClusterGateway> {
        self.gateway
    }

    /// This plugin's durable state from the store, if the store is enabled
    /// and holds an entry under the plugin id.
    pub fn get_store(&self) -> Option<Value> {
        self.store.and_then(|store| store.get(self.plugin_id))
    }

    /// Persist this plugin's durable state under its id.
    ///
    /// Returns false when the store is disabled or the write is rejected;
    /// the plugin decides whether to retry.
    pub async fn save_store(&self, value: &Value) -> bool {
        match self.store {
            Some(store) => store.set(self.plugin_id, value).await,
            None => {
                warn!(plugin = %self.plugin_id, "save_store called with the store disabled");
                false
            }
        }
    }
}
