//! The controller: main loop, config lifecycle, and plugin scheduling
//!
//! One `Controller` owns everything: the cluster gateway, the registered
//! plugin descriptors, the live configuration, the active plugin set, and
//! the optional persistent store. `run()` is the whole show: a tick loop
//! that advances watches under fixed budgets, applies config changes, and
//! pushes each plugin through its hooks and the reconcile predicate.
//!
//! Everything runs on the one task executing `run()`; watch streams feed
//! channels from background tasks but never touch controller state
//! themselves.

use std::sync::Arc;

use coxswain_common::{Error, Result};
use serde_json::Value;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{parse_controller_config, ControllerConfig, ControllerOptions};
use crate::gateway::ClusterGateway;
use crate::plugin::{ActivePlugin, Plugin, PluginContext, PluginDescriptor};
use crate::registry::Registry;
use crate::scheduler::{ready_for_action, ActionState};
use crate::store::Store;
use crate::watch::{WatchEvent, WatchParams, WatchSet};

/// Idle pause at the top of every tick
const TICK_PAUSE: Duration = Duration::from_millis(100);

/// Time budget for advancing one watch set within a tick
const WATCH_BUDGET: Duration = Duration::from_secs(1);

/// Retry delay while waiting for configuration or the store
const WAIT_RETRY: Duration = Duration::from_secs(5);

/// The controller process: plugin registry, live config, store, and the
/// tick loop driving them.
pub struct Controller {
    options: ControllerOptions,
    gateway: Arc<dyn ClusterGateway>,
    registered: Vec<PluginDescriptor>,
    registry: Registry,
    config: Option<ControllerConfig>,
    plugins: Vec<ActivePlugin>,
    store: Option<Store>,
    config_watches: WatchSet,
    shutdown: CancellationToken,
}

impl Controller {
    /// Create a controller over the given gateway.
    ///
    /// Plugins and registry items are added afterwards, before [`run`].
    ///
    /// [`run`]: Controller::run
    pub fn new(gateway: Arc<dyn ClusterGateway>, options: ControllerOptions) -> Self {
        Self {
            options,
            gateway,
            registered: Vec::new(),
            registry: Registry::new(),
            config: None,
            plugins: Vec::new(),
            store: None,
            config_watches: WatchSet::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a plugin descriptor.
    ///
    /// Active plugins are constructed from descriptors whenever the live
    /// configuration enables their id; the active set follows registration
    /// order. Registering the same id twice is an error.
    pub fn register_plugin(&mut self, descriptor: PluginDescriptor) -> Result<()> {
        if self.registered.iter().any(|d| d.id() == descriptor.id()) {
            return Err(Error::registration(
                descriptor.id(),
                "plugin id already registered",
            ));
        }
        info!(plugin = %descriptor.id(), "plugin registered");
        self.registered.push(descriptor);
        Ok(())
    }

    /// Park a shared handle for plugins to fetch by key
    pub fn set_registry_item<T: std::any::Any + Send + Sync>(
        &mut self,
        key: impl Into<String>,
        value: T,
    ) {
        self.registry.set(key, value);
    }

    /// The shared handle registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Fetch a shared handle parked with [`set_registry_item`]
    ///
    /// [`set_registry_item`]: Controller::set_registry_item
    pub fn get_registry_item(&self, key: &str) -> Option<crate::registry::RegistryItem> {
        self.registry.get(key)
    }

    /// Effective controller id: the loaded config's `controller-id` when
    /// present, the bootstrap id otherwise.
    pub fn controller_id(&self) -> &str {
        self.config
            .as_ref()
            .and_then(|c| c.controller_id.as_deref())
            .unwrap_or(&self.options.controller_id)
    }

    /// Token cancelled when the controller should stop.
    ///
    /// SIGINT cancels it automatically; embedders and tests may cancel it
    /// directly. The loop observes it at tick granularity.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the controller until shutdown.
    ///
    /// Returns `Ok(())` after a clean SIGINT/token shutdown (active plugins
    /// are deinitialized first) and `Err` when the gateway fails
    /// unrecoverably while advancing watches.
    pub async fn run(mut self) -> Result<()> {
        info!(
            controller = %self.options.controller_id,
            config = %format!("{}/{}", self.options.config_namespace, self.options.config_name),
            "controller starting"
        );

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                shutdown.cancel();
            }
        });

        if self.options.store_enabled {
            let mut store = Store::new(
                self.gateway.clone(),
                self.options.store_namespace.clone(),
                self.options.store_name.clone(),
            );
            if let Err(e) = store.init().await {
                warn!(error = %e, "store init failed, will retry");
            }
            self.store = Some(store);
        }

        self.config_watches.add(self.gateway.open_watch(
            "config",
            &self.options.config_watch_path(),
            WatchParams::default(),
        ));

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            sleep(TICK_PAUSE).await;
            self.tick().await?;
        }

        self.unload_plugins("shutdown").await;
        info!("controller stopped");
        Ok(())
    }

    /// One iteration of the main loop.
    async fn tick(&mut self) -> Result<()> {
        // Config events apply before any plugin work in the same tick
        let events = self.config_watches.advance(WATCH_BUDGET).await?;
        for (_, event) in events {
            self.apply_config_event(event).await;
        }

        if self.config.is_none() {
            info!(
                "waiting for config ConfigMap {}/{}",
                self.options.config_namespace, self.options.config_name
            );
            sleep(WAIT_RETRY).await;
            return Ok(());
        }

        if let Some(store) = self.store.as_mut() {
            if !store.initialized() {
                match store.init().await {
                    Ok(()) => info!("store initialized, resuming"),
                    Err(e) => warn!(error = %e, "waiting for store"),
                }
                sleep(WAIT_RETRY).await;
                return Ok(());
            }
            store.advance_watches(WATCH_BUDGET).await?;
        }

        self.service_plugins().await?;

        // Post-action drain picks up writes made during do_action
        if let Some(store) = self.store.as_mut() {
            store.advance_watches(WATCH_BUDGET).await?;
        }

        Ok(())
    }

    /// Handle one event from the config watch.
    async fn apply_config_event(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => {
                match parse_controller_config(&object) {
                    Ok(config) => {
                        if let Some(id) = &config.controller_id {
                            info!(controller = %id, "configuration overrides controller id");
                        }
                        self.config = Some(config);
                        self.on_config_loaded().await;
                    }
                    Err(e) => {
                        error!(error = %e, "configuration invalid, unloading plugins");
                        self.config = None;
                        self.unload_plugins("invalid config").await;
                    }
                }
            }
            WatchEvent::Deleted(_) => {
                info!("configuration deleted");
                self.config = None;
                self.unload_plugins("config deleted").await;
            }
        }
    }

    /// Rebuild the active plugin set from the freshly loaded config.
    async fn on_config_loaded(&mut self) {
        self.unload_plugins("config reload").await;

        let Some(config) = self.config.clone() else {
            return;
        };
        if !config.enabled {
            info!("controller disabled by configuration, no plugins active");
            return;
        }

        // Walk descriptors so the active set follows registration order
        for idx in 0..self.registered.len() {
            let id = self.registered[idx].id().to_string();
            let Some(settings) = config.plugins.get(&id) else {
                continue;
            };
            if !settings.enabled {
                debug!(plugin = %id, "plugin disabled by configuration");
                continue;
            }

            let instance = self.registered[idx].construct();
            let mut active = ActivePlugin::new(id.clone(), settings.options_value(), instance);
            let outcome = {
                let mut ctx = plugin_ctx(
                    &active.id,
                    &active.config,
                    &mut active.state,
                    &mut active.watches,
                    self.store.as_ref(),
                    &self.registry,
                    &self.gateway,
                );
                active.plugin.init(&mut ctx).await
            };
            match outcome {
                Ok(()) => {
                    info!(plugin = %id, "plugin initialized");
                    self.plugins.push(active);
                }
                Err(e) => error!(plugin = %id, error = %e, "plugin init failed, skipping"),
            }
        }

        for (id, settings) in &config.plugins {
            if settings.enabled && !self.registered.iter().any(|d| d.id() == id) {
                warn!(plugin = %id, "no registered plugin matches configured id, skipping");
            }
        }

        info!(active = self.plugins.len(), "plugin set loaded");
    }

    /// Deinitialize and discard every active plugin.
    async fn unload_plugins(&mut self, reason: &str) {
        if self.plugins.is_empty() {
            return;
        }
        info!(count = self.plugins.len(), reason, "unloading plugins");
        let mut plugins = std::mem::take(&mut self.plugins);
        for active in &mut plugins {
            let mut ctx = plugin_ctx(
                &active.id,
                &active.config,
                &mut active.state,
                &mut active.watches,
                self.store.as_ref(),
                &self.registry,
                &self.gateway,
            );
            if let Err(e) = active.plugin.deinit(&mut ctx).await {
                warn!(plugin = %active.id, error = %e, "plugin deinit failed");
            }
        }
    }

    /// Serve every active plugin once, in registration order.
    async fn service_plugins(&mut self) -> Result<()> {
        let mut plugins = std::mem::take(&mut self.plugins);
        let mut result = Ok(());
        for active in &mut plugins {
            if let Err(e) = self.service_one(active).await {
                result = Err(e);
                break;
            }
        }
        self.plugins = plugins;
        result
    }

    /// One plugin's share of a tick: hooks around its watches, then the
    /// reconcile predicate.
    async fn service_one(&self, active: &mut ActivePlugin) -> Result<()> {
        {
            let mut ctx = plugin_ctx(
                &active.id,
                &active.config,
                &mut active.state,
                &mut active.watches,
                self.store.as_ref(),
                &self.registry,
                &self.gateway,
            );
            if let Err(e) = active.plugin.pre_read_watches(&mut ctx).await {
                warn!(plugin = %active.id, error = %e, "pre_read_watches failed");
            }
        }

        let events = active.watches.advance(WATCH_BUDGET).await?;
        for (watch, event) in events {
            let mut ctx = plugin_ctx(
                &active.id,
                &active.config,
                &mut active.state,
                &mut active.watches,
                self.store.as_ref(),
                &self.registry,
                &self.gateway,
            );
            active.plugin.on_watch_event(&mut ctx, &watch, event).await;
        }

        {
            let mut ctx = plugin_ctx(
                &active.id,
                &active.config,
                &mut active.state,
                &mut active.watches,
                self.store.as_ref(),
                &self.registry,
                &self.gateway,
            );
            if let Err(e) = active.plugin.post_read_watches(&mut ctx).await {
                warn!(plugin = %active.id, error = %e, "post_read_watches failed");
            }
        }

        let ready = ready_for_action(
            &active.state,
            active.plugin.settle_time(),
            active.plugin.throttle_time(),
            self.options.failed_action_wait,
            Instant::now(),
        );
        if ready {
            self.invoke_action(active).await;
        }

        Ok(())
    }

    /// Run `do_action` with full bookkeeping.
    ///
    /// The latch is released before the action so a `mark_action_required`
    /// inside it registers a fresh edge that survives success; failure
    /// restores the latch without moving the edge.
    async fn invoke_action(&self, active: &mut ActivePlugin) {
        let attempt = Instant::now();
        active.state.begin_attempt(attempt);
        debug!(plugin = %active.id, "invoking action");

        let outcome = {
            let mut ctx = plugin_ctx(
                &active.id,
                &active.config,
                &mut active.state,
                &mut active.watches,
                self.store.as_ref(),
                &self.registry,
                &self.gateway,
            );
            active.plugin.do_action(&mut ctx).await
        };

        match outcome {
            Ok(true) => {
                active.state.record_success(attempt);
                info!(plugin = %active.id, "action succeeded");
            }
            Ok(false) => {
                active.state.record_failure(attempt);
                warn!(plugin = %active.id, "action failed, backing off");
            }
            Err(e) => {
                active.state.record_failure(attempt);
                warn!(plugin = %active.id, error = %e, "action failed, backing off");
            }
        }
    }
}

/// Assemble a plugin context from its borrowed parts.
#[allow(clippy::too_many_arguments)]
fn plugin_ctx<'a>(
    plugin_id: &'a str,
    config: &'a Value,
    state: &'a mut ActionState,
    watches: &'a mut WatchSet,
    store: Option<&'a Store>,
    registry: &'a Registry,
    gateway: &'a Arc<dyn ClusterGateway>,
) -> PluginContext<'a> {
    PluginContext {
        plugin_id,
        config,
        state,
        watches,
        store,
        registry,
        gateway,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockClusterGateway;
    use crate::plugin::Plugin;
    use crate::watch::WatchHandle;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// Shared journal of hook invocations, written by recorder plugins
    type Journal = Arc<Mutex<Vec<String>>>;

    /// Test plugin that records every hook call and follows a script of
    /// do_action outcomes.
    struct Recorder {
        name: &'static str,
        journal: Journal,
        outcomes: Vec<bool>,
        latch_on_init: bool,
    }

    impl Recorder {
        fn descriptor(
            id: &'static str,
            journal: &Journal,
            outcomes: Vec<bool>,
            latch_on_init: bool,
        ) -> PluginDescriptor {
            let journal = journal.clone();
            PluginDescriptor::new(id, move || {
                Box::new(Recorder {
                    name: id,
                    journal: journal.clone(),
                    outcomes: outcomes.clone(),
                    latch_on_init,
                })
            })
        }

        fn log(&self, entry: &str) {
            self.journal
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, entry));
        }
    }

    #[async_trait]
    impl Plugin for Recorder {
        async fn init(&mut self, ctx: &mut PluginContext<'_>) -> coxswain_common::Result<()> {
            self.log("init");
            if self.latch_on_init {
                ctx.mark_action_required();
            }
            Ok(())
        }

        async fn deinit(&mut self, _ctx: &mut PluginContext<'_>) -> coxswain_common::Result<()> {
            self.log("deinit");
            Ok(())
        }

        async fn pre_read_watches(
            &mut self,
            _ctx: &mut PluginContext<'_>,
        ) -> coxswain_common::Result<()> {
            self.log("pre");
            Ok(())
        }

        async fn on_watch_event(
            &mut self,
            ctx: &mut PluginContext<'_>,
            watch: &str,
            event: WatchEvent,
        ) {
            self.log(&format!("event:{}:{}", watch, event.type_str()));
            ctx.mark_action_required();
        }

        async fn post_read_watches(
            &mut self,
            _ctx: &mut PluginContext<'_>,
        ) -> coxswain_common::Result<()> {
            self.log("post");
            Ok(())
        }

        async fn do_action(&mut self, _ctx: &mut PluginContext<'_>) -> coxswain_common::Result<bool> {
            self.log("action");
            Ok(if self.outcomes.is_empty() {
                true
            } else {
                self.outcomes.remove(0)
            })
        }
    }

    fn config_event(doc: &str) -> WatchEvent {
        WatchEvent::Added(json!({
            "kind": "ConfigMap",
            "metadata": {"name": "coxswain-config", "namespace": "kube-system"},
            "data": {"config": doc},
        }))
    }

    fn new_controller() -> Controller {
        let mut options = ControllerOptions::default();
        options.store_enabled = false;
        Controller::new(Arc::new(MockClusterGateway::new()), options)
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let journal = Journal::default();
        let mut controller = new_controller();
        controller
            .register_plugin(Recorder::descriptor("p1", &journal, vec![], false))
            .unwrap();
        let err = controller
            .register_plugin(Recorder::descriptor("p1", &journal, vec![], false))
            .unwrap_err();
        assert!(matches!(err, Error::Registration { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn config_load_constructs_enabled_plugins_in_registration_order() {
        let journal = Journal::default();
        let mut controller = new_controller();
        // Registered b-first to show registration order wins over config order
        controller
            .register_plugin(Recorder::descriptor("p-b", &journal, vec![], false))
            .unwrap();
        controller
            .register_plugin(Recorder::descriptor("p-a", &journal, vec![], false))
            .unwrap();

        controller
            .apply_config_event(config_event(
                "enabled: true\nplugins:\n  p-a:\n    enabled: true\n  p-b:\n    enabled: true\n  p-off:\n    enabled: false\n  p-unknown:\n    enabled: true\n",
            ))
            .await;

        let ids: Vec<_> = controller.plugins.iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids, vec!["p-b", "p-a"]);
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["p-b:init", "p-a:init"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn master_switch_off_leaves_no_plugins() {
        let journal = Journal::default();
        let mut controller = new_controller();
        controller
            .register_plugin(Recorder::descriptor("p1", &journal, vec![], false))
            .unwrap();

        controller
            .apply_config_event(config_event(
                "enabled: false\nplugins:\n  p1:\n    enabled: true\n",
            ))
            .await;

        assert!(controller.plugins.is_empty());
        assert!(controller.config.is_some());
        assert!(journal.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reload_deinits_previous_instances_exactly_once() {
        let journal = Journal::default();
        let mut controller = new_controller();
        controller
            .register_plugin(Recorder::descriptor("p1", &journal, vec![], false))
            .unwrap();

        controller
            .apply_config_event(config_event(
                "enabled: true\nplugins:\n  p1:\n    enabled: true\n",
            ))
            .await;
        controller
            .apply_config_event(config_event(
                "enabled: true\nplugins:\n  p1:\n    enabled: false\n",
            ))
            .await;

        assert!(controller.plugins.is_empty());
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["p1:init", "p1:deinit"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn config_deletion_unloads_everything() {
        let journal = Journal::default();
        let mut controller = new_controller();
        controller
            .register_plugin(Recorder::descriptor("p1", &journal, vec![], false))
            .unwrap();

        controller
            .apply_config_event(config_event(
                "enabled: true\nplugins:\n  p1:\n    enabled: true\n",
            ))
            .await;
        controller
            .apply_config_event(WatchEvent::Deleted(json!({})))
            .await;

        assert!(controller.config.is_none());
        assert!(controller.plugins.is_empty());
        assert_eq!(*journal.lock().unwrap(), vec!["p1:init", "p1:deinit"]);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_config_unloads_and_clears() {
        let journal = Journal::default();
        let mut controller = new_controller();
        controller
            .register_plugin(Recorder::descriptor("p1", &journal, vec![], false))
            .unwrap();

        controller
            .apply_config_event(config_event(
                "enabled: true\nplugins:\n  p1:\n    enabled: true\n",
            ))
            .await;
        controller
            .apply_config_event(config_event("enabled: [broken"))
            .await;

        assert!(controller.config.is_none());
        assert!(controller.plugins.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_init_skips_the_instance() {
        struct FailingInit;

        #[async_trait]
        impl Plugin for FailingInit {
            async fn init(&mut self, _ctx: &mut PluginContext<'_>) -> coxswain_common::Result<()> {
                Err(Error::plugin("p-bad", "no upstream device"))
            }
            async fn do_action(
                &mut self,
                _ctx: &mut PluginContext<'_>,
            ) -> coxswain_common::Result<bool> {
                Ok(true)
            }
        }

        let journal = Journal::default();
        let mut controller = new_controller();
        controller
            .register_plugin(PluginDescriptor::new("p-bad", || Box::new(FailingInit)))
            .unwrap();
        controller
            .register_plugin(Recorder::descriptor("p-good", &journal, vec![], false))
            .unwrap();

        controller
            .apply_config_event(config_event(
                "enabled: true\nplugins:\n  p-bad:\n    enabled: true\n  p-good:\n    enabled: true\n",
            ))
            .await;

        let ids: Vec<_> = controller.plugins.iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids, vec!["p-good"]);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_serves_hooks_around_events_and_fires_the_action() {
        let journal = Journal::default();
        let mut controller = new_controller();
        controller
            .register_plugin(Recorder::descriptor("p1", &journal, vec![], false))
            .unwrap();
        controller
            .apply_config_event(config_event(
                "enabled: true\nplugins:\n  p1:\n    enabled: true\n",
            ))
            .await;

        // Feed an event into the plugin's own watch set
        let (handle, tx) = WatchHandle::channel("services");
        controller.plugins[0].watches.add(handle);
        tx.send(Ok(WatchEvent::Added(json!({"metadata": {"name": "svc-1"}}))))
            .unwrap();

        controller.service_plugins().await.unwrap();

        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                "p1:init",
                "p1:pre",
                "p1:event:services:ADDED",
                "p1:post",
                "p1:action",
            ]
        );
        assert!(!controller.plugins[0].state.action_required());
        assert!(controller.plugins[0].state.last_action_success());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_action_keeps_the_latch_and_backs_off() {
        let journal = Journal::default();
        let mut controller = new_controller();
        controller
            .register_plugin(Recorder::descriptor("p1", &journal, vec![false, true], true))
            .unwrap();
        controller
            .apply_config_event(config_event(
                "enabled: true\nplugins:\n  p1:\n    enabled: true\n",
            ))
            .await;

        controller.service_plugins().await.unwrap();
        assert!(controller.plugins[0].state.action_required());
        assert!(!controller.plugins[0].state.last_action_success());

        // Within the back-off window nothing fires
        controller.service_plugins().await.unwrap();
        let actions = journal
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.ends_with(":action"))
            .count();
        assert_eq!(actions, 1);

        // Past the back-off window the retry succeeds
        tokio::time::advance(controller.options.failed_action_wait + Duration::from_millis(1))
            .await;
        controller.service_plugins().await.unwrap();
        assert!(!controller.plugins[0].state.action_required());
        assert!(controller.plugins[0].state.last_action_success());
    }

    #[tokio::test(start_paused = true)]
    async fn latch_from_init_fires_on_first_service_pass() {
        let journal = Journal::default();
        let mut controller = new_controller();
        controller
            .register_plugin(Recorder::descriptor("p1", &journal, vec![], true))
            .unwrap();
        controller
            .apply_config_event(config_event(
                "enabled: true\nplugins:\n  p1:\n    enabled: true\n",
            ))
            .await;

        assert!(controller.plugins[0].state.action_required());
        controller.service_plugins().await.unwrap();
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["p1:init", "p1:pre", "p1:post", "p1:action"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn controller_id_override_comes_from_config() {
        let mut controller = new_controller();
        assert_eq!(controller.controller_id(), "coxswain");

        controller
            .apply_config_event(config_event("enabled: true\ncontroller-id: edge-1\n"))
            .await;
        assert_eq!(controller.controller_id(), "edge-1");

        controller
            .apply_config_event(WatchEvent::Deleted(json!({})))
            .await;
        assert_eq!(controller.controller_id(), "coxswain");
    }
}
