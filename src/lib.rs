//! Coxswain, a pluggable Kubernetes controller framework
//!
//! A coxswain process watches cluster resources through streaming watches
//! and drives user-written [`Plugin`]s whose job is to reconcile external
//! state (a firewall, an ingress device, a DNS provider) against the
//! cluster's declared state. The framework supplies the recurring parts of
//! a controller:
//!
//! - live configuration loaded (and hot-reloaded) from a cluster ConfigMap,
//! - replay-safe watch plumbing marshaled onto a single scheduler task,
//! - idempotent action scheduling under settle/throttle/back-off gates,
//! - a ConfigMap-backed persistent store with watch-driven cache refresh.
//!
//! Embedding sketch:
//!
//! ```no_run
//! use std::sync::Arc;
//! use coxswain::{Controller, ControllerOptions, KubeGateway, PluginDescriptor};
//! # struct FirewallSync;
//! # #[async_trait::async_trait]
//! # impl coxswain::Plugin for FirewallSync {
//! #     async fn do_action(&mut self, _ctx: &mut coxswain::PluginContext<'_>) -> coxswain::Result<bool> { Ok(true) }
//! # }
//!
//! # #[tokio::main]
//! # async fn main() -> coxswain::Result<()> {
//! let gateway = Arc::new(KubeGateway::try_default().await?);
//! let mut controller = Controller::new(gateway, ControllerOptions::new("edge-1"));
//! controller.register_plugin(PluginDescriptor::new("fw-sync", || Box::new(FirewallSync)))?;
//! controller.run().await
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod gateway;
pub mod plugin;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod watch;

pub use coxswain_common::{Error, Result};

pub use config::{ControllerConfig, ControllerOptions, PluginSettings};
pub use controller::Controller;
pub use gateway::{ClusterGateway, KubeGateway};
pub use plugin::{Plugin, PluginContext, PluginDescriptor};
pub use registry::Registry;
pub use scheduler::ActionState;
pub use store::Store;
pub use watch::{WatchEvent, WatchHandle, WatchParams, WatchSet};
