//! Coxswain controller binary
//!
//! Runs the framework with the plugin descriptors compiled into this
//! binary. Downstream controllers link the library, register their own
//! descriptors, and reuse this entry point shape.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use coxswain::gateway::{create_client, KubeGateway};
use coxswain::{Controller, ControllerOptions};

/// Pluggable Kubernetes controller framework
#[derive(Parser, Debug)]
#[command(name = "coxswain", version, about, long_about = None)]
struct Cli {
    /// Controller identity prefix for managed resources
    #[arg(long, default_value = "coxswain")]
    controller_id: String,

    /// Namespace of the config ConfigMap
    #[arg(long)]
    config_namespace: Option<String>,

    /// Name of the config ConfigMap (default "{controller-id}-config")
    #[arg(long)]
    config_name: Option<String>,

    /// Disable the persistent store
    #[arg(long)]
    disable_store: bool,

    /// Namespace of the store ConfigMap
    #[arg(long)]
    store_namespace: Option<String>,

    /// Name of the store ConfigMap (default "{controller-id}-store")
    #[arg(long)]
    store_name: Option<String>,

    /// Path to a kubeconfig file (default: in-cluster or environment config)
    #[arg(long)]
    kubeconfig: Option<PathBuf>,
}

impl Cli {
    fn options(&self) -> ControllerOptions {
        let mut options = ControllerOptions::new(self.controller_id.clone());
        if let Some(ns) = &self.config_namespace {
            options.config_namespace = ns.clone();
        }
        if let Some(name) = &self.config_name {
            options.config_name = name.clone();
        }
        if let Some(ns) = &self.store_namespace {
            options.store_namespace = ns.clone();
        }
        if let Some(name) = &self.store_name {
            options.store_name = name.clone();
        }
        options.store_enabled = !self.disable_store;
        options
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = create_client(cli.kubeconfig.as_deref()).await?;
    let controller = Controller::new(Arc::new(KubeGateway::new(client)), cli.options());

    if let Err(e) = controller.run().await {
        tracing::error!(error = %e, "controller terminated");
        std::process::exit(1);
    }
    Ok(())
}
