//! Controller configuration
//!
//! Values come from `CONTROLLER_*` environment variables, then command-line
//! flags override them.

use anyhow::{Context, Result};
use clap::Parser;
use controller_lib::reconcile::{ExecutorConfig, ReconcilerConfig, ResyncConfig, WorkerConfig};
use controller_lib::resources::ComparatorConfig;
use serde::Deserialize;
use std::time::Duration;

/// Pod resource controller
#[derive(Parser, Debug, Default)]
#[command(name = "pod-resource-controller")]
#[command(author, version, long_about = None)]
#[command(about = "Keeps pod resources in line with PodResourcePolicy objects")]
pub struct Args {
    /// Namespace to watch (all namespaces if not specified)
    #[arg(long, short)]
    pub namespace: Option<String>,

    /// Report what would be replaced without touching any pod
    #[arg(long)]
    pub dry_run: bool,

    /// Use the in-cluster service account instead of the local kubeconfig
    #[arg(long)]
    pub in_cluster: bool,

    /// Enable debug logging
    #[arg(long, short)]
    pub verbose: bool,

    /// Port for the health endpoints
    #[arg(long)]
    pub api_port: Option<u16>,

    /// Print the PodResourcePolicy CustomResourceDefinition as JSON and exit
    #[arg(long)]
    pub print_crd: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControllerConfig {
    /// Name used in structured logs, from the downward API
    #[serde(default = "default_controller_name")]
    pub controller_name: String,

    /// Namespace to watch; unset or empty means every namespace
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub dry_run: bool,

    /// API server port for health endpoints
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_delete_timeout")]
    pub delete_timeout_secs: u64,

    #[serde(default = "default_delete_poll_interval")]
    pub delete_poll_interval_ms: u64,

    #[serde(default = "default_instance_workers")]
    pub instance_workers: usize,

    /// Seconds between periodic resyncs; 0 disables them
    #[serde(default)]
    pub resync_interval_secs: u64,

    #[serde(default)]
    pub sweep_on_policy_change: bool,

    #[serde(default)]
    pub cpu_tolerance_millis: u64,

    #[serde(default)]
    pub memory_tolerance_bytes: u64,

    /// Capacity of each event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_controller_name() -> String {
    std::env::var("POD_NAME").unwrap_or_else(|_| "pod-resource-controller".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_delete_timeout() -> u64 {
    30
}

fn default_delete_poll_interval() -> u64 {
    500
}

fn default_instance_workers() -> usize {
    4
}

fn default_event_buffer() -> usize {
    256
}

impl ControllerConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("CONTROLLER").try_parsing(true))
            .build()?;
        Self::from_config(config)
    }

    fn from_config(config: config::Config) -> Result<Self> {
        let mut loaded: Self = config
            .try_deserialize()
            .context("invalid controller configuration")?;
        loaded.namespace = loaded.namespace.filter(|ns| !ns.is_empty());
        Ok(loaded)
    }

    /// Command-line flags take precedence over the environment
    pub fn with_args(mut self, args: &Args) -> Self {
        if let Some(namespace) = &args.namespace {
            self.namespace = Some(namespace.clone()).filter(|ns| !ns.is_empty());
        }
        if args.dry_run {
            self.dry_run = true;
        }
        if let Some(port) = args.api_port {
            self.api_port = port;
        }
        self
    }

    /// Namespace for list/watch calls; empty means all namespaces
    pub fn watch_namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or("")
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::default()
            .delete_timeout(Duration::from_secs(self.delete_timeout_secs))
            .poll_interval(Duration::from_millis(self.delete_poll_interval_ms))
            .dry_run(self.dry_run)
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig::default()
            .comparator(ComparatorConfig {
                cpu_tolerance_millis: self.cpu_tolerance_millis,
                memory_tolerance_bytes: self.memory_tolerance_bytes,
            })
            .sweep_on_policy_change(self.sweep_on_policy_change)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .instance_workers(self.instance_workers)
            .buffer_size(self.event_buffer)
    }

    pub fn resync_config(&self) -> Option<ResyncConfig> {
        (self.resync_interval_secs > 0).then(|| ResyncConfig {
            interval: Duration::from_secs(self.resync_interval_secs),
        })
    }
}
