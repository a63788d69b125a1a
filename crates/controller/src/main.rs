//! Pod Resource Controller
//!
//! Watches `PodResourcePolicy` objects and pods, and replaces any governed
//! pod whose container resources differ from its policy.

use anyhow::{Context, Result};
use clap::Parser;
use controller_lib::{
    health::{components, HealthRegistry},
    observability::StructuredLogger,
    reconcile::{Reconciler, ResyncScheduler, WorkerPool},
    PolicyIndex,
};
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, CustomResourceExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod cluster;
mod config;
mod crd;
mod watch;

use cluster::KubeCluster;
use config::{Args, ControllerConfig};
use crd::PodResourcePolicy;
use watch::WatchContext;

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

async fn build_client(in_cluster: bool) -> Result<Client> {
    if in_cluster {
        let config = kube::Config::incluster().context("failed to load in-cluster configuration")?;
        Client::try_from(config).context("failed to build Kubernetes client")
    } else {
        Client::try_default()
            .await
            .context("failed to build Kubernetes client from kubeconfig")
    }
}

fn namespaced<K>(client: Client, namespace: &str) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    if namespace.is_empty() {
        Api::all(client)
    } else {
        Api::namespaced(client, namespace)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        println!("{}", serde_json::to_string_pretty(&PodResourcePolicy::crd())?);
        return Ok(());
    }

    // Initialize tracing with JSON output and env filter
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(fmt::layer().json())
        .init();

    // Load configuration
    let config = ControllerConfig::load()?.with_args(&args);
    info!(
        namespace = %config.watch_namespace(),
        dry_run = config.dry_run,
        instance_workers = config.instance_workers,
        "Controller configured"
    );

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    for name in components::ALL {
        health_registry.register(name).await;
    }

    // Initialize structured logger
    let logger = StructuredLogger::new(&config.controller_name);
    logger.log_startup(CONTROLLER_VERSION, config.namespace.as_deref(), config.dry_run);

    let client = build_client(args.in_cluster).await?;
    let cluster = Arc::new(KubeCluster::new(client.clone()));

    let index = Arc::new(PolicyIndex::new());
    let reconciler = Arc::new(Reconciler::new(
        index.clone(),
        cluster.clone(),
        cluster.clone(),
        config.executor_config(),
        config.reconciler_config(),
        logger.clone(),
    ));
    let (pool, channels) = WorkerPool::new(reconciler, config.worker_config());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Start health server
    let app_state = Arc::new(api::AppState::new(health_registry.clone()));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, shutdown_tx.subscribe()));

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(watch::run_policy_watcher(
        namespaced::<PodResourcePolicy>(client.clone(), config.watch_namespace()),
        channels.policy_tx.clone(),
        WatchContext {
            health: health_registry.clone(),
            logger: logger.clone(),
        },
        shutdown_tx.subscribe(),
    )));
    tasks.push(tokio::spawn(watch::run_pod_watcher(
        namespaced::<Pod>(client.clone(), config.watch_namespace()),
        channels.instance_tx.clone(),
        WatchContext {
            health: health_registry.clone(),
            logger: logger.clone(),
        },
        shutdown_tx.subscribe(),
    )));

    if let Some(resync) = config.resync_config() {
        let scheduler = ResyncScheduler::new(index, cluster, channels.instance_tx.clone(), resync);
        tasks.push(tokio::spawn(scheduler.run(shutdown_tx.subscribe())));
    }
    // Producers hold their own senders; the pool stops once they are gone
    drop(channels);

    let pool_health = health_registry.clone();
    let pool_shutdown = shutdown_tx.clone();
    let pool_handle = tokio::spawn(async move {
        pool.run(pool_shutdown).await;
        pool_health
            .set_unhealthy(components::RECONCILER, "reconcile workers stopped")
            .await;
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    let _ = shutdown_tx.send(());

    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Watch task terminated abnormally");
        }
    }
    if let Err(e) = pool_handle.await {
        warn!(error = %e, "Reconcile workers terminated abnormally");
    }
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server failed"),
        Err(e) => warn!(error = %e, "API server task terminated abnormally"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}
