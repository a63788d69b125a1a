//! Event-driven worker pool
//!
//! Policy events are handled by a single worker. Instance events are routed
//! to a fixed set of shard workers by a stable hash of the pod identity, so
//! events for one pod are handled in order while different pods reconcile in
//! parallel. Sweeps triggered by policy changes go through the same shards.

use super::reconciler::{PolicyChange, Reconciler};
use crate::models::{InstanceEvent, PolicyEvent};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of instance shard workers (default: 4)
    pub instance_workers: usize,
    /// Capacity of every event channel (default: 256)
    pub buffer_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            instance_workers: 4,
            buffer_size: 256,
        }
    }
}

impl WorkerConfig {
    pub fn instance_workers(mut self, workers: usize) -> Self {
        self.instance_workers = workers;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }
}

/// Producer ends of the pool's input streams
#[derive(Debug, Clone)]
pub struct EventChannels {
    pub policy_tx: mpsc::Sender<PolicyEvent>,
    pub instance_tx: mpsc::Sender<InstanceEvent>,
}

/// Routes instance events to their shard
#[derive(Clone)]
struct Dispatcher {
    shards: Arc<Vec<mpsc::Sender<InstanceEvent>>>,
}

impl Dispatcher {
    async fn dispatch(&self, event: InstanceEvent) {
        let instance = event.instance();
        let shard = shard_for(&instance.namespace, &instance.name, self.shards.len());
        if self.shards[shard].send(event).await.is_err() {
            debug!(shard = shard, "Shard worker gone, dropping event");
        }
    }
}

/// Stable shard assignment for a pod
pub(crate) fn shard_for(namespace: &str, name: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    namespace.hash(&mut hasher);
    name.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

pub struct WorkerPool {
    reconciler: Arc<Reconciler>,
    config: WorkerConfig,
    policy_rx: mpsc::Receiver<PolicyEvent>,
    instance_rx: mpsc::Receiver<InstanceEvent>,
}

impl WorkerPool {
    pub fn new(reconciler: Arc<Reconciler>, config: WorkerConfig) -> (Self, EventChannels) {
        let capacity = config.buffer_size.max(1);
        let (policy_tx, policy_rx) = mpsc::channel(capacity);
        let (instance_tx, instance_rx) = mpsc::channel(capacity);

        let pool = Self {
            reconciler,
            config,
            policy_rx,
            instance_rx,
        };

        (pool, EventChannels { policy_tx, instance_tx })
    }

    /// Run until shutdown is signalled or every producer has gone away.
    /// An event already being handled is finished first.
    pub async fn run(self, shutdown: broadcast::Sender<()>) {
        let workers = self.config.instance_workers.max(1);
        info!(instance_workers = workers, "Starting reconcile workers");

        let mut shard_txs = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers + 2);
        for shard in 0..workers {
            let (tx, rx) = mpsc::channel(self.config.buffer_size.max(1));
            shard_txs.push(tx);
            handles.push(tokio::spawn(run_shard(
                shard,
                self.reconciler.clone(),
                rx,
                shutdown.subscribe(),
            )));
        }

        let dispatcher = Dispatcher {
            shards: Arc::new(shard_txs),
        };
        handles.push(tokio::spawn(run_policy_worker(
            self.reconciler.clone(),
            self.policy_rx,
            dispatcher.clone(),
            shutdown.subscribe(),
        )));
        handles.push(tokio::spawn(run_dispatcher(
            self.instance_rx,
            dispatcher,
            shutdown.subscribe(),
        )));

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Reconcile worker terminated abnormally");
            }
        }
        info!("Reconcile workers stopped");
    }
}

async fn run_policy_worker(
    reconciler: Arc<Reconciler>,
    mut events: mpsc::Receiver<PolicyEvent>,
    dispatcher: Dispatcher,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let change = reconciler.handle_policy_event(event).await;
                if let PolicyChange::Changed { .. } = change {
                    let instances = reconciler.sweep_candidates(&change).await;
                    debug!(pods = instances.len(), "Sweeping pods after policy change");
                    for instance in instances {
                        dispatcher.dispatch(InstanceEvent::Modified(instance)).await;
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }
    debug!("Policy worker stopped");
}

async fn run_dispatcher(
    mut events: mpsc::Receiver<InstanceEvent>,
    dispatcher: Dispatcher,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                dispatcher.dispatch(event).await;
            }
            _ = shutdown.recv() => break,
        }
    }
}

async fn run_shard(
    shard: usize,
    reconciler: Arc<Reconciler>,
    mut events: mpsc::Receiver<InstanceEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let evaluation = reconciler.handle_instance_event(event).await;
                debug!(shard = shard, ?evaluation, "Instance event handled");
            }
            _ = shutdown.recv() => break,
        }
    }
    debug!(shard = shard, "Shard worker stopped");
}
