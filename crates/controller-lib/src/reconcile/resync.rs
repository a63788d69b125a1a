//! Periodic resync
//!
//! Re-emits every pod in the namespaces targeted by indexed policies as a
//! synthetic `Modified` event. It holds no reconcile logic of its own; the
//! worker pool treats these events like any other.

use super::ClusterClient;
use crate::models::InstanceEvent;
use crate::policy::PolicyIndex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ResyncConfig {
    /// Time between passes (default: 30 seconds)
    pub interval: Duration,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

pub struct ResyncScheduler {
    index: Arc<PolicyIndex>,
    cluster: Arc<dyn ClusterClient>,
    events: mpsc::Sender<InstanceEvent>,
    config: ResyncConfig,
}

impl ResyncScheduler {
    pub fn new(
        index: Arc<PolicyIndex>,
        cluster: Arc<dyn ClusterClient>,
        events: mpsc::Sender<InstanceEvent>,
        config: ResyncConfig,
    ) -> Self {
        Self {
            index,
            cluster,
            events,
            config,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting periodic resync"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; startup is covered by the watchers
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.resync_once().await {
                        break;
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down periodic resync");
                    break;
                }
            }
        }
    }

    /// One pass. Returns false once the event channel is closed.
    pub async fn resync_once(&self) -> bool {
        let mut emitted = 0usize;
        for namespace in self.index.target_namespaces() {
            let instances = match self.cluster.list_instances(&namespace).await {
                Ok(instances) => instances,
                Err(e) => {
                    warn!(namespace = %namespace, error = %e, "Resync listing failed");
                    continue;
                }
            };

            for instance in instances {
                if self.events.send(InstanceEvent::Modified(instance)).await.is_err() {
                    return false;
                }
                emitted += 1;
            }
        }

        debug!(pods = emitted, "Resync pass complete");
        true
    }
}
