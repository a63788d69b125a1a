//! Watch streams feeding the reconcile workers
//!
//! `kube::runtime::watcher` reports `Applied`, `Deleted` and, after every
//! (re)list, `Restarted`. The reconciler wants added/modified/deleted, so
//! each stream keeps the last object seen per key and translates.

use crate::cluster::instance_from_pod;
use crate::crd::{policy_document, PodResourcePolicy};
use controller_lib::health::components;
use controller_lib::models::{InstanceEvent, PolicyEvent, TransportError};
use controller_lib::{HealthRegistry, StructuredLogger};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Debug;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// A watch event after normalization
#[derive(Debug, Clone, PartialEq)]
pub enum Change<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

/// Tracks which objects the stream has reported
pub struct EventNormalizer<K> {
    known: HashMap<String, K>,
}

impl<K> Default for EventNormalizer<K> {
    fn default() -> Self {
        Self {
            known: HashMap::new(),
        }
    }
}

fn object_key<K: Resource>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

impl<K: Resource + Clone> EventNormalizer<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn normalize(&mut self, event: watcher::Event<K>) -> Vec<Change<K>> {
        match event {
            watcher::Event::Applied(obj) => {
                let seen = self.known.insert(object_key(&obj), obj.clone()).is_some();
                if seen {
                    vec![Change::Modified(obj)]
                } else {
                    vec![Change::Added(obj)]
                }
            }
            watcher::Event::Deleted(obj) => {
                self.known.remove(&object_key(&obj));
                vec![Change::Deleted(obj)]
            }
            watcher::Event::Restarted(objs) => {
                let mut previous = std::mem::take(&mut self.known);
                let mut changes = Vec::with_capacity(objs.len());
                for obj in objs {
                    let key = object_key(&obj);
                    let change = if previous.remove(&key).is_some() {
                        Change::Modified(obj.clone())
                    } else {
                        Change::Added(obj.clone())
                    };
                    self.known.insert(key, obj);
                    changes.push(change);
                }
                // Whatever the relist no longer contains was deleted while
                // the stream was down
                changes.extend(previous.into_values().map(Change::Deleted));
                changes
            }
        }
    }
}

pub fn policy_event(change: Change<PodResourcePolicy>) -> Result<PolicyEvent, TransportError> {
    Ok(match change {
        Change::Added(p) => PolicyEvent::Added(policy_document(&p)?),
        Change::Modified(p) => PolicyEvent::Modified(policy_document(&p)?),
        Change::Deleted(p) => PolicyEvent::Deleted(policy_document(&p)?),
    })
}

pub fn instance_event(change: Change<Pod>) -> Result<InstanceEvent, TransportError> {
    Ok(match change {
        Change::Added(p) => InstanceEvent::Added(instance_from_pod(&p)?),
        Change::Modified(p) => InstanceEvent::Modified(instance_from_pod(&p)?),
        Change::Deleted(p) => InstanceEvent::Deleted(instance_from_pod(&p)?),
    })
}

/// Shared by both watchers
pub struct WatchContext {
    pub health: HealthRegistry,
    pub logger: StructuredLogger,
}

pub async fn run_policy_watcher(
    api: Api<PodResourcePolicy>,
    events: mpsc::Sender<PolicyEvent>,
    ctx: WatchContext,
    shutdown: broadcast::Receiver<()>,
) {
    // Readiness follows the first complete policy list: instances are only
    // matched correctly once every policy is indexed.
    pump(components::POLICY_WATCHER, api, policy_event, events, ctx, true, shutdown).await
}

pub async fn run_pod_watcher(
    api: Api<Pod>,
    events: mpsc::Sender<InstanceEvent>,
    ctx: WatchContext,
    shutdown: broadcast::Receiver<()>,
) {
    pump(components::POD_WATCHER, api, instance_event, events, ctx, false, shutdown).await
}

async fn pump<K, E, F>(
    component: &'static str,
    api: Api<K>,
    convert: F,
    events: mpsc::Sender<E>,
    ctx: WatchContext,
    ready_on_sync: bool,
    mut shutdown: broadcast::Receiver<()>,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    F: Fn(Change<K>) -> Result<E, TransportError>,
{
    info!(component = component, "Starting watch stream");

    let stream = watcher(api, watcher::Config::default()).default_backoff();
    tokio::pin!(stream);
    let mut normalizer = EventNormalizer::new();

    loop {
        tokio::select! {
            item = stream.next() => {
                let Some(item) = item else {
                    ctx.health.set_unhealthy(component, "watch stream ended").await;
                    warn!(component = component, "Watch stream ended");
                    break;
                };

                let event = match item {
                    Ok(event) => event,
                    Err(e) => {
                        let err = TransportError::Stream(e.to_string());
                        warn!(component = component, error = %err, "Watch stream error, retrying");
                        ctx.health.set_degraded(component, err.to_string()).await;
                        continue;
                    }
                };

                let synced = matches!(event, watcher::Event::Restarted(_));
                let mut dropped = None;
                for change in normalizer.normalize(event) {
                    match convert(change) {
                        Ok(normalized) => {
                            if events.send(normalized).await.is_err() {
                                debug!(component = component, "Event channel closed");
                                return;
                            }
                        }
                        Err(err) => {
                            ctx.logger.log_dropped_event(component, &err.to_string());
                            dropped = Some(err.to_string());
                        }
                    }
                }

                match dropped {
                    Some(reason) => ctx.health.set_degraded(component, reason).await,
                    None => ctx.health.set_healthy(component).await,
                }
                if synced {
                    debug!(
                        component = component,
                        objects = normalizer.len(),
                        "Watch stream synced"
                    );
                    if ready_on_sync {
                        ctx.health.set_ready(true).await;
                    }
                }
            }
            _ = shutdown.recv() => {
                info!(component = component, "Shutting down watch stream");
                break;
            }
        }
    }
}
