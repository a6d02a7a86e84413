//! Kubernetes resource watchers.
//!
//! This module handles watching nodes and pods and feeding their changes to
//! the reconciler. Nodes are applied as they arrive; pods go through the
//! sequential [`PodEventHandler`] together with the retry and sweep timers.

use crate::error::ControllerError;
use crate::events::PodEventHandler;
use crate::node::NodeInfo;
use crate::reconciler::Reconciler;
use crate::workload::Workload;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::Api;
use kube_runtime::{WatchStreamExt, watcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Namespace annotation enabling multicast for its pods
pub const MULTICAST_ENABLED_ANNOTATION: &str = "k8s.ovn.org/multicast-enabled";

const RETRY_TICK: Duration = Duration::from_secs(1);

/// Watches nodes and keeps allocator pools in step with their subnets.
pub struct NodeWatcher {
    reconciler: Arc<Reconciler>,
    node_api: Api<Node>,
    no_host_subnet_label: Option<String>,
}

impl NodeWatcher {
    pub fn new(reconciler: Arc<Reconciler>, node_api: Api<Node>, no_host_subnet_label: Option<String>) -> Self {
        Self {
            reconciler,
            node_api,
            no_host_subnet_label,
        }
    }

    /// Watch nodes until the stream ends. `ready` fires once the initial
    /// listing has been applied.
    pub async fn run(self, ready: oneshot::Sender<()>) -> Result<(), ControllerError> {
        info!("Starting node watcher");
        let mut ready = Some(ready);
        let mut stream = Box::pin(watcher(self.node_api.clone(), watcher::Config::default()).default_backoff());

        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Apply(node)) | Ok(watcher::Event::InitApply(node)) => self.apply(&node),
                Ok(watcher::Event::Delete(node)) => {
                    if let Some(name) = node.metadata.name.as_deref() {
                        info!("Node deleted: {}", name);
                        self.reconciler.delete_node(name);
                    }
                }
                Ok(watcher::Event::Init) => debug!("Node watcher listing started"),
                Ok(watcher::Event::InitDone) => {
                    info!("Node watcher initialization complete");
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(());
                    }
                }
                Err(e) => warn!("Node watch error: {}", e),
            }
        }
        Ok(())
    }

    fn apply(&self, node: &Node) {
        let info = match NodeInfo::from_node(node, self.no_host_subnet_label.as_deref()) {
            Ok(info) => info,
            Err(e) => {
                error!("Ignoring node {:?}: {}", node.metadata.name, e);
                return;
            }
        };
        if let Err(e) = self.reconciler.sync_node(&info) {
            error!("Failed to sync address pool of node {}: {}", info.name, e);
        }
    }
}

/// Watches pods and drives port reconciliation.
pub struct PodWatcher {
    handler: PodEventHandler,
    pod_api: Api<Pod>,
    /// Set when multicast is enabled
    namespace_api: Option<Api<Namespace>>,
    sweep_interval: Duration,
}

impl PodWatcher {
    pub fn new(
        handler: PodEventHandler,
        pod_api: Api<Pod>,
        namespace_api: Option<Api<Namespace>>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            handler,
            pod_api,
            namespace_api,
            sweep_interval,
        }
    }

    /// Watch pods until the stream ends.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Starting pod watcher");
        let mut stream = Box::pin(watcher(self.pod_api.clone(), watcher::Config::default()).default_backoff());

        let mut retry_tick = tokio::time::interval(RETRY_TICK);
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval_at panics on a zero period
        let sweep_period = self.sweep_interval.max(RETRY_TICK);
        let mut sweep_tick = tokio::time::interval_at(Instant::now() + sweep_period, sweep_period);
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = stream.try_next() => match event {
                    Ok(Some(event)) => self.handle(event).await,
                    Ok(None) => break,
                    Err(e) => warn!("Pod watch error: {}", e),
                },
                _ = retry_tick.tick() => self.handler.retry_due(Instant::now()).await,
                _ = sweep_tick.tick() => self.handler.sweep().await,
            }
        }
        warn!("Pod watch stream ended");
        Ok(())
    }

    async fn handle(&mut self, event: watcher::Event<Pod>) {
        match event {
            watcher::Event::Init => {
                debug!("Pod watcher listing started");
                self.handler.begin_listing();
            }
            watcher::Event::InitApply(pod) => {
                if let Some(workload) = self.workload(&pod).await {
                    self.handler.listed(workload);
                }
            }
            watcher::Event::InitDone => {
                info!("Pod watcher initialization complete");
                self.handler.finish_listing().await;
            }
            watcher::Event::Apply(pod) => {
                if let Some(workload) = self.workload(&pod).await {
                    debug!("Pod applied: {}", workload.key());
                    self.handler.apply(workload).await;
                }
            }
            watcher::Event::Delete(pod) => {
                if let Some(workload) = self.workload(&pod).await {
                    info!("Pod deleted: {}", workload.key());
                    self.handler.delete(workload).await;
                }
            }
        }
    }

    async fn workload(&self, pod: &Pod) -> Option<Workload> {
        let mut workload = match Workload::from_pod(pod) {
            Ok(workload) => workload,
            Err(e) => {
                error!("Ignoring pod: {}", e);
                return None;
            }
        };
        if let Some(namespaces) = &self.namespace_api {
            workload.multicast_enabled = multicast_enabled(namespaces, &workload.namespace).await;
        }
        Some(workload)
    }
}

async fn multicast_enabled(namespaces: &Api<Namespace>, name: &str) -> bool {
    match namespaces.get_opt(name).await {
        Ok(Some(namespace)) => namespace_allows_multicast(&namespace),
        Ok(None) => false,
        Err(e) => {
            warn!("Cannot read namespace {}: {}", name, e);
            false
        }
    }
}

fn namespace_allows_multicast(namespace: &Namespace) -> bool {
    namespace
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(MULTICAST_ENABLED_ANNOTATION))
        .is_some_and(|value| value == "true")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    #[test]
    fn test_namespace_multicast_annotation() {
        let mut namespace = Namespace {
            metadata: ObjectMeta {
                name: Some("team-a".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!namespace_allows_multicast(&namespace));

        namespace.metadata.annotations = Some(BTreeMap::from([(
            MULTICAST_ENABLED_ANNOTATION.to_string(),
            "true".to_string(),
        )]));
        assert!(namespace_allows_multicast(&namespace));
    }
}
