//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the reconciler to
//! its collaborators and runs the node and pod watchers.
//!
//! Startup order:
//! - the node watcher applies the initial node listing, so every known
//!   node has an address pool
//! - the pod watcher then lists pods, runs the startup sweep and reconciles
//!   every listed pod

use crate::annotation::KubePodAnnotationStore;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::events::PodEventHandler;
use crate::metrics::PrometheusMetrics;
use crate::reconciler::Reconciler;
use crate::watcher::{NodeWatcher, PodWatcher};
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::{Api, Client};
use nbdb_client::NbdbClientTrait;
use prometheus::Registry;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Pod network controller.
pub struct Controller {
    reconciler: Arc<Reconciler>,
    node_watcher: JoinHandle<Result<(), ControllerError>>,
    pod_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates the controller and starts its watchers.
    ///
    /// Metrics are registered into `registry`; serving them is up to the
    /// caller.
    pub async fn new(
        kube_client: Client,
        nbdb: Arc<dyn NbdbClientTrait>,
        config: ControllerConfig,
        registry: &Registry,
    ) -> Result<Self, ControllerError> {
        info!("Initializing pod network controller");
        info!("Configuration:");
        info!("  Cluster subnets: {:?}", config.cluster_subnets);
        info!("  Service subnets: {:?}", config.service_subnets);
        info!("  Hybrid overlay subnets: {:?}", config.hybrid_overlay_subnets);
        info!("  Multicast: {}", config.enable_multicast);
        info!("  Per-pod SNAT: {}", config.disable_snat_multiple_gws);
        info!(
            "  Namespace: {}",
            config.watch_namespace.as_deref().unwrap_or("all namespaces")
        );

        let metrics = Arc::new(PrometheusMetrics::new(registry)?);
        let annotations = Arc::new(KubePodAnnotationStore::new(kube_client.clone()));
        let reconciler = Arc::new(Reconciler::new(nbdb, annotations, metrics, config.clone()));

        let node_api: Api<Node> = Api::all(kube_client.clone());
        let pod_api: Api<Pod> = match config.watch_namespace.as_deref() {
            Some(ns) => Api::namespaced(kube_client.clone(), ns),
            None => Api::all(kube_client.clone()),
        };
        let namespace_api: Option<Api<Namespace>> = config
            .enable_multicast
            .then(|| Api::all(kube_client.clone()));

        let (nodes_ready, nodes_listed) = oneshot::channel();
        let node_watcher = {
            let watcher = NodeWatcher::new(
                reconciler.clone(),
                node_api,
                config.no_host_subnet_label.clone(),
            );
            tokio::spawn(async move { watcher.run(nodes_ready).await })
        };

        info!("Waiting for the initial node listing...");
        if nodes_listed.await.is_err() {
            warn!("Node watcher stopped before listing nodes; pods will wait for their switches");
        }

        let pod_watcher = {
            let watcher = PodWatcher::new(
                PodEventHandler::new(reconciler.clone()),
                pod_api,
                namespace_api,
                config.sweep_interval,
            );
            tokio::spawn(async move { watcher.run().await })
        };

        Ok(Self {
            reconciler,
            node_watcher,
            pod_watcher,
        })
    }

    /// The reconciler driven by this controller.
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Runs the controller until a watcher exits.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Pod network controller running");

        tokio::select! {
            result = &mut self.node_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("Node watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("Node watcher error: {}", e)))?;
            }
            result = &mut self.pod_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("Pod watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("Pod watcher error: {}", e)))?;
            }
        }

        warn!("Watcher exited, stopping controller");
        Ok(())
    }
}
