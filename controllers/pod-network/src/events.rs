//! Pod event dispatch
//!
//! Turns pod watch events into reconciler calls. Events are handled one at a
//! time, so at most one operation is in flight for any pod, and the sweep
//! never overlaps an add or delete.

use crate::reconciler::{Reconciler, SweepMode};
use crate::retry::RetryQueue;
use crate::workload::Workload;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Sequential pod event handler with per-pod retries
#[derive(Debug)]
pub struct PodEventHandler {
    reconciler: Arc<Reconciler>,
    retries: RetryQueue,
    /// Last seen state of every pod, keyed by `namespace/name`
    pods: HashMap<String, Workload>,
    /// Pods collected during a (re)list, until it completes
    listing: Option<HashMap<String, Workload>>,
    /// Completed pods whose port has already been removed
    completed: HashSet<String>,
    /// Allocator and cache state have been rebuilt from a full listing
    restored: bool,
}

impl PodEventHandler {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self {
            reconciler,
            retries: RetryQueue::new(),
            pods: HashMap::new(),
            listing: None,
            completed: HashSet::new(),
            restored: false,
        }
    }

    /// Pods waiting for another attempt
    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    /// A pod was created or changed.
    pub async fn apply(&mut self, workload: Workload) {
        let key = workload.key();
        self.pods.insert(key.clone(), workload.clone());

        if workload.is_completed() {
            self.retries.remove(&key);
            if self.completed.contains(&key) {
                return;
            }
            info!("[{}] pod completed, removing its logical port", key);
            match self.reconciler.delete_logical_port(&workload).await {
                Ok(()) => {
                    self.completed.insert(key);
                }
                Err(e) => error!("[{}] failed to remove port of completed pod: {}", key, e),
            }
            return;
        }
        self.completed.remove(&key);

        if !workload.expects_port() {
            return;
        }
        self.add(workload).await;
    }

    async fn add(&mut self, workload: Workload) {
        let key = workload.key();
        match self.reconciler.add_logical_port(&workload).await {
            Ok(outcome) if outcome.needs_retry() => {
                let delay = self.retries.add(workload, Instant::now());
                debug!("[{}] {:?}, retrying in {:?}", key, outcome, delay);
            }
            Ok(_) => {
                self.retries.remove(&key);
            }
            Err(e) if e.is_retryable() => {
                let delay = self.retries.add(workload, Instant::now());
                warn!("[{}] failed to add logical port, retrying in {:?}: {}", key, delay, e);
            }
            Err(e) => {
                self.retries.remove(&key);
                error!("[{}] failed to add logical port: {}", key, e);
            }
        }
    }

    /// A pod was deleted.
    pub async fn delete(&mut self, workload: Workload) {
        let key = workload.key();
        self.pods.remove(&key);
        self.retries.remove(&key);
        if self.completed.remove(&key) {
            debug!("[{}] port of completed pod already removed", key);
            return;
        }
        if let Err(e) = self.reconciler.delete_logical_port(&workload).await {
            error!("[{}] failed to delete logical port: {}", key, e);
        }
    }

    /// A full (re)list of pods starts.
    pub fn begin_listing(&mut self) {
        self.listing = Some(HashMap::new());
    }

    /// One pod of the current listing.
    pub fn listed(&mut self, workload: Workload) {
        self.listing
            .get_or_insert_with(HashMap::new)
            .insert(workload.key(), workload);
    }

    /// The listing is complete: drop pods that disappeared, sweep stale
    /// ports and reconcile every listed pod.
    pub async fn finish_listing(&mut self) {
        let listing = self.listing.take().unwrap_or_default();

        let vanished: Vec<Workload> = self
            .pods
            .values()
            .filter(|w| !listing.contains_key(&w.key()))
            .cloned()
            .collect();
        for workload in vanished {
            info!("[{}] pod disappeared while the watch was down", workload.key());
            self.delete(workload).await;
        }

        self.pods = listing;
        self.sweep_with(if self.restored { SweepMode::Periodic } else { SweepMode::Startup })
            .await;

        let mut workloads: Vec<Workload> = self.pods.values().cloned().collect();
        workloads.sort_by_key(Workload::key);
        info!("reconciling {} listed pods", workloads.len());
        for workload in workloads {
            self.apply(workload).await;
        }
    }

    /// Periodic sweep against the current pod set.
    pub async fn sweep(&mut self) {
        if self.listing.is_some() {
            return;
        }
        let mode = if self.restored { SweepMode::Periodic } else { SweepMode::Startup };
        self.sweep_with(mode).await;
    }

    async fn sweep_with(&mut self, mode: SweepMode) {
        let workloads: Vec<Workload> = self.pods.values().cloned().collect();
        match self.reconciler.sync_pods(&workloads, mode).await {
            Ok(report) => {
                if mode == SweepMode::Startup {
                    self.restored = true;
                }
                info!(
                    "{:?} sweep: {} stale ports removed, {} pods re-allocated, {} ports cached",
                    mode,
                    report.stale_ports.len(),
                    report.reasserted,
                    report.cached
                );
            }
            Err(e) => error!("{:?} sweep failed: {}", mode, e),
        }
    }

    /// Re-run pods whose backoff has expired.
    pub async fn retry_due(&mut self, now: Instant) {
        for (workload, attempts) in self.retries.due(now) {
            let key = workload.key();
            let Some(current) = self.pods.get(&key).cloned() else {
                self.retries.remove(&key);
                continue;
            };
            debug!("[{}] retry attempt {}", key, attempts + 1);
            self.apply(current).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeInfo;
    use crate::test_utils::*;
    use nbdb_client::{LogicalSwitchPort, StringMap};
    use std::time::Duration;

    fn setup() -> (TestEnv, PodEventHandler) {
        let env = create_test_env(create_test_config());
        create_test_node(&env, "node1", &["10.1.2.0/24"]);
        let handler = PodEventHandler::new(env.reconciler.clone());
        (env, handler)
    }

    #[tokio::test]
    async fn test_apply_and_delete() {
        let (env, mut handler) = setup();
        let pod = create_test_workload("default", "web", Some("node1"));

        handler.apply(pod.clone()).await;
        assert!(env.nbdb.logical_switch_port("default_web").is_some());

        handler.delete(pod).await;
        assert!(env.nbdb.logical_switch_port("default_web").is_none());
        assert_eq!(env.allocated("node1"), 0);
    }

    #[tokio::test]
    async fn test_pod_on_new_node_is_retried() {
        let (env, mut handler) = setup();
        let pod = create_test_workload("default", "web", Some("node2"));

        handler.apply(pod).await;
        assert_eq!(handler.pending_retries(), 1);

        create_test_node(&env, "node2", &["10.1.3.0/24"]);
        handler.retry_due(Instant::now() + Duration::from_secs(2)).await;

        assert_eq!(handler.pending_retries(), 0);
        assert!(env.nbdb.logical_switch_port("default_web").is_some());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let (env, mut handler) = setup();
        let pod = create_test_workload("default", "web", Some("node1"));
        env.nbdb.fail_next_transactions(1);

        handler.apply(pod).await;
        assert_eq!(handler.pending_retries(), 1);
        // Not due yet
        handler.retry_due(Instant::now()).await;
        assert!(env.nbdb.logical_switch_port("default_web").is_none());

        handler.retry_due(Instant::now() + Duration::from_secs(2)).await;
        assert!(env.nbdb.logical_switch_port("default_web").is_some());
        assert_eq!(handler.pending_retries(), 0);
    }

    #[tokio::test]
    async fn test_deleted_pod_drops_pending_retry() {
        let (_env, mut handler) = setup();
        let pod = create_test_workload("default", "web", Some("node9"));
        handler.apply(pod.clone()).await;
        assert_eq!(handler.pending_retries(), 1);

        handler.delete(pod).await;
        assert_eq!(handler.pending_retries(), 0);
    }

    #[tokio::test]
    async fn test_completed_pod_releases_once() {
        let (env, mut handler) = setup();
        let pod = create_test_workload("default", "job", Some("node1"));
        handler.apply(pod.clone()).await;

        let mut done = pod.clone();
        done.phase = Some("Succeeded".to_string());
        handler.apply(done.clone()).await;
        assert!(env.nbdb.logical_switch_port("default_job").is_none());
        assert_eq!(env.allocated("node1"), 0);

        // The address goes to a new pod; later events for the finished pod must not free it
        let next = create_test_workload("default", "next", Some("node1"));
        handler.apply(next).await;
        assert_eq!(env.allocated("node1"), 1);

        handler.apply(done.clone()).await;
        handler.delete(done).await;
        assert_eq!(env.allocated("node1"), 1);
        assert!(env.nbdb.logical_switch_port("default_next").is_some());
    }

    #[tokio::test]
    async fn test_initial_listing_sweeps_then_adds() {
        let (env, mut handler) = setup();
        let mut stale = LogicalSwitchPort::new("default_old");
        stale.addresses = vec!["0a:58:0a:01:02:05 10.1.2.5".to_string()];
        stale.external_ids = StringMap::from([("pod".to_string(), "true".to_string())]);
        env.nbdb.add_logical_switch_port("node1", stale);

        handler.begin_listing();
        handler.listed(create_test_workload("default", "a", Some("node1")));
        handler.listed(create_test_workload("default", "b", Some("node1")));
        handler.finish_listing().await;

        assert!(env.nbdb.logical_switch_port("default_old").is_none());
        assert!(env.nbdb.logical_switch_port("default_a").is_some());
        assert!(env.nbdb.logical_switch_port("default_b").is_some());
        assert_eq!(env.allocated("node1"), 2);
    }

    #[tokio::test]
    async fn test_relist_deletes_vanished_pods() {
        let (env, mut handler) = setup();
        let keep = create_test_workload("default", "keep", Some("node1"));
        let gone = create_test_workload("default", "gone", Some("node1"));
        handler.begin_listing();
        handler.listed(keep.clone());
        handler.listed(gone);
        handler.finish_listing().await;
        assert_eq!(env.allocated("node1"), 2);

        handler.begin_listing();
        handler.listed(keep);
        handler.finish_listing().await;

        assert!(env.nbdb.logical_switch_port("default_gone").is_none());
        assert!(env.nbdb.logical_switch_port("default_keep").is_some());
        assert_eq!(env.allocated("node1"), 1);
    }

    #[tokio::test]
    async fn test_non_host_subnet_node_pods_are_ignored() {
        let (env, mut handler) = setup();
        env.reconciler
            .sync_node(&NodeInfo {
                name: "windows1".to_string(),
                no_host_subnet: true,
                ..Default::default()
            })
            .unwrap();

        handler.apply(create_test_workload("default", "win", Some("windows1"))).await;
        assert_eq!(handler.pending_retries(), 0);
        assert_eq!(env.nbdb.transaction_count(), 0);
    }
}
