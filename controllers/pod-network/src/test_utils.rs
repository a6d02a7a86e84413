//! Test utilities for unit testing the reconciler
//!
//! This module provides helpers for creating test data and setting up test scenarios.

use crate::annotation::{POD_NETWORKS_ANNOTATION, PodAnnotation, PodAnnotationStore};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::ipam::PoolUsage;
use crate::metrics::MetricsSink;
use crate::node::NodeInfo;
use crate::reconciler::Reconciler;
use crate::workload::Workload;
use async_trait::async_trait;
use chrono::Utc;
use ipnet::IpNet;
use nbdb_client::MockNbdbClient;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub use nbdb_client::NbdbClientTrait;

/// Parse a CIDR in tests
pub fn net(s: &str) -> IpNet {
    s.parse().unwrap()
}

/// Annotation store that keeps written annotations in memory
#[derive(Debug, Default)]
pub struct InMemoryAnnotationStore {
    annotations: Mutex<HashMap<String, PodAnnotation>>,
    failing_writes: Mutex<usize>,
    writes: Mutex<usize>,
}

impl InMemoryAnnotationStore {
    /// Make the next `count` writes fail
    pub fn fail_next_writes(&self, count: usize) {
        *self.failing_writes.lock().unwrap() = count;
    }

    pub fn stored(&self, key: &str) -> Option<PodAnnotation> {
        self.annotations.lock().unwrap().get(key).cloned()
    }

    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap()
    }
}

#[async_trait]
impl PodAnnotationStore for InMemoryAnnotationStore {
    fn get_annotation(&self, workload: &Workload) -> Result<Option<PodAnnotation>, ControllerError> {
        if let Some(stored) = self.stored(&workload.key()) {
            return Ok(Some(stored));
        }
        PodAnnotation::from_annotations(&workload.annotations)
    }

    async fn set_annotation(
        &self,
        workload: &Workload,
        annotation: &PodAnnotation,
    ) -> Result<(), ControllerError> {
        {
            let mut failing = self.failing_writes.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(ControllerError::Timeout("injected annotation write failure".to_string()));
            }
        }
        *self.writes.lock().unwrap() += 1;
        self.annotations
            .lock()
            .unwrap()
            .insert(workload.key(), annotation.clone());
        Ok(())
    }
}

/// Metrics sink that remembers what it was told
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    pub pod_created: Mutex<Vec<Duration>>,
    pub pool_usage: Mutex<HashMap<String, Vec<PoolUsage>>>,
}

impl MetricsSink for RecordingMetrics {
    fn record_pod_created(&self, latency: Duration) {
        self.pod_created.lock().unwrap().push(latency);
    }

    fn record_pool_usage(&self, switch: &str, usage: &PoolUsage) {
        let mut pools = self.pool_usage.lock().unwrap();
        let entry = pools.entry(switch.to_string()).or_default();
        entry.retain(|existing| existing.subnet != usage.subnet);
        entry.push(usage.clone());
    }
}

/// Everything a reconciler test needs
pub struct TestEnv {
    pub nbdb: MockNbdbClient,
    pub store: Arc<InMemoryAnnotationStore>,
    pub metrics: Arc<RecordingMetrics>,
    pub reconciler: Arc<Reconciler>,
}

impl TestEnv {
    /// Number of allocated addresses on a switch, over all families
    pub fn allocated(&self, switch: &str) -> usize {
        self.reconciler
            .allocator()
            .usage(switch)
            .iter()
            .map(|usage| usage.allocated)
            .sum()
    }
}

/// Helper to create a test configuration with short timeouts
pub fn create_test_config() -> ControllerConfig {
    ControllerConfig {
        cluster_subnets: vec![net("10.128.0.0/14")],
        service_subnets: vec![net("172.30.0.0/16")],
        nbdb_timeout: Duration::from_secs(1),
        switch_wait_timeout: Duration::from_millis(300),
        switch_wait_interval: Duration::from_millis(30),
        ..Default::default()
    }
}

/// Helper to create a reconciler over an empty mock database
pub fn create_test_env(config: ControllerConfig) -> TestEnv {
    let nbdb = MockNbdbClient::new();
    let store = Arc::new(InMemoryAnnotationStore::default());
    let metrics = Arc::new(RecordingMetrics::default());
    let reconciler = Arc::new(Reconciler::new(
        Arc::new(nbdb.clone()),
        store.clone(),
        metrics.clone(),
        config,
    ));
    TestEnv {
        nbdb,
        store,
        metrics,
        reconciler,
    }
}

/// Helper to create a node with a logical switch and an address pool
pub fn create_test_node(env: &TestEnv, name: &str, subnets: &[&str]) {
    env.nbdb.add_logical_switch(name);
    env.reconciler
        .sync_node(&NodeInfo {
            name: name.to_string(),
            subnets: Some(subnets.iter().map(|s| net(s)).collect()),
            ..Default::default()
        })
        .unwrap();
}

/// Helper to create a scheduled pod
pub fn create_test_workload(namespace: &str, name: &str, node: Option<&str>) -> Workload {
    Workload {
        namespace: namespace.to_string(),
        name: name.to_string(),
        uid: format!("uid-{}", name),
        node_name: node.map(str::to_string),
        phase: Some("Pending".to_string()),
        scheduled_at: Some(Utc::now()),
        ..Default::default()
    }
}

/// Copy of `workload` carrying `annotation` as its pod network annotation
pub fn with_annotation(workload: &Workload, annotation: &PodAnnotation) -> Workload {
    let mut annotated = workload.clone();
    annotated.annotations.insert(
        POD_NETWORKS_ANNOTATION.to_string(),
        annotation.to_annotation_value().unwrap(),
    );
    annotated
}
