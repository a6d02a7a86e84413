//! The controller's view of a pod
//!
//! Reconciliation works on [`Workload`] values rather than raw `Pod` objects so
//! that the core logic can be exercised without a Kubernetes API server.

use crate::error::ControllerError;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;

/// Pod phases after which the pod never runs again
const COMPLETED_PHASES: [&str; 2] = ["Succeeded", "Failed"];

/// A pod as seen by the port reconciler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Workload {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    /// Node the pod is scheduled to; `None` while pending scheduling
    pub node_name: Option<String>,
    pub host_network: bool,
    pub phase: Option<String>,
    pub annotations: BTreeMap<String, String>,
    /// When the `PodScheduled` condition became true
    pub scheduled_at: Option<DateTime<Utc>>,
    /// The pod's namespace allows multicast
    pub multicast_enabled: bool,
}

impl Workload {
    /// Convert a Kubernetes pod.
    pub fn from_pod(pod: &Pod) -> Result<Self, ControllerError> {
        let metadata = &pod.metadata;
        let name = metadata
            .name
            .clone()
            .ok_or_else(|| ControllerError::Config("pod without a name".to_string()))?;
        let namespace = metadata.namespace.clone().unwrap_or_else(|| "default".to_string());

        let spec = pod.spec.as_ref();
        let status = pod.status.as_ref();

        let scheduled_at = status
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conditions| {
                conditions
                    .iter()
                    .find(|c| c.type_ == "PodScheduled" && c.status == "True")
            })
            .and_then(|c| c.last_transition_time.as_ref())
            .and_then(|time| serde_json::to_value(time).ok())
            .and_then(|value| value.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok()))
            .map(|time| time.with_timezone(&Utc));

        Ok(Self {
            namespace,
            name,
            uid: metadata.uid.clone().unwrap_or_default(),
            node_name: spec
                .and_then(|s| s.node_name.clone())
                .filter(|n| !n.is_empty()),
            host_network: spec.and_then(|s| s.host_network).unwrap_or(false),
            phase: status.and_then(|s| s.phase.clone()),
            annotations: metadata.annotations.clone().unwrap_or_default(),
            scheduled_at,
            multicast_enabled: false,
        })
    }

    /// `namespace/name`, used in log lines and as the retry key.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Deterministic logical switch port name.
    pub fn logical_port_name(&self) -> String {
        logical_port_name(&self.namespace, &self.name)
    }

    pub fn is_scheduled(&self) -> bool {
        self.node_name.is_some()
    }

    pub fn wants_network(&self) -> bool {
        !self.host_network
    }

    /// Completed pods keep their object but must not keep their port.
    pub fn is_completed(&self) -> bool {
        self.phase
            .as_deref()
            .is_some_and(|phase| COMPLETED_PHASES.contains(&phase))
    }

    /// Whether the pod should currently own a logical port.
    pub fn expects_port(&self) -> bool {
        self.is_scheduled() && self.wants_network() && !self.is_completed()
    }
}

/// Logical switch port name for a pod.
pub fn logical_port_name(namespace: &str, name: &str) -> String {
    format!("{}_{}", namespace, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(node: Option<&str>, host_network: bool, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web-0".to_string()),
                namespace: Some("shop".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: node.map(str::to_string),
                host_network: Some(host_network),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "PodScheduled".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_from_pod() {
        let workload = Workload::from_pod(&pod(Some("node1"), false, "Running")).unwrap();
        assert_eq!(workload.key(), "shop/web-0");
        assert_eq!(workload.logical_port_name(), "shop_web-0");
        assert_eq!(workload.uid, "uid-1");
        assert!(workload.expects_port());
    }

    #[test]
    fn test_expects_port_preconditions() {
        let unscheduled = Workload::from_pod(&pod(None, false, "Pending")).unwrap();
        assert!(!unscheduled.expects_port());

        let host = Workload::from_pod(&pod(Some("node1"), true, "Running")).unwrap();
        assert!(!host.expects_port());

        let done = Workload::from_pod(&pod(Some("node1"), false, "Succeeded")).unwrap();
        assert!(done.is_completed());
        assert!(!done.expects_port());
    }

    #[test]
    fn test_pod_without_name_is_rejected() {
        let mut nameless = pod(Some("node1"), false, "Running");
        nameless.metadata.name = None;
        assert!(Workload::from_pod(&nameless).is_err());
    }
}
