//! Node subnet source
//!
//! Host subnets are assigned to nodes by an upstream controller and published
//! as node annotations. This module turns a `Node` into the inputs the
//! allocator and the per-pod SNAT need.

use crate::error::ControllerError;
use ipnet::IpNet;
use k8s_openapi::api::core::v1::Node;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Host subnets assigned to the node, per network
pub const NODE_SUBNETS_ANNOTATION: &str = "k8s.ovn.org/node-subnets";
/// Gateway router configuration of the node, per network
pub const L3_GATEWAY_CONFIG_ANNOTATION: &str = "k8s.ovn.org/l3-gateway-config";

const DEFAULT_NETWORK: &str = "default";

/// What the controller needs to know about a node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    /// `None` until the node has been assigned host subnets
    pub subnets: Option<Vec<IpNet>>,
    /// External addresses of the node's gateway router
    pub gateway_ips: Vec<IpNet>,
    /// The node does not take part in the overlay
    pub no_host_subnet: bool,
}

impl NodeInfo {
    /// Convert a Kubernetes node. `no_host_subnet_label` marks nodes that do
    /// not get host subnets.
    pub fn from_node(node: &Node, no_host_subnet_label: Option<&str>) -> Result<Self, ControllerError> {
        let name = node
            .metadata
            .name
            .clone()
            .ok_or_else(|| ControllerError::Config("node without a name".to_string()))?;
        let empty = BTreeMap::new();
        let annotations = node.metadata.annotations.as_ref().unwrap_or(&empty);
        let no_host_subnet = no_host_subnet_label.is_some_and(|label| {
            node.metadata
                .labels
                .as_ref()
                .is_some_and(|labels| labels.contains_key(label))
        });

        Ok(Self {
            subnets: parse_node_subnets(annotations)?,
            gateway_ips: parse_gateway_ips(annotations)?,
            no_host_subnet,
            name,
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SubnetValue {
    One(String),
    Many(Vec<String>),
}

/// Parse `k8s.ovn.org/node-subnets`: `{"default": "cidr"}` or
/// `{"default": ["cidr", ...]}`.
pub fn parse_node_subnets(
    annotations: &BTreeMap<String, String>,
) -> Result<Option<Vec<IpNet>>, ControllerError> {
    let Some(raw) = annotations.get(NODE_SUBNETS_ANNOTATION) else {
        return Ok(None);
    };
    let mut networks: BTreeMap<String, SubnetValue> = serde_json::from_str(raw).map_err(|e| {
        ControllerError::Annotation(format!("bad {} {:?}: {}", NODE_SUBNETS_ANNOTATION, raw, e))
    })?;
    let cidrs = match networks.remove(DEFAULT_NETWORK) {
        None => return Ok(None),
        Some(SubnetValue::One(cidr)) => vec![cidr],
        Some(SubnetValue::Many(cidrs)) => cidrs,
    };
    cidrs
        .iter()
        .map(|cidr| {
            cidr.parse::<IpNet>().map_err(|e| {
                ControllerError::Annotation(format!("bad node subnet {:?}: {}", cidr, e))
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

#[derive(Deserialize)]
struct GatewayConfigJson {
    #[serde(default)]
    mode: String,
    #[serde(default, rename = "ip-addresses")]
    ip_addresses: Vec<String>,
    #[serde(default, rename = "ip-address")]
    ip_address: Option<String>,
}

/// External gateway router addresses from `k8s.ovn.org/l3-gateway-config`.
///
/// Nodes with a disabled gateway, or without the annotation, have none.
pub fn parse_gateway_ips(annotations: &BTreeMap<String, String>) -> Result<Vec<IpNet>, ControllerError> {
    let Some(raw) = annotations.get(L3_GATEWAY_CONFIG_ANNOTATION) else {
        return Ok(Vec::new());
    };
    let mut configs: BTreeMap<String, GatewayConfigJson> = serde_json::from_str(raw).map_err(|e| {
        ControllerError::Annotation(format!("bad {} {:?}: {}", L3_GATEWAY_CONFIG_ANNOTATION, raw, e))
    })?;
    let Some(config) = configs.remove(DEFAULT_NETWORK) else {
        return Ok(Vec::new());
    };
    if config.mode == "disabled" {
        return Ok(Vec::new());
    }

    let mut addresses = config.ip_addresses;
    if addresses.is_empty() {
        addresses.extend(config.ip_address);
    }
    addresses
        .iter()
        .map(|ip| {
            ip.parse::<IpNet>().map_err(|e| {
                ControllerError::Annotation(format!("bad gateway address {:?}: {}", ip, e))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn node(annotations: &[(&str, &str)], labels: &[(&str, &str)]) -> Node {
        let to_map = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>()
        };
        Node {
            metadata: ObjectMeta {
                name: Some("node1".to_string()),
                annotations: Some(to_map(annotations)),
                labels: Some(to_map(labels)),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_single_and_dual_stack_subnets() {
        let single = node(&[(NODE_SUBNETS_ANNOTATION, r#"{"default":"10.1.2.0/24"}"#)], &[]);
        let info = NodeInfo::from_node(&single, None).unwrap();
        assert_eq!(info.subnets, Some(vec!["10.1.2.0/24".parse().unwrap()]));

        let dual = node(
            &[(NODE_SUBNETS_ANNOTATION, r#"{"default":["10.1.2.0/24","fd00:10:1:2::/64"]}"#)],
            &[],
        );
        let info = NodeInfo::from_node(&dual, None).unwrap();
        assert_eq!(info.subnets.map(|s| s.len()), Some(2));
    }

    #[test]
    fn test_node_without_subnets() {
        let info = NodeInfo::from_node(&node(&[], &[]), None).unwrap();
        assert_eq!(info.subnets, None);
        assert!(info.gateway_ips.is_empty());
    }

    #[test]
    fn test_gateway_ips() {
        let shared = node(
            &[(
                L3_GATEWAY_CONFIG_ANNOTATION,
                r#"{"default":{"mode":"shared","ip-addresses":["172.18.0.2/16"],"mac-address":"02:42:ac:12:00:02"}}"#,
            )],
            &[],
        );
        let info = NodeInfo::from_node(&shared, None).unwrap();
        assert_eq!(info.gateway_ips, vec!["172.18.0.2/16".parse::<IpNet>().unwrap()]);

        let disabled = node(&[(L3_GATEWAY_CONFIG_ANNOTATION, r#"{"default":{"mode":"disabled"}}"#)], &[]);
        assert!(NodeInfo::from_node(&disabled, None).unwrap().gateway_ips.is_empty());
    }

    #[test]
    fn test_no_host_subnet_label() {
        let windows = node(&[], &[("k8s.ovn.org/hybrid-overlay-node", "")]);
        let info = NodeInfo::from_node(&windows, Some("k8s.ovn.org/hybrid-overlay-node")).unwrap();
        assert!(info.no_host_subnet);
        assert!(!NodeInfo::from_node(&windows, None).unwrap().no_host_subnet);
    }

    #[test]
    fn test_malformed_subnet_annotation() {
        let bad = node(&[(NODE_SUBNETS_ANNOTATION, r#"{"default":"10.1.2.0/33"}"#)], &[]);
        assert!(matches!(
            NodeInfo::from_node(&bad, None),
            Err(ControllerError::Annotation(_))
        ));
    }
}
