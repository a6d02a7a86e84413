//! Pod network annotations
//!
//! The controller records the addresses, MAC, gateways and routes it assigned
//! to a pod in the `k8s.ovn.org/pod-networks` annotation. The annotation is the
//! recovery record for the pod's addresses: it is written before the port
//! transaction and trusted on every later reconciliation.
//!
//! This module also reads the network-attachment requests other CNI plugins
//! leave on the pod (extra attachments claiming a default route, a requested
//! MAC for the default network).

use crate::error::ControllerError;
use crate::ipam::IpFamily;
use crate::mac::MacAddress;
use crate::workload::Workload;
use async_trait::async_trait;
use ipnet::IpNet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use tracing::debug;

/// Annotation holding the pod's network configuration
pub const POD_NETWORKS_ANNOTATION: &str = "k8s.ovn.org/pod-networks";
/// Additional network attachments requested for the pod
pub const NETWORK_ATTACHMENT_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";
/// Overrides for the pod's default network attachment
pub const DEFAULT_NETWORK_ANNOTATION: &str = "v1.multus-cni.io/default-network";

const DEFAULT_NETWORK: &str = "default";

/// One route installed in the pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRoute {
    pub dest: IpNet,
    pub next_hop: IpAddr,
}

/// Network configuration recorded on a pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodAnnotation {
    pub ip_addresses: Vec<IpNet>,
    pub mac_address: MacAddress,
    pub gateways: Vec<IpAddr>,
    pub routes: Vec<PodRoute>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PodRouteJson {
    dest: String,
    #[serde(rename = "nextHop")]
    next_hop: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PodAnnotationJson {
    #[serde(default)]
    ip_addresses: Vec<String>,
    mac_address: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    gateway_ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    routes: Vec<PodRouteJson>,
    // Single-stack fields kept for older consumers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gateway_ip: Option<String>,
}

fn annotation_error(what: &str, value: &str, err: impl std::fmt::Display) -> ControllerError {
    ControllerError::Annotation(format!("bad {} {:?}: {}", what, value, err))
}

impl PodAnnotation {
    /// Parse the pod network annotation.
    ///
    /// Returns `Ok(None)` when the pod carries no annotation for the default
    /// network.
    pub fn from_annotations(
        annotations: &BTreeMap<String, String>,
    ) -> Result<Option<Self>, ControllerError> {
        let Some(raw) = annotations.get(POD_NETWORKS_ANNOTATION) else {
            return Ok(None);
        };
        let mut networks: BTreeMap<String, PodAnnotationJson> = serde_json::from_str(raw)
            .map_err(|e| annotation_error(POD_NETWORKS_ANNOTATION, raw, e))?;
        let Some(json) = networks.remove(DEFAULT_NETWORK) else {
            return Ok(None);
        };

        let mut ips = json.ip_addresses;
        if ips.is_empty() {
            ips.extend(json.ip_address);
        }
        if ips.is_empty() {
            return Err(ControllerError::Annotation(
                "pod network annotation has no addresses".to_string(),
            ));
        }
        let ip_addresses = ips
            .iter()
            .map(|ip| ip.parse::<IpNet>().map_err(|e| annotation_error("ip address", ip, e)))
            .collect::<Result<Vec<_>, _>>()?;

        let mac_address = json
            .mac_address
            .parse::<MacAddress>()
            .map_err(|e| annotation_error("mac address", &json.mac_address, e))?;

        let mut gateway_ips = json.gateway_ips;
        if gateway_ips.is_empty() {
            gateway_ips.extend(json.gateway_ip);
        }
        let gateways = gateway_ips
            .iter()
            .map(|gw| gw.parse::<IpAddr>().map_err(|e| annotation_error("gateway", gw, e)))
            .collect::<Result<Vec<_>, _>>()?;

        let routes = json
            .routes
            .iter()
            .map(|route| {
                Ok(PodRoute {
                    dest: route
                        .dest
                        .parse()
                        .map_err(|e| annotation_error("route destination", &route.dest, e))?,
                    next_hop: route
                        .next_hop
                        .parse()
                        .map_err(|e| annotation_error("route next hop", &route.next_hop, e))?,
                })
            })
            .collect::<Result<Vec<_>, ControllerError>>()?;

        Ok(Some(Self {
            ip_addresses,
            mac_address,
            gateways,
            routes,
        }))
    }

    /// Encode as the value of [`POD_NETWORKS_ANNOTATION`].
    pub fn to_annotation_value(&self) -> Result<String, ControllerError> {
        let mut json = PodAnnotationJson {
            ip_addresses: self.ip_addresses.iter().map(IpNet::to_string).collect(),
            mac_address: self.mac_address.to_string(),
            gateway_ips: self.gateways.iter().map(IpAddr::to_string).collect(),
            routes: self
                .routes
                .iter()
                .map(|route| PodRouteJson {
                    dest: route.dest.to_string(),
                    next_hop: route.next_hop.to_string(),
                })
                .collect(),
            ..Default::default()
        };
        if json.ip_addresses.len() == 1 {
            json.ip_address = json.ip_addresses.first().cloned();
            json.gateway_ip = json.gateway_ips.first().cloned();
        }

        let networks = BTreeMap::from([(DEFAULT_NETWORK, json)]);
        serde_json::to_string(&networks)
            .map_err(|e| ControllerError::Annotation(format!("cannot encode pod annotation: {}", e)))
    }
}

/// One element of a network selection annotation
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NetworkSelectionElement {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default, rename = "interface")]
    pub interface_request: Option<String>,
    #[serde(default, rename = "mac")]
    pub mac_request: Option<String>,
    #[serde(default, rename = "ips")]
    pub ip_request: Vec<String>,
    #[serde(default, rename = "default-route")]
    pub gateway_request: Vec<IpAddr>,
}

/// Parse a network selection annotation.
///
/// Accepts either a JSON list of selection elements or the short
/// `[namespace/]name[@interface]` comma separated form. Returns `None` when
/// the annotation is absent.
pub fn network_selections(
    annotations: &BTreeMap<String, String>,
    key: &str,
) -> Result<Option<Vec<NetworkSelectionElement>>, ControllerError> {
    let Some(raw) = annotations.get(key) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.starts_with('[') {
        let elements: Vec<NetworkSelectionElement> =
            serde_json::from_str(raw).map_err(|e| annotation_error(key, raw, e))?;
        return Ok(Some(elements));
    }
    if raw.starts_with('{') {
        let element: NetworkSelectionElement =
            serde_json::from_str(raw).map_err(|e| annotation_error(key, raw, e))?;
        return Ok(Some(vec![element]));
    }

    let elements = raw
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (target, interface) = match item.split_once('@') {
                Some((target, interface)) => (target, Some(interface.to_string())),
                None => (item, None),
            };
            let (namespace, name) = match target.split_once('/') {
                Some((namespace, name)) => (Some(namespace.to_string()), name),
                None => (None, target),
            };
            if name.is_empty() {
                return Err(annotation_error(key, item, "empty network name"));
            }
            Ok(NetworkSelectionElement {
                name: name.to_string(),
                namespace,
                interface_request: interface,
                ..Default::default()
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(elements))
}

/// IP families for which another attachment already provides the default route.
pub fn other_default_route_families(
    annotations: &BTreeMap<String, String>,
) -> Result<BTreeSet<IpFamily>, ControllerError> {
    let networks = network_selections(annotations, NETWORK_ATTACHMENT_ANNOTATION)?.unwrap_or_default();
    Ok(networks
        .iter()
        .flat_map(|network| network.gateway_request.iter())
        .map(IpFamily::of_addr)
        .collect())
}

/// MAC requested for the default network attachment, if any.
///
/// The default network annotation must name exactly one network.
pub fn requested_mac(
    annotations: &BTreeMap<String, String>,
) -> Result<Option<MacAddress>, ControllerError> {
    let Some(networks) = network_selections(annotations, DEFAULT_NETWORK_ANNOTATION)? else {
        return Ok(None);
    };
    let [network] = networks.as_slice() else {
        return Err(ControllerError::Annotation(format!(
            "{} must select exactly one network, got {}",
            DEFAULT_NETWORK_ANNOTATION,
            networks.len()
        )));
    };
    network
        .mac_request
        .as_deref()
        .filter(|mac| !mac.is_empty())
        .map(|mac| mac.parse::<MacAddress>().map_err(|e| annotation_error("requested mac", mac, e)))
        .transpose()
}

/// Reads and writes the pod network annotation.
#[async_trait]
pub trait PodAnnotationStore: Send + Sync {
    /// The recorded annotation of a workload, `None` when not set.
    fn get_annotation(&self, workload: &Workload) -> Result<Option<PodAnnotation>, ControllerError> {
        PodAnnotation::from_annotations(&workload.annotations)
    }

    /// Durably record the annotation on the pod.
    async fn set_annotation(
        &self,
        workload: &Workload,
        annotation: &PodAnnotation,
    ) -> Result<(), ControllerError>;
}

/// Annotation store backed by the Kubernetes API (merge patch on the pod)
#[derive(Clone)]
pub struct KubePodAnnotationStore {
    client: Client,
}

impl KubePodAnnotationStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl std::fmt::Debug for KubePodAnnotationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubePodAnnotationStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl PodAnnotationStore for KubePodAnnotationStore {
    async fn set_annotation(
        &self,
        workload: &Workload,
        annotation: &PodAnnotation,
    ) -> Result<(), ControllerError> {
        let value = annotation.to_annotation_value()?;
        let annotations = BTreeMap::from([(POD_NETWORKS_ANNOTATION, value.as_str())]);
        let patch = serde_json::json!({
            "metadata": {
                "annotations": annotations
            }
        });
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &workload.namespace);
        api.patch(&workload.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!("[{}] set pod network annotation: {}", workload.key(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn sample() -> PodAnnotation {
        PodAnnotation {
            ip_addresses: vec!["10.1.2.3/24".parse().unwrap()],
            mac_address: "0a:58:0a:01:02:03".parse().unwrap(),
            gateways: vec!["10.1.2.1".parse().unwrap()],
            routes: vec![PodRoute {
                dest: "10.132.0.0/14".parse().unwrap(),
                next_hop: "10.1.2.3".parse().unwrap(),
            }],
        }
    }

    #[test]
    fn test_encoded_annotation_layout() {
        let value = sample().to_annotation_value().unwrap();
        let json: serde_json::Value = serde_json::from_str(&value).unwrap();
        let default = &json["default"];
        assert_eq!(default["ip_addresses"][0], "10.1.2.3/24");
        assert_eq!(default["ip_address"], "10.1.2.3/24");
        assert_eq!(default["mac_address"], "0a:58:0a:01:02:03");
        assert_eq!(default["gateway_ip"], "10.1.2.1");
        assert_eq!(default["routes"][0]["nextHop"], "10.1.2.3");

        let parsed =
            PodAnnotation::from_annotations(&annotations(&[(POD_NETWORKS_ANNOTATION, &value)]))
                .unwrap();
        assert_eq!(parsed, Some(sample()));
    }

    #[test]
    fn test_missing_annotation_is_none() {
        assert_eq!(PodAnnotation::from_annotations(&BTreeMap::new()).unwrap(), None);
        let other_network = annotations(&[(POD_NETWORKS_ANNOTATION, r#"{"blue":{"mac_address":"x"}}"#)]);
        assert_eq!(PodAnnotation::from_annotations(&other_network).unwrap(), None);
    }

    #[test]
    fn test_legacy_single_address_fields() {
        let raw = r#"{"default":{"ip_address":"10.1.2.3/24","mac_address":"0a:58:0a:01:02:03","gateway_ip":"10.1.2.1"}}"#;
        let parsed = PodAnnotation::from_annotations(&annotations(&[(POD_NETWORKS_ANNOTATION, raw)]))
            .unwrap()
            .unwrap();
        assert_eq!(parsed.ip_addresses, vec!["10.1.2.3/24".parse::<IpNet>().unwrap()]);
        assert_eq!(parsed.gateways, vec!["10.1.2.1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_malformed_annotation_is_an_error() {
        let bad = annotations(&[(POD_NETWORKS_ANNOTATION, r#"{"default":{"ip_addresses":["nope"],"mac_address":"0a:58:0a:01:02:03"}}"#)]);
        assert!(matches!(
            PodAnnotation::from_annotations(&bad),
            Err(ControllerError::Annotation(_))
        ));
    }

    #[test]
    fn test_other_default_route_families() {
        let pod = annotations(&[(
            NETWORK_ATTACHMENT_ANNOTATION,
            r#"[{"name":"macvlan","default-route":["192.168.1.1"]},{"name":"sriov"}]"#,
        )]);
        let families = other_default_route_families(&pod).unwrap();
        assert_eq!(families, BTreeSet::from([IpFamily::V4]));

        let short = annotations(&[(NETWORK_ATTACHMENT_ANNOTATION, "net-ns/macvlan@eth1, sriov")]);
        assert!(other_default_route_families(&short).unwrap().is_empty());
        let selections = network_selections(&short, NETWORK_ATTACHMENT_ANNOTATION)
            .unwrap()
            .unwrap();
        assert_eq!(selections[0].namespace.as_deref(), Some("net-ns"));
        assert_eq!(selections[0].interface_request.as_deref(), Some("eth1"));
        assert_eq!(selections[1].name, "sriov");
    }

    #[test]
    fn test_requested_mac() {
        let pod = annotations(&[(
            DEFAULT_NETWORK_ANNOTATION,
            r#"[{"name":"ovn-kubernetes","mac":"0a:58:fd:98:00:01"}]"#,
        )]);
        assert_eq!(
            requested_mac(&pod).unwrap(),
            Some("0a:58:fd:98:00:01".parse().unwrap())
        );
        assert_eq!(requested_mac(&BTreeMap::new()).unwrap(), None);

        let two = annotations(&[(DEFAULT_NETWORK_ANNOTATION, "a,b")]);
        assert!(requested_mac(&two).is_err());

        let bad_mac = annotations(&[(DEFAULT_NETWORK_ANNOTATION, r#"[{"name":"a","mac":"zz"}]"#)]);
        assert!(requested_mac(&bad_mac).is_err());
    }
}
