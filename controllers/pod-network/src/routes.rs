//! Route and NAT policy for pod attachments
//!
//! Pure functions: no I/O, no shared state.

use crate::annotation::PodRoute;
use crate::error::ControllerError;
use crate::ipam::{IpFamily, gateway_addr, hybrid_overlay_addr};
use ipnet::IpNet;
use std::collections::BTreeSet;
use std::net::IpAddr;

/// Routes and default gateways of one pod attachment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteSet {
    pub routes: Vec<PodRoute>,
    pub gateways: Vec<IpAddr>,
}

/// Compute routes and gateways for a pod's addresses.
///
/// For every address family where another attachment already owns the
/// default route, cluster and service subnets of that family are routed via
/// this attachment's gateway instead of installing a default gateway. Hybrid
/// overlay subnets are always routed via the overlay next-hop.
pub fn compute_routes(
    addresses: &[IpNet],
    node_subnets: &[IpNet],
    cluster_subnets: &[IpNet],
    service_subnets: &[IpNet],
    overlay_subnets: &[IpNet],
    other_default_routes: &BTreeSet<IpFamily>,
) -> Result<RouteSet, ControllerError> {
    let mut set = RouteSet::default();

    for address in addresses {
        let family = IpFamily::of_net(address);
        let node_subnet = node_subnets
            .iter()
            .find(|subnet| IpFamily::of_net(subnet) == family)
            .ok_or_else(|| {
                ControllerError::Config(format!(
                    "no {} node subnet for pod address {}",
                    family, address
                ))
            })?;
        let gateway = gateway_addr(node_subnet).addr();
        let same_family = |subnet: &&IpNet| IpFamily::of_net(subnet) == family;

        if other_default_routes.contains(&family) {
            set.routes.extend(
                cluster_subnets
                    .iter()
                    .chain(service_subnets)
                    .filter(same_family)
                    .map(|dest| PodRoute {
                        dest: *dest,
                        next_hop: gateway,
                    }),
            );
        } else {
            set.gateways.push(gateway);
        }

        let overlay_next_hop = hybrid_overlay_addr(node_subnet).addr();
        set.routes.extend(overlay_subnets.iter().filter(same_family).map(|dest| PodRoute {
            dest: *dest,
            next_hop: overlay_next_hop,
        }));
    }

    Ok(set)
}

/// Cluster-wide inputs of the route calculation
#[derive(Debug, Clone, Default)]
pub struct RoutePolicy {
    pub cluster_subnets: Vec<IpNet>,
    pub service_subnets: Vec<IpNet>,
    pub overlay_subnets: Vec<IpNet>,
    /// Pod traffic leaving the node is source-NATed per pod on the gateway router
    pub per_pod_snat: bool,
}

impl RoutePolicy {
    pub fn routes(
        &self,
        addresses: &[IpNet],
        node_subnets: &[IpNet],
        other_default_routes: &BTreeSet<IpFamily>,
    ) -> Result<RouteSet, ControllerError> {
        compute_routes(
            addresses,
            node_subnets,
            &self.cluster_subnets,
            &self.service_subnets,
            &self.overlay_subnets,
            other_default_routes,
        )
    }

    /// Whether the pod needs its own SNAT entries on the node gateway router.
    pub fn snat_required(&self) -> bool {
        self.per_pod_snat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nets(list: &[&str]) -> Vec<IpNet> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_default_gateway_without_competing_route() {
        let set = compute_routes(
            &nets(&["10.1.2.5/24"]),
            &nets(&["10.1.2.0/24"]),
            &nets(&["10.128.0.0/14"]),
            &nets(&["172.30.0.0/16"]),
            &[],
            &BTreeSet::new(),
        )
        .unwrap();
        assert_eq!(set.gateways, vec![ip("10.1.2.1")]);
        assert!(set.routes.is_empty());
    }

    #[test]
    fn test_other_default_route_installs_cluster_and_service_routes() {
        let set = compute_routes(
            &nets(&["10.1.2.5/24"]),
            &nets(&["10.1.2.0/24"]),
            &nets(&["10.128.0.0/14", "fd00:10:128::/48"]),
            &nets(&["172.30.0.0/16"]),
            &[],
            &BTreeSet::from([IpFamily::V4]),
        )
        .unwrap();
        assert!(set.gateways.is_empty());
        assert_eq!(
            set.routes,
            vec![
                PodRoute {
                    dest: "10.128.0.0/14".parse().unwrap(),
                    next_hop: ip("10.1.2.1")
                },
                PodRoute {
                    dest: "172.30.0.0/16".parse().unwrap(),
                    next_hop: ip("10.1.2.1")
                },
            ]
        );
    }

    #[test]
    fn test_overlay_routes_are_always_added() {
        let set = compute_routes(
            &nets(&["10.1.2.5/24"]),
            &nets(&["10.1.2.0/24"]),
            &[],
            &[],
            &nets(&["10.132.0.0/14"]),
            &BTreeSet::new(),
        )
        .unwrap();
        assert_eq!(set.gateways, vec![ip("10.1.2.1")]);
        assert_eq!(
            set.routes,
            vec![PodRoute {
                dest: "10.132.0.0/14".parse().unwrap(),
                next_hop: ip("10.1.2.3")
            }]
        );
    }

    #[test]
    fn test_dual_stack_gateway_per_family() {
        let set = compute_routes(
            &nets(&["10.1.2.5/24", "fd00:10:1:2::5/64"]),
            &nets(&["10.1.2.0/24", "fd00:10:1:2::/64"]),
            &[],
            &[],
            &[],
            &BTreeSet::from([IpFamily::V6]),
        )
        .unwrap();
        assert_eq!(set.gateways, vec![ip("10.1.2.1")]);
    }

    #[test]
    fn test_address_without_node_subnet_is_config_error() {
        let err = compute_routes(
            &nets(&["fd00:10:1:2::5/64"]),
            &nets(&["10.1.2.0/24"]),
            &[],
            &[],
            &[],
            &BTreeSet::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ControllerError::Config(_)));
        assert!(!err.is_retryable());
    }
}
