//! Pod port reconciliation.
//!
//! This module is organized by lifecycle step:
//! - `add`: create or update the logical port of a scheduled pod
//! - `delete`: tear the port down and return its addresses
//! - `sweep`: remove ports of pods that no longer exist and rebuild the cache
//! - `node`: keep allocator pools in step with node subnet assignments
//!
//! The reconciler owns the allocator and the port cache. It is the only
//! writer of both, and it only talks to the database through
//! [`NbdbClientTrait`].

mod add;
mod delete;
mod node;
mod sweep;

pub use add::{AddOutcome, SkipReason};
pub use sweep::{SweepMode, SweepReport};

use crate::annotation::PodAnnotationStore;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::ipam::SubnetAllocator;
use crate::mac::MacAddress;
use crate::metrics::MetricsSink;
use crate::port_cache::PortCache;
use crate::routes::RoutePolicy;
use ipnet::IpNet;
use nbdb_client::{NbdbClientTrait, NbdbError, Operation, OperationResult};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Reconciles pod logical ports against the northbound database.
pub struct Reconciler {
    pub(crate) nbdb: Arc<dyn NbdbClientTrait>,
    pub(crate) annotations: Arc<dyn PodAnnotationStore>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) allocator: Arc<SubnetAllocator>,
    pub(crate) port_cache: Arc<PortCache>,
    pub(crate) policy: RoutePolicy,
    pub(crate) config: ControllerConfig,
    /// External gateway router addresses per node, for per-pod SNAT
    gateway_ips: RwLock<HashMap<String, Vec<IpNet>>>,
    /// Addresses of annotated pods whose port transaction has not committed,
    /// keyed by port name
    uncommitted: RwLock<HashMap<String, (String, Vec<IpNet>)>>,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("policy", &self.policy)
            .field("cached_ports", &self.port_cache.len())
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler with an empty allocator and port cache.
    pub fn new(
        nbdb: Arc<dyn NbdbClientTrait>,
        annotations: Arc<dyn PodAnnotationStore>,
        metrics: Arc<dyn MetricsSink>,
        config: ControllerConfig,
    ) -> Self {
        let policy = RoutePolicy {
            cluster_subnets: config.cluster_subnets.clone(),
            service_subnets: config.service_subnets.clone(),
            overlay_subnets: config.hybrid_overlay_subnets.clone(),
            per_pod_snat: config.disable_snat_multiple_gws,
        };
        Self {
            nbdb,
            annotations,
            metrics,
            allocator: Arc::new(SubnetAllocator::new(!config.hybrid_overlay_subnets.is_empty())),
            port_cache: Arc::new(PortCache::new()),
            policy,
            config,
            gateway_ips: RwLock::new(HashMap::new()),
            uncommitted: RwLock::new(HashMap::new()),
        }
    }

    pub fn allocator(&self) -> &Arc<SubnetAllocator> {
        &self.allocator
    }

    pub fn port_cache(&self) -> &Arc<PortCache> {
        &self.port_cache
    }

    pub(crate) fn node_gateway_ips(&self, node: &str) -> Option<Vec<IpNet>> {
        self.gateway_ips
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node)
            .cloned()
    }

    pub(crate) fn set_node_gateway_ips(&self, node: &str, ips: Vec<IpNet>) {
        let mut gateway_ips = self.gateway_ips.write().unwrap_or_else(PoisonError::into_inner);
        if ips.is_empty() {
            gateway_ips.remove(node);
        } else {
            gateway_ips.insert(node.to_string(), ips);
        }
    }

    /// Remember addresses recorded on a pod until its port is committed.
    pub(crate) fn track_uncommitted(&self, port_name: &str, node: &str, ips: &[IpNet]) {
        self.uncommitted
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(port_name.to_string(), (node.to_string(), ips.to_vec()));
    }

    pub(crate) fn forget_uncommitted(&self, port_name: &str) {
        self.uncommitted
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(port_name);
    }

    /// Addresses of uncommitted ports on a switch, by port name.
    pub(crate) fn uncommitted_on(&self, node: &str) -> Vec<(String, Vec<IpNet>)> {
        self.uncommitted
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, (switch, _))| switch == node)
            .map(|(name, (_, ips))| (name.clone(), ips.clone()))
            .collect()
    }

    /// Run one database call under the configured ceiling.
    pub(crate) async fn nb<T, F>(&self, what: &str, call: F) -> Result<T, ControllerError>
    where
        F: Future<Output = Result<T, NbdbError>>,
    {
        match tokio::time::timeout(self.config.nbdb_timeout, call).await {
            Ok(result) => result.map_err(ControllerError::from),
            Err(_) => Err(ControllerError::Timeout(format!(
                "{} after {:?}",
                what, self.config.nbdb_timeout
            ))),
        }
    }

    /// Submit one transaction; a rejection becomes `TransactionFailed`.
    pub(crate) async fn commit(
        &self,
        what: &str,
        ops: Vec<Operation>,
    ) -> Result<Vec<OperationResult>, ControllerError> {
        debug!("committing {} operations: {}", ops.len(), what);
        match self.nb(what, self.nbdb.transact(ops)).await {
            Err(ControllerError::Nbdb(e)) => {
                Err(ControllerError::TransactionFailed(format!("{}: {}", what, e)))
            }
            other => other,
        }
    }

    fn report_pool_usage(&self, switch: &str) {
        for usage in self.allocator.usage(switch) {
            self.metrics.record_pool_usage(switch, &usage);
        }
    }
}

/// Parse a port address string ("MAC IP [IP...]").
///
/// Addresses get the prefix length of the node subnet that contains them;
/// addresses outside every node subnet are dropped.
pub(crate) fn parse_port_addresses(
    addresses: &str,
    node_subnets: &[IpNet],
) -> Option<(MacAddress, Vec<IpNet>)> {
    let mut fields = addresses.split_whitespace();
    let mac = fields.next()?.parse::<MacAddress>().ok()?;
    let ips = fields
        .filter_map(|field| field.parse::<IpAddr>().ok())
        .filter_map(|ip| {
            node_subnets
                .iter()
                .find(|subnet| subnet.contains(&ip))
                .and_then(|subnet| IpNet::new(ip, subnet.prefix_len()).ok())
        })
        .collect();
    Some((mac, ips))
}

/// Port address string for a MAC and its addresses.
pub(crate) fn format_port_addresses(mac: &MacAddress, ips: &[IpNet]) -> String {
    let mut parts = vec![mac.to_string()];
    parts.extend(ips.iter().map(|ip| ip.addr().to_string()));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_addresses_matches_node_subnets() {
        let subnets: Vec<IpNet> = vec!["10.1.2.0/24".parse().unwrap(), "fd00:10:1:2::/64".parse().unwrap()];
        let (mac, ips) =
            parse_port_addresses("0a:58:0a:01:02:05 10.1.2.5 fd00:10:1:2::5 192.168.0.1", &subnets).unwrap();
        assert_eq!(mac.to_string(), "0a:58:0a:01:02:05");
        assert_eq!(
            ips,
            vec!["10.1.2.5/24".parse::<IpNet>().unwrap(), "fd00:10:1:2::5/64".parse().unwrap()]
        );
    }

    #[test]
    fn test_parse_port_addresses_rejects_garbage() {
        assert!(parse_port_addresses("", &[]).is_none());
        assert!(parse_port_addresses("dynamic", &[]).is_none());
    }

    #[test]
    fn test_format_port_addresses() {
        let mac: MacAddress = "0a:58:0a:01:02:05".parse().unwrap();
        let ips: Vec<IpNet> = vec!["10.1.2.5/24".parse().unwrap()];
        assert_eq!(format_port_addresses(&mac, &ips), "0a:58:0a:01:02:05 10.1.2.5");
    }
}
