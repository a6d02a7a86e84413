//! Node subnet bookkeeping

use super::Reconciler;
use crate::error::ControllerError;
use crate::node::NodeInfo;
use tracing::{info, warn};

impl Reconciler {
    /// Bring the node's allocator pool in line with its assigned subnets.
    ///
    /// Pools are only rebuilt when the subnets change. Addresses of cached
    /// ports on the switch, and of annotated pods whose port is not committed
    /// yet, are marked allocated again after a rebuild.
    pub fn sync_node(&self, node: &NodeInfo) -> Result<(), ControllerError> {
        self.set_node_gateway_ips(&node.name, node.gateway_ips.clone());

        if node.no_host_subnet {
            if !self.allocator.is_non_host_subnet_switch(&node.name) {
                info!("node {} has no host subnet", node.name);
                self.allocator.add_no_host_subnet_switch(&node.name);
            }
            return Ok(());
        }

        let Some(subnets) = node.subnets.as_deref() else {
            return Ok(());
        };
        let mut current = self.allocator.switch_subnets(&node.name).unwrap_or_default();
        let mut wanted: Vec<_> = subnets.iter().map(|s| s.trunc()).collect();
        current.sort();
        wanted.sort();
        if current == wanted {
            return Ok(());
        }

        info!("initializing address pool of switch {} with {:?}", node.name, subnets);
        self.allocator.initialize_switch(&node.name, subnets)?;

        let committed = self
            .port_cache
            .ports_on(&node.name)
            .into_iter()
            .map(|port| (port.name, port.ips));
        for (name, ips) in committed.chain(self.uncommitted_on(&node.name)) {
            if let Err(e) = self.allocator.allocate(&node.name, &ips) {
                warn!(
                    "port {} keeps addresses {:?} outside the new subnets: {}",
                    name, ips, e
                );
            }
        }
        self.report_pool_usage(&node.name);
        Ok(())
    }

    /// Forget a deleted node's pool and gateway addresses.
    pub fn delete_node(&self, name: &str) {
        info!("deleting address pool of switch {}", name);
        self.allocator.delete_switch(name);
        self.set_node_gateway_ips(name, Vec::new());
    }
}
