//! Logical port removal

use super::Reconciler;
use super::add::{gateway_router, multicast_port_group};
use crate::error::ControllerError;
use crate::workload::Workload;
use ipnet::IpNet;
use nbdb_client::{Column, Mutator, NatType, NbdbError, Table, Where};
use tracing::{debug, error, info, warn};

impl Reconciler {
    /// Remove a pod's logical port and return its addresses to the pool.
    ///
    /// The database is updated before the cached record is dropped, so a
    /// failed deletion can be retried with the same information.
    pub async fn delete_logical_port(&self, workload: &Workload) -> Result<(), ControllerError> {
        if !workload.wants_network() {
            return Ok(());
        }
        let Some(node) = workload.node_name.as_deref() else {
            return Ok(());
        };
        let key = workload.key();
        let port_name = workload.logical_port_name();
        info!("[{}] deleting pod", key);
        self.forget_uncommitted(&port_name);

        let Some(info) = self.port_cache.get(&port_name) else {
            // Nothing cached: remove by name and trust the annotation for addresses.
            match self.delete_port_row(node, &port_name).await {
                Ok(()) => {}
                Err(ControllerError::Nbdb(NbdbError::NotFound(_))) => {
                    debug!("[{}] logical port {} already gone", key, port_name);
                }
                Err(e) => error!("[{}] failed to delete logical port {}: {}", key, port_name, e),
            }
            match self.annotations.get_annotation(workload) {
                Ok(Some(annotation)) => {
                    let released = self.allocator.release(node, &annotation.ip_addresses);
                    debug!("[{}] released {} annotated addresses", key, released);
                }
                Ok(None) => {}
                Err(e) => warn!("[{}] cannot release addresses from annotation: {}", key, e),
            }
            self.report_pool_usage(node);
            return Ok(());
        };

        if self.config.enable_multicast {
            self.remove_from_multicast_group(workload, &info.uuid).await;
        }

        match self.delete_port_row(&info.logical_switch, &port_name).await {
            Ok(()) => {}
            Err(ControllerError::Nbdb(NbdbError::NotFound(_))) => {
                debug!("[{}] logical port {} already gone", key, port_name);
            }
            Err(e) => return Err(e),
        }

        self.allocator.release(&info.logical_switch, &info.ips);

        if self.policy.snat_required() {
            if let Err(e) = self.delete_pod_snat(&info.logical_switch, &info.ips).await {
                error!("[{}] failed to remove per-pod SNAT: {}", key, e);
            }
        }

        self.port_cache.remove(&port_name);
        self.report_pool_usage(&info.logical_switch);
        info!("[{}] deleted logical port {}", key, port_name);
        Ok(())
    }

    /// Detach the port from its switch and delete the row in one transaction.
    async fn delete_port_row(&self, switch_name: &str, port_name: &str) -> Result<(), ControllerError> {
        let switch = self
            .nb("find logical switch", self.nbdb.find_logical_switch(switch_name))
            .await?;
        let port = self
            .nb("get logical switch port", self.nbdb.get_logical_switch_port(port_name))
            .await?;
        let ops = vec![
            Where::uuid(Table::LogicalSwitch, &switch.uuid).mutate(
                Column::Ports,
                Mutator::Delete,
                vec![port.uuid.clone()],
            ),
            Where::uuid(Table::LogicalSwitchPort, &port.uuid).delete(),
        ];
        self.commit(&format!("delete logical switch port {}", port_name), ops)
            .await?;
        Ok(())
    }

    async fn delete_pod_snat(&self, node: &str, ips: &[IpNet]) -> Result<(), ControllerError> {
        let router = match self
            .nb("get gateway router", self.nbdb.get_logical_router(&gateway_router(node)))
            .await
        {
            Ok(router) => router,
            Err(ControllerError::Nbdb(NbdbError::NotFound(_))) => return Ok(()),
            Err(e) => return Err(e),
        };
        let logical_ips: Vec<String> = ips.iter().map(|ip| ip.addr().to_string()).collect();
        let stale: Vec<String> = self
            .nb("list NAT rules", self.nbdb.list_nats())
            .await?
            .into_iter()
            .filter(|nat| {
                router.nat.contains(&nat.uuid)
                    && nat.nat_type == NatType::Snat
                    && logical_ips.contains(&nat.logical_ip)
            })
            .map(|nat| nat.uuid)
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        let op = Where::uuid(Table::LogicalRouter, &router.uuid).mutate(Column::Nat, Mutator::Delete, stale);
        self.commit(&format!("remove pod SNAT from {}", router.name), vec![op])
            .await?;
        Ok(())
    }

    async fn remove_from_multicast_group(&self, workload: &Workload, uuid: &str) {
        let group = multicast_port_group(&workload.namespace);
        match self
            .nb("get port group", self.nbdb.get_port_group(&group))
            .await
        {
            Ok(port_group) if port_group.ports.iter().any(|port| port == uuid) => {
                let op = Where::uuid(Table::PortGroup, &port_group.uuid).mutate(
                    Column::Ports,
                    Mutator::Delete,
                    vec![uuid.to_string()],
                );
                if let Err(e) = self
                    .commit(&format!("remove port {} from port group {}", uuid, group), vec![op])
                    .await
                {
                    error!("[{}] failed to remove pod from multicast port group: {}", workload.key(), e);
                }
            }
            Ok(_) | Err(ControllerError::Nbdb(NbdbError::NotFound(_))) => {}
            Err(e) => warn!("[{}] cannot read multicast port group {}: {}", workload.key(), group, e),
        }
    }
}
