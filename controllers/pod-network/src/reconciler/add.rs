//! Logical port creation

use super::{Reconciler, format_port_addresses, parse_port_addresses};
use crate::annotation::{PodAnnotation, other_default_route_families, requested_mac};
use crate::error::ControllerError;
use crate::ipam::{AllocationOutcome, IpFamily};
use crate::mac::MacAddress;
use crate::workload::Workload;
use chrono::Utc;
use ipnet::IpNet;
use nbdb_client::{
    Column, LogicalSwitch, LogicalSwitchPort, Mutator, Nat, NatType, NbdbError, Operation,
    StringMap, Table, Where, build_named_uuid, create,
};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Why a pod was left alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Not scheduled to a node yet
    NotScheduled,
    /// Uses the host network namespace
    HostNetwork,
    /// Succeeded or failed; its port is removed instead
    Completed,
    /// Scheduled to a node outside the overlay
    NonHostSubnetNode,
    /// The node has no address pool yet; retried later
    SwitchNotReady,
}

/// Result of [`Reconciler::add_logical_port`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Created { uuid: String },
    Updated { uuid: String },
    Skipped(SkipReason),
}

impl AddOutcome {
    /// The pod should be offered again later.
    pub fn needs_retry(&self) -> bool {
        matches!(self, AddOutcome::Skipped(SkipReason::SwitchNotReady))
    }
}

/// Owner tags written on every pod port
fn port_external_ids(namespace: &str) -> StringMap {
    StringMap::from([
        ("namespace".to_string(), namespace.to_string()),
        ("pod".to_string(), "true".to_string()),
    ])
}

/// Name of the port group allowing multicast for a namespace's pods
pub(crate) fn multicast_port_group(namespace: &str) -> String {
    format!("mcast_allow_{}", namespace.replace('-', "_"))
}

/// Name of a node's gateway router
pub(crate) fn gateway_router(node: &str) -> String {
    format!("GR_{}", node)
}

impl Reconciler {
    /// Ensure a scheduled pod has a logical port, addresses and annotation.
    ///
    /// Idempotent: running it again for an unchanged pod rewrites the same
    /// port and annotation.
    pub async fn add_logical_port(&self, workload: &Workload) -> Result<AddOutcome, ControllerError> {
        let Some(node) = workload.node_name.as_deref() else {
            return Ok(AddOutcome::Skipped(SkipReason::NotScheduled));
        };
        if !workload.wants_network() {
            return Ok(AddOutcome::Skipped(SkipReason::HostNetwork));
        }
        if workload.is_completed() {
            return Ok(AddOutcome::Skipped(SkipReason::Completed));
        }
        if self.allocator.is_non_host_subnet_switch(node) {
            debug!("[{}] node {} has no host subnet, skipping", workload.key(), node);
            return Ok(AddOutcome::Skipped(SkipReason::NonHostSubnetNode));
        }
        if self.allocator.switch_subnets(node).is_none() {
            info!(
                "[{}] logical switch {} has no address pool yet, will retry",
                workload.key(),
                node
            );
            return Ok(AddOutcome::Skipped(SkipReason::SwitchNotReady));
        }

        let start = Instant::now();
        let result = self.ensure_port(workload, node).await;
        info!("[{}] addLogicalPort took {:?}", workload.key(), start.elapsed());
        result
    }

    /// Poll until the node's logical switch exists in the database.
    pub(crate) async fn wait_for_logical_switch(&self, node: &str) -> Result<LogicalSwitch, ControllerError> {
        let poll = async {
            loop {
                match self
                    .nb("find logical switch", self.nbdb.find_logical_switch(node))
                    .await
                {
                    Ok(switch) => return Ok(switch),
                    Err(ControllerError::Nbdb(NbdbError::NotFound(_))) => {}
                    Err(e) => return Err(e),
                }
                tokio::time::sleep(self.config.switch_wait_interval).await;
            }
        };
        tokio::time::timeout(self.config.switch_wait_timeout, poll)
            .await
            .map_err(|_| {
                ControllerError::Timeout(format!(
                    "timed out waiting for logical switch {} after {:?}",
                    node, self.config.switch_wait_timeout
                ))
            })?
    }

    async fn ensure_port(&self, workload: &Workload, node: &str) -> Result<AddOutcome, ControllerError> {
        let key = workload.key();
        let switch = self.wait_for_logical_switch(node).await?;
        let port_name = workload.logical_port_name();

        let existing = match self
            .nb("get logical switch port", self.nbdb.get_logical_switch_port(&port_name))
            .await
        {
            Ok(port) => Some(port),
            Err(ControllerError::Nbdb(NbdbError::NotFound(_))) => None,
            Err(e) => return Err(e),
        };

        let mut options = StringMap::new();
        // Pin the port to this pod instance unless an older port never carried the pin.
        let pin_instance = existing.as_ref().is_none_or(|port| {
            port.options
                .get("iface-id-ver")
                .is_some_and(|v| !v.is_empty())
        });
        if pin_instance && !workload.uid.is_empty() {
            options.insert("iface-id-ver".to_string(), workload.uid.clone());
        }
        options.insert("requested-chassis".to_string(), node.to_string());

        let annotation = match self.annotations.get_annotation(workload) {
            Ok(annotation) => annotation,
            Err(e) => {
                warn!("[{}] ignoring unreadable pod network annotation: {}", key, e);
                None
            }
        };

        let (mac, ips) = match annotation {
            Some(annotation) => {
                // The recorded addresses stay authoritative.
                self.allocator.allocate(node, &annotation.ip_addresses).map_err(|e| {
                    error!("[{}] unable to ensure annotated addresses are allocated: {}", key, e);
                    ControllerError::from(e)
                })?;
                (annotation.mac_address, annotation.ip_addresses)
            }
            None => self.assign_addresses(workload, node, existing.as_ref()).await?,
        };
        // The annotation now owns these addresses until the port is committed.
        self.track_uncommitted(&port_name, node, &ips);

        let mut port = LogicalSwitchPort::new(&port_name);
        port.uuid = existing
            .as_ref()
            .map_or_else(build_named_uuid, |existing| existing.uuid.clone());
        port.addresses = vec![format_port_addresses(&mac, &ips)];
        port.port_security = port.addresses.clone();
        port.external_ids = port_external_ids(&workload.namespace);
        port.options = options;

        let mut ops: Vec<Operation> = Vec::new();
        if existing.is_some() {
            ops.push(Where::uuid(Table::LogicalSwitchPort, &port.uuid).update(
                port.clone(),
                &[Column::Addresses, Column::ExternalIds, Column::Options, Column::PortSecurity],
            ));
        } else {
            ops.push(create(port.clone()));
            ops.push(Where::uuid(Table::LogicalSwitch, &switch.uuid).mutate(
                Column::Ports,
                Mutator::Insert,
                vec![port.uuid.clone()],
            ));
        }
        if self.policy.snat_required() {
            ops.extend(self.pod_snat_ops(workload, node, &ips).await?);
        }

        let results = self
            .commit(
                &format!("creation or update of logical switch port {}", port_name),
                ops,
            )
            .await?;

        let uuid = if existing.is_some() {
            port.uuid.clone()
        } else {
            results
                .first()
                .and_then(|result| result.uuid.clone())
                .ok_or_else(|| {
                    ControllerError::TransactionFailed(format!(
                        "no uuid returned for new logical switch port {}",
                        port_name
                    ))
                })?
        };

        self.port_cache.add(node, &port_name, &uuid, mac, ips);
        self.forget_uncommitted(&port_name);

        if self.config.enable_multicast && workload.multicast_enabled {
            self.add_to_multicast_group(workload, &uuid).await;
        }

        if let Some(scheduled_at) = workload.scheduled_at {
            if let Ok(latency) = (Utc::now() - scheduled_at).to_std() {
                self.metrics.record_pod_created(latency);
            }
        }
        self.report_pool_usage(node);

        if existing.is_some() {
            info!("[{}] updated logical switch port {} ({})", key, port_name, uuid);
            Ok(AddOutcome::Updated { uuid })
        } else {
            info!("[{}] created logical switch port {} ({})", key, port_name, uuid);
            Ok(AddOutcome::Created { uuid })
        }
    }

    /// Pick addresses for a pod without a recorded annotation and record one.
    ///
    /// Addresses reserved by this call are released again if anything fails
    /// before the annotation has been written. Addresses recovered from an
    /// existing port that were already reserved stay with that port.
    async fn assign_addresses(
        &self,
        workload: &Workload,
        node: &str,
        existing: Option<&LogicalSwitchPort>,
    ) -> Result<(MacAddress, Vec<IpNet>), ControllerError> {
        let key = workload.key();
        let node_subnets = self
            .allocator
            .switch_subnets(node)
            .ok_or_else(|| ControllerError::SwitchUnknown(node.to_string()))?;

        let recovered = existing
            .and_then(|port| port.effective_addresses())
            .and_then(|addresses| parse_port_addresses(addresses, &node_subnets))
            .filter(|(_, ips)| !ips.is_empty())
            .and_then(|(mac, ips)| match self.allocator.allocate(node, &ips) {
                Ok(outcome) => {
                    debug!("[{}] reusing addresses of existing port: {:?} ({:?})", key, ips, outcome);
                    Some((mac, ips, outcome == AllocationOutcome::Allocated))
                }
                Err(e) => {
                    warn!("[{}] cannot reuse existing port addresses: {}", key, e);
                    None
                }
            });

        let (mac, ips, reserved) = match recovered {
            Some(found) => found,
            None => {
                let ips = self.allocator.allocate_next(node)?;
                let first = ips
                    .first()
                    .ok_or_else(|| ControllerError::SwitchUnknown(node.to_string()))?;
                (MacAddress::from_ip(first.addr()), ips, true)
            }
        };

        let annotated = async {
            let mac = requested_mac(&workload.annotations)?.unwrap_or(mac);
            let other_routes = other_default_route_families(&workload.annotations)?;
            let route_set = self.policy.routes(&ips, &node_subnets, &other_routes)?;
            let annotation = PodAnnotation {
                ip_addresses: ips.clone(),
                mac_address: mac,
                gateways: route_set.gateways,
                routes: route_set.routes,
            };
            self.annotations.set_annotation(workload, &annotation).await?;
            info!(
                "[{}] annotated pod with mac {} and addresses {:?}",
                key, annotation.mac_address, annotation.ip_addresses
            );
            Ok::<MacAddress, ControllerError>(annotation.mac_address)
        }
        .await;

        match annotated {
            Ok(mac) => Ok((mac, ips)),
            Err(e) if reserved => {
                let released = self.allocator.release(node, &ips);
                info!("[{}] released {} addresses after failure: {}", key, released, e);
                Err(e)
            }
            Err(e) => {
                info!("[{}] keeping addresses of existing port after failure: {}", key, e);
                Err(e)
            }
        }
    }

    /// Per-pod SNAT rows on the node gateway router that are not there yet.
    async fn pod_snat_ops(
        &self,
        workload: &Workload,
        node: &str,
        ips: &[IpNet],
    ) -> Result<Vec<Operation>, ControllerError> {
        let gateway_ips = self.node_gateway_ips(node).ok_or_else(|| {
            ControllerError::SwitchUnknown(format!("gateway router addresses of node {}", node))
        })?;
        let router_name = gateway_router(node);
        let router = self
            .nb("get gateway router", self.nbdb.get_logical_router(&router_name))
            .await?;
        let nats = self.nb("list NAT rules", self.nbdb.list_nats()).await?;

        let mut ops = Vec::new();
        for ip in ips {
            let family = IpFamily::of_net(ip);
            let Some(external) = gateway_ips.iter().find(|gw| IpFamily::of_net(gw) == family) else {
                return Err(ControllerError::Config(format!(
                    "node {} has no {} gateway address for pod {}",
                    node,
                    family,
                    workload.key()
                )));
            };
            let logical_ip = ip.addr().to_string();
            let external_ip = external.addr().to_string();
            let present = nats.iter().any(|nat| {
                router.nat.contains(&nat.uuid)
                    && nat.nat_type == NatType::Snat
                    && nat.logical_ip == logical_ip
                    && nat.external_ip == external_ip
            });
            if present {
                continue;
            }

            let nat = Nat {
                uuid: build_named_uuid(),
                nat_type: NatType::Snat,
                logical_ip,
                external_ip,
                logical_port: None,
                external_ids: StringMap::from([("pod".to_string(), workload.key())]),
            };
            let nat_uuid = nat.uuid.clone();
            ops.push(create(nat));
            ops.push(Where::uuid(Table::LogicalRouter, &router.uuid).mutate(
                Column::Nat,
                Mutator::Insert,
                vec![nat_uuid],
            ));
        }
        Ok(ops)
    }

    /// Add the port to its namespace's multicast port group.
    ///
    /// Failures are logged; the port itself stays in place.
    async fn add_to_multicast_group(&self, workload: &Workload, uuid: &str) {
        let group = multicast_port_group(&workload.namespace);
        let op = Where::name(Table::PortGroup, &group).mutate(
            Column::Ports,
            Mutator::Insert,
            vec![uuid.to_string()],
        );
        if let Err(e) = self
            .commit(&format!("add port {} to port group {}", uuid, group), vec![op])
            .await
        {
            error!(
                "[{}] failed to add pod to multicast port group {}: {}",
                workload.key(),
                group,
                e
            );
        }
    }
}
