//! Stale port sweep

use super::{Reconciler, parse_port_addresses};
use crate::error::ControllerError;
use crate::workload::Workload;
use nbdb_client::{Column, LogicalSwitchPort, Mutator, Operation, Table, Where};
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info, warn};

/// When the sweep runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    /// First pass after the pod listing: also restores allocator and cache
    /// state from annotations and database rows.
    Startup,
    /// Periodic pass: only removes stale ports.
    Periodic,
}

/// What a sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Names of the ports removed
    pub stale_ports: Vec<String>,
    /// Pods whose recorded addresses were re-allocated
    pub reasserted: usize,
    /// Port cache entries restored from the database
    pub cached: usize,
}

impl Reconciler {
    /// Remove workload-owned ports with no matching pod.
    ///
    /// `workloads` is the full current pod listing. Ports are removed from
    /// every switch in a single transaction. Addresses are only returned to
    /// the pool for ports with a cached record.
    pub async fn sync_pods(&self, workloads: &[Workload], mode: SweepMode) -> Result<SweepReport, ControllerError> {
        let mut report = SweepReport::default();
        let expected: HashMap<String, &Workload> = workloads
            .iter()
            .filter(|w| w.expects_port())
            .map(|w| (w.logical_port_name(), w))
            .collect();

        if mode == SweepMode::Startup {
            report.reasserted = self.reassert_annotated(expected.values().copied());
        }

        let ports: HashMap<String, LogicalSwitchPort> = self
            .nb("list logical switch ports", self.nbdb.list_logical_switch_ports())
            .await?
            .into_iter()
            .map(|port| (port.uuid.clone(), port))
            .collect();
        let switches = self
            .nb("list logical switches", self.nbdb.list_logical_switches())
            .await?;

        let mut ops: Vec<Operation> = Vec::new();
        let mut stale_names: Vec<String> = Vec::new();
        for switch in &switches {
            let mut stale_uuids = Vec::new();
            for port in switch.ports.iter().filter_map(|uuid| ports.get(uuid)) {
                if port.external_ids.get("pod").map(String::as_str) != Some("true") {
                    continue;
                }
                if expected.contains_key(&port.name) {
                    if mode == SweepMode::Startup && self.restore_port(&switch.name, port) {
                        report.cached += 1;
                    }
                    continue;
                }
                debug!("stale logical port {} on switch {}", port.name, switch.name);
                stale_uuids.push(port.uuid.clone());
                stale_names.push(port.name.clone());
            }
            if !stale_uuids.is_empty() {
                ops.push(Where::uuid(Table::LogicalSwitch, &switch.uuid).mutate(
                    Column::Ports,
                    Mutator::Delete,
                    stale_uuids,
                ));
            }
        }

        if !ops.is_empty() {
            self.commit("remove stale logical switch ports", ops).await?;
            info!("removed {} stale logical switch ports", stale_names.len());
        }

        let mut touched = HashSet::new();
        for name in &stale_names {
            if let Some(info) = self.port_cache.remove(name) {
                self.allocator.release(&info.logical_switch, &info.ips);
                touched.insert(info.logical_switch);
            }
        }
        for switch in touched {
            self.report_pool_usage(&switch);
        }

        report.stale_ports = stale_names;
        Ok(report)
    }

    /// Mark the recorded addresses of every annotated pod as allocated.
    fn reassert_annotated<'a>(&self, workloads: impl Iterator<Item = &'a Workload>) -> usize {
        let mut count = 0;
        for workload in workloads {
            let Some(node) = workload.node_name.as_deref() else {
                continue;
            };
            if self.allocator.is_non_host_subnet_switch(node) {
                continue;
            }
            match self.annotations.get_annotation(workload) {
                Ok(Some(annotation)) => match self.allocator.allocate(node, &annotation.ip_addresses) {
                    Ok(_) => count += 1,
                    Err(e) => error!(
                        "[{}] cannot re-allocate annotated addresses {:?}: {}",
                        workload.key(),
                        annotation.ip_addresses,
                        e
                    ),
                },
                Ok(None) => {}
                Err(e) => warn!("[{}] unreadable pod network annotation: {}", workload.key(), e),
            }
        }
        count
    }

    /// Restore the cache entry and allocation of a live port from its row.
    fn restore_port(&self, switch: &str, port: &LogicalSwitchPort) -> bool {
        let Some(node_subnets) = self.allocator.switch_subnets(switch) else {
            return false;
        };
        let Some((mac, ips)) = port
            .effective_addresses()
            .and_then(|addresses| parse_port_addresses(addresses, &node_subnets))
        else {
            return false;
        };
        if let Err(e) = self.allocator.allocate(switch, &ips) {
            warn!("port {} holds unallocatable addresses {:?}: {}", port.name, ips, e);
            return false;
        }
        self.port_cache.add(switch, &port.name, &port.uuid, mac, ips);
        true
    }
}
