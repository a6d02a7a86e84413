//! Logical port metadata cache
//!
//! Last known database identity, MAC and addresses of every pod port this
//! controller created or recovered. Written only by the reconciler; rebuilt
//! from database rows on startup.

use crate::mac::MacAddress;
use ipnet::IpNet;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Cached state of one pod port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Logical port name (`namespace_pod`)
    pub name: String,
    /// Owning logical switch (node name)
    pub logical_switch: String,
    /// Database row UUID
    pub uuid: String,
    pub mac: MacAddress,
    pub ips: Vec<IpNet>,
}

#[derive(Debug, Default)]
pub struct PortCache {
    entries: RwLock<HashMap<String, PortInfo>>,
}

impl PortCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for a port; returns the stored value.
    pub fn add(
        &self,
        logical_switch: &str,
        name: &str,
        uuid: &str,
        mac: MacAddress,
        ips: Vec<IpNet>,
    ) -> PortInfo {
        let info = PortInfo {
            name: name.to_string(),
            logical_switch: logical_switch.to_string(),
            uuid: uuid.to_string(),
            mac,
            ips,
        };
        debug!("port cache: add {} on {} ({})", name, logical_switch, uuid);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), info.clone());
        info
    }

    pub fn get(&self, name: &str) -> Option<PortInfo> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn remove(&self, name: &str) -> Option<PortInfo> {
        debug!("port cache: remove {}", name);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Entries of every port on one switch.
    pub fn ports_on(&self, logical_switch: &str) -> Vec<PortInfo> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|info| info.logical_switch == logical_switch)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
