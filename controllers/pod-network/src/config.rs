//! Controller configuration loaded from environment variables.

use crate::error::ControllerError;
use ipnet::IpNet;
use std::env;
use std::time::Duration;

/// Runtime configuration of the pod network controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Cluster-wide pod networks (`CLUSTER_SUBNETS`)
    pub cluster_subnets: Vec<IpNet>,
    /// Service networks (`SERVICE_SUBNETS`)
    pub service_subnets: Vec<IpNet>,
    /// Hybrid overlay networks (`HYBRID_OVERLAY_SUBNETS`)
    pub hybrid_overlay_subnets: Vec<IpNet>,
    /// Add pods of multicast-enabled namespaces to the allow port group
    pub enable_multicast: bool,
    /// Per-pod SNAT on the node gateway router
    pub disable_snat_multiple_gws: bool,
    /// Ceiling for every single database call
    pub nbdb_timeout: Duration,
    /// Ceiling for the logical switch readiness wait
    pub switch_wait_timeout: Duration,
    /// Poll interval of the logical switch readiness wait
    pub switch_wait_interval: Duration,
    /// Period of the stale port sweep
    pub sweep_interval: Duration,
    /// Node label marking nodes without host subnets
    pub no_host_subnet_label: Option<String>,
    /// Restrict pod watching to one namespace
    pub watch_namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            cluster_subnets: Vec::new(),
            service_subnets: Vec::new(),
            hybrid_overlay_subnets: Vec::new(),
            enable_multicast: false,
            disable_snat_multiple_gws: false,
            nbdb_timeout: Duration::from_secs(10),
            switch_wait_timeout: Duration::from_secs(30),
            switch_wait_interval: Duration::from_millis(30),
            sweep_interval: Duration::from_secs(300),
            no_host_subnet_label: None,
            watch_namespace: None,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            cluster_subnets: parse_subnets("CLUSTER_SUBNETS", get("CLUSTER_SUBNETS"))?,
            service_subnets: parse_subnets("SERVICE_SUBNETS", get("SERVICE_SUBNETS"))?,
            hybrid_overlay_subnets: parse_subnets(
                "HYBRID_OVERLAY_SUBNETS",
                get("HYBRID_OVERLAY_SUBNETS"),
            )?,
            enable_multicast: parse_bool("ENABLE_MULTICAST", get("ENABLE_MULTICAST"))?
                .unwrap_or(defaults.enable_multicast),
            disable_snat_multiple_gws: parse_bool(
                "DISABLE_SNAT_MULTIPLE_GWS",
                get("DISABLE_SNAT_MULTIPLE_GWS"),
            )?
            .unwrap_or(defaults.disable_snat_multiple_gws),
            nbdb_timeout: parse_u64("NBDB_TIMEOUT_SECS", get("NBDB_TIMEOUT_SECS"))?
                .map_or(defaults.nbdb_timeout, Duration::from_secs),
            switch_wait_timeout: parse_u64(
                "SWITCH_WAIT_TIMEOUT_SECS",
                get("SWITCH_WAIT_TIMEOUT_SECS"),
            )?
            .map_or(defaults.switch_wait_timeout, Duration::from_secs),
            switch_wait_interval: parse_u64(
                "SWITCH_WAIT_INTERVAL_MS",
                get("SWITCH_WAIT_INTERVAL_MS"),
            )?
            .map_or(defaults.switch_wait_interval, Duration::from_millis),
            sweep_interval: parse_u64("SWEEP_INTERVAL_SECS", get("SWEEP_INTERVAL_SECS"))?
                .map_or(defaults.sweep_interval, Duration::from_secs),
            no_host_subnet_label: get("NO_HOST_SUBNET_LABEL"),
            watch_namespace: get("WATCH_NAMESPACE"),
        })
    }
}

/// Comma separated CIDRs. A trailing host prefix length
/// (`10.128.0.0/14/23`) is accepted and ignored.
fn parse_subnets(key: &str, value: Option<String>) -> Result<Vec<IpNet>, ControllerError> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let cidr = match entry.match_indices('/').nth(1) {
                Some((second_slash, _)) => &entry[..second_slash],
                None => entry,
            };
            cidr.parse::<IpNet>().map(|net| net.trunc()).map_err(|e| {
                ControllerError::Config(format!("{} has invalid CIDR {:?}: {}", key, entry, e))
            })
        })
        .collect()
}

fn parse_bool(key: &str, value: Option<String>) -> Result<Option<bool>, ControllerError> {
    value
        .map(|v| match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(ControllerError::Config(format!(
                "{} must be a boolean, got {:?}",
                key, other
            ))),
        })
        .transpose()
}

fn parse_u64(key: &str, value: Option<String>) -> Result<Option<u64>, ControllerError> {
    value
        .map(|v| {
            v.trim().parse::<u64>().map_err(|e| {
                ControllerError::Config(format!("{} must be a number, got {:?}: {}", key, v, e))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ControllerConfig, ControllerError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ControllerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.switch_wait_timeout, Duration::from_secs(30));
        assert_eq!(config.switch_wait_interval, Duration::from_millis(30));
    }

    #[test]
    fn test_parses_subnet_lists() {
        let config = load(&[
            ("CLUSTER_SUBNETS", "10.128.0.0/14/23, fd00:10:128::/48"),
            ("SERVICE_SUBNETS", "172.30.0.0/16"),
            ("ENABLE_MULTICAST", "true"),
            ("NBDB_TIMEOUT_SECS", "5"),
        ])
        .unwrap();
        assert_eq!(
            config.cluster_subnets,
            vec![
                "10.128.0.0/14".parse::<IpNet>().unwrap(),
                "fd00:10:128::/48".parse::<IpNet>().unwrap()
            ]
        );
        assert_eq!(config.service_subnets.len(), 1);
        assert!(config.enable_multicast);
        assert_eq!(config.nbdb_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_rejects_malformed_values() {
        assert!(matches!(
            load(&[("CLUSTER_SUBNETS", "10.128.0.0/33")]),
            Err(ControllerError::Config(_))
        ));
        assert!(matches!(
            load(&[("DISABLE_SNAT_MULTIPLE_GWS", "maybe")]),
            Err(ControllerError::Config(_))
        ));
        assert!(matches!(
            load(&[("SWEEP_INTERVAL_SECS", "-1")]),
            Err(ControllerError::Config(_))
        ));
    }
}
