//! Pod Network Controller
//!
//! Gives every scheduled pod a logical switch port in the cluster network
//! database:
//! - allocates pod addresses from the per-node host subnets
//! - records them on the pod as the `k8s.ovn.org/pod-networks` annotation
//! - creates or updates the port, and optional per-pod SNAT, in one transaction
//! - removes ports of deleted pods and sweeps ports left behind by pods that
//!   no longer exist
//!
//! The database is reached through [`nbdb_client::NbdbClientTrait`]; the
//! embedding process supplies the client and serves the metrics registry.
//!
//! # Example
//!
//! ```no_run
//! use pod_network::{Controller, ControllerConfig, telemetry};
//! use std::sync::Arc;
//!
//! # async fn example(nbdb: Arc<dyn nbdb_client::NbdbClientTrait>) -> Result<(), pod_network::ControllerError> {
//! telemetry::init_tracing();
//! let config = ControllerConfig::from_env()?;
//! let client = kube::Client::try_default().await?;
//! let registry = prometheus::Registry::new();
//! let controller = Controller::new(client, nbdb, config, &registry).await?;
//! controller.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod annotation;
pub mod backoff;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod ipam;
pub mod mac;
pub mod metrics;
pub mod node;
pub mod port_cache;
pub mod reconciler;
pub mod retry;
pub mod routes;
pub mod telemetry;
pub mod watcher;
pub mod workload;
#[cfg(test)]
mod test_utils;

pub use config::ControllerConfig;
pub use controller::Controller;
pub use error::ControllerError;
pub use reconciler::{AddOutcome, Reconciler, SkipReason, SweepMode, SweepReport};
pub use workload::Workload;
