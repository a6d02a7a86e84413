//! Northbound Database Client Contract
//!
//! Typed rows, an operation builder and the async client trait used by the
//! pod network controller to talk to the transactional network database.
//! The wire client lives with the embedding process; this crate only carries
//! the contract plus an in-memory implementation for tests.
//!
//! # Example
//!
//! ```no_run
//! use nbdb_client::{create, Column, LogicalSwitchPort, Mutator, NbdbClientTrait, Table, Where};
//!
//! # async fn example(client: &dyn NbdbClientTrait) -> Result<(), nbdb_client::NbdbError> {
//! let switch = client.find_logical_switch("node1").await?;
//!
//! let mut port = LogicalSwitchPort::new("default_web-0");
//! port.uuid = nbdb_client::build_named_uuid();
//!
//! let ops = vec![
//!     create(port.clone()),
//!     Where::uuid(Table::LogicalSwitch, &switch.uuid)
//!         .mutate(Column::Ports, Mutator::Insert, vec![port.uuid.clone()]),
//! ];
//! let results = client.transact(ops).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Typed rows**: logical switches, ports, port groups, routers and NAT rules
//! - **Composable operations**: create, update, mutate and delete in one transaction
//! - **Named UUIDs**: rows created in a transaction can be referenced by later operations
//! - **Mock database** (`test-util`): atomic in-memory transactions with failure injection

pub mod error;
pub mod models;
pub mod ops;
#[path = "trait.rs"]
pub mod nbdb_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use error::NbdbError;
pub use models::*;
pub use ops::{build_named_uuid, create, is_named_uuid, Where};
pub use nbdb_trait::NbdbClientTrait;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockNbdbClient;
