//! NbdbClient trait for mocking
//!
//! This trait abstracts the northbound database client so the controller can
//! be driven by the real client in production and by `MockNbdbClient` in
//! unit tests.

use crate::error::NbdbError;
use crate::models::*;

/// Trait for northbound database operations
///
/// `get` and `list` read committed state; `transact` applies a batch of
/// operations atomically: either every operation is applied or none is.
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait NbdbClientTrait: Send + Sync {
    /// Fetch exactly one row; `NbdbError::NotFound` when nothing matches.
    async fn get(&self, table: Table, selector: &Selector) -> Result<Row, NbdbError>;

    /// List every row of a table.
    async fn list(&self, table: Table) -> Result<Vec<Row>, NbdbError>;

    /// Submit operations as a single all-or-nothing transaction.
    async fn transact(&self, ops: Vec<Operation>) -> Result<Vec<OperationResult>, NbdbError>;

    // Typed helpers

    async fn get_logical_switch_port(&self, name: &str) -> Result<LogicalSwitchPort, NbdbError> {
        let row = self
            .get(Table::LogicalSwitchPort, &Selector::Name(name.to_string()))
            .await?;
        LogicalSwitchPort::try_from(row)
    }

    async fn find_logical_switch(&self, name: &str) -> Result<LogicalSwitch, NbdbError> {
        let row = self
            .get(Table::LogicalSwitch, &Selector::Name(name.to_string()))
            .await?;
        LogicalSwitch::try_from(row)
    }

    async fn get_port_group(&self, name: &str) -> Result<PortGroup, NbdbError> {
        let row = self
            .get(Table::PortGroup, &Selector::Name(name.to_string()))
            .await?;
        PortGroup::try_from(row)
    }

    async fn get_logical_router(&self, name: &str) -> Result<LogicalRouter, NbdbError> {
        let row = self
            .get(Table::LogicalRouter, &Selector::Name(name.to_string()))
            .await?;
        LogicalRouter::try_from(row)
    }

    async fn list_logical_switches(&self) -> Result<Vec<LogicalSwitch>, NbdbError> {
        self.list(Table::LogicalSwitch)
            .await?
            .into_iter()
            .map(LogicalSwitch::try_from)
            .collect()
    }

    async fn list_logical_switch_ports(&self) -> Result<Vec<LogicalSwitchPort>, NbdbError> {
        self.list(Table::LogicalSwitchPort)
            .await?
            .into_iter()
            .map(LogicalSwitchPort::try_from)
            .collect()
    }

    async fn list_nats(&self) -> Result<Vec<Nat>, NbdbError> {
        self.list(Table::Nat)
            .await?
            .into_iter()
            .map(Nat::try_from)
            .collect()
    }
}
