//! Mock NbdbClient for unit testing
//!
//! This module provides an in-memory implementation of `NbdbClientTrait` that
//! can be used in unit tests without a running database.
//!
//! The mock is organized into:
//! - `transact.rs` - transaction application (named UUIDs, columns, integrity, GC)
//! - `tests.rs` - transaction semantics tests

mod transact;

use crate::error::NbdbError;
use crate::models::*;
use crate::nbdb_trait::NbdbClientTrait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

/// Committed database contents, keyed by table then row UUID
#[derive(Debug, Clone, Default)]
pub(crate) struct Database {
    pub(crate) tables: HashMap<Table, BTreeMap<String, Row>>,
}

impl Database {
    pub(crate) fn rows(&self, table: Table) -> impl Iterator<Item = &Row> {
        self.tables.get(&table).into_iter().flat_map(|rows| rows.values())
    }

    pub(crate) fn table_mut(&mut self, table: Table) -> &mut BTreeMap<String, Row> {
        self.tables.entry(table).or_default()
    }

    pub(crate) fn contains(&self, table: Table, uuid: &str) -> bool {
        self.tables
            .get(&table)
            .is_some_and(|rows| rows.contains_key(uuid))
    }

    /// Resolve a selector to exactly one row UUID.
    pub(crate) fn resolve(&self, table: Table, selector: &Selector) -> Result<String, NbdbError> {
        match selector {
            Selector::Uuid(uuid) => {
                if self.contains(table, uuid) {
                    Ok(uuid.clone())
                } else {
                    Err(NbdbError::NotFound(format!("{} row {}", table, uuid)))
                }
            }
            Selector::Name(name) => {
                if table == Table::Nat {
                    return Err(NbdbError::InvalidOperation(
                        "NAT rows have no name index".to_string(),
                    ));
                }
                let matches: Vec<&Row> = self
                    .rows(table)
                    .filter(|row| row.name() == Some(name.as_str()))
                    .collect();
                match matches.as_slice() {
                    [] => Err(NbdbError::NotFound(format!("{} row named {}", table, name))),
                    [row] => Ok(row.uuid().to_string()),
                    _ => Err(NbdbError::Constraint(format!(
                        "multiple {} rows named {}",
                        table, name
                    ))),
                }
            }
        }
    }
}

/// Mock NbdbClient for testing
///
/// Stores rows in memory and applies transactions atomically. Tests can seed
/// rows directly and inject transaction failures.
#[derive(Clone, Default)]
pub struct MockNbdbClient {
    pub(crate) db: Arc<Mutex<Database>>,
    pub(crate) failing_transactions: Arc<Mutex<usize>>,
    pub(crate) transactions: Arc<Mutex<Vec<Vec<Operation>>>>,
}

impl MockNbdbClient {
    /// Create an empty mock database
    pub fn new() -> Self {
        Self::default()
    }

    fn seed(&self, mut row: Row) -> String {
        let uuid = Uuid::new_v4().to_string();
        row.set_uuid(uuid.clone());
        self.db
            .lock()
            .unwrap()
            .table_mut(row.table())
            .insert(uuid.clone(), row);
        uuid
    }

    /// Add a logical switch (for test setup)
    pub fn add_logical_switch(&self, name: &str) -> String {
        self.seed(LogicalSwitch::new(name).into())
    }

    /// Add a port and attach it to an existing switch (for test setup)
    pub fn add_logical_switch_port(&self, switch: &str, port: LogicalSwitchPort) -> String {
        let port_uuid = self.seed(port.into());
        let mut db = self.db.lock().unwrap();
        let switch_uuid = db
            .resolve(Table::LogicalSwitch, &Selector::Name(switch.to_string()))
            .unwrap();
        if let Some(Row::LogicalSwitch(ls)) = db.table_mut(Table::LogicalSwitch).get_mut(&switch_uuid) {
            ls.ports.push(port_uuid.clone());
        }
        port_uuid
    }

    /// Add a port group (for test setup)
    pub fn add_port_group(&self, name: &str) -> String {
        self.seed(PortGroup::new(name).into())
    }

    /// Add a logical router (for test setup)
    pub fn add_logical_router(&self, name: &str) -> String {
        self.seed(LogicalRouter::new(name).into())
    }

    /// Make the next `count` transactions fail without applying anything
    pub fn fail_next_transactions(&self, count: usize) {
        *self.failing_transactions.lock().unwrap() = count;
    }

    /// Number of committed transactions
    pub fn transaction_count(&self) -> usize {
        self.transactions.lock().unwrap().len()
    }

    /// Operations of every committed transaction, oldest first
    pub fn committed_transactions(&self) -> Vec<Vec<Operation>> {
        self.transactions.lock().unwrap().clone()
    }

    /// Snapshot of a table (for assertions)
    pub fn rows(&self, table: Table) -> Vec<Row> {
        self.db.lock().unwrap().rows(table).cloned().collect()
    }

    fn named<T: TryFrom<Row>>(&self, table: Table, name: &str) -> Option<T> {
        let db = self.db.lock().unwrap();
        let uuid = db.resolve(table, &Selector::Name(name.to_string())).ok()?;
        db.tables
            .get(&table)
            .and_then(|rows| rows.get(&uuid))
            .cloned()
            .and_then(|row| T::try_from(row).ok())
    }

    pub fn logical_switch(&self, name: &str) -> Option<LogicalSwitch> {
        self.named(Table::LogicalSwitch, name)
    }

    pub fn logical_switch_port(&self, name: &str) -> Option<LogicalSwitchPort> {
        self.named(Table::LogicalSwitchPort, name)
    }

    pub fn port_group(&self, name: &str) -> Option<PortGroup> {
        self.named(Table::PortGroup, name)
    }

    pub fn logical_router(&self, name: &str) -> Option<LogicalRouter> {
        self.named(Table::LogicalRouter, name)
    }

    pub fn nats(&self) -> Vec<Nat> {
        self.rows(Table::Nat)
            .into_iter()
            .filter_map(|row| Nat::try_from(row).ok())
            .collect()
    }
}

#[async_trait::async_trait]
impl NbdbClientTrait for MockNbdbClient {
    async fn get(&self, table: Table, selector: &Selector) -> Result<Row, NbdbError> {
        let db = self.db.lock().unwrap();
        let uuid = db.resolve(table, selector)?;
        db.tables
            .get(&table)
            .and_then(|rows| rows.get(&uuid))
            .cloned()
            .ok_or_else(|| NbdbError::NotFound(format!("{} row {}", table, selector)))
    }

    async fn list(&self, table: Table) -> Result<Vec<Row>, NbdbError> {
        Ok(self.rows(table))
    }

    async fn transact(&self, ops: Vec<Operation>) -> Result<Vec<OperationResult>, NbdbError> {
        {
            let mut failing = self.failing_transactions.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(NbdbError::TransactionFailed(
                    "injected transaction failure".to_string(),
                ));
            }
        }

        let mut db = self.db.lock().unwrap();
        let (staged, results) = transact::apply(&db, ops.clone())?;
        *db = staged;
        debug!("mock nbdb committed transaction with {} operations", ops.len());
        self.transactions.lock().unwrap().push(ops);
        Ok(results)
    }
}
