//! Operation builders
//!
//! Small helpers for composing the operations of a transaction, in the
//! `create(row)` / `where(row).update|mutate|delete` shape.

use crate::models::{Column, Mutation, Mutator, Operation, Row, Selector, Table};
use uuid::Uuid;

const NAMED_UUID_PREFIX: char = 'u';

/// Build a transaction-local UUID for a row that does not exist yet.
///
/// Later operations in the same transaction may reference the row by this
/// value; the database replaces it with the real UUID on commit.
pub fn build_named_uuid() -> String {
    format!("{}{}", NAMED_UUID_PREFIX, Uuid::new_v4().simple())
}

/// Returns true for UUIDs produced by [`build_named_uuid`].
pub fn is_named_uuid(uuid: &str) -> bool {
    uuid.starts_with(NAMED_UUID_PREFIX)
}

/// Insert a new row.
pub fn create(row: impl Into<Row>) -> Operation {
    Operation::Insert { row: row.into() }
}

/// Conditional operation builder
#[derive(Debug, Clone)]
pub struct Where {
    table: Table,
    selector: Selector,
}

impl Where {
    /// Select a row by UUID (real or named).
    pub fn uuid(table: Table, uuid: impl Into<String>) -> Self {
        Self {
            table,
            selector: Selector::Uuid(uuid.into()),
        }
    }

    /// Select a row by its name index.
    pub fn name(table: Table, name: impl Into<String>) -> Self {
        Self {
            table,
            selector: Selector::Name(name.into()),
        }
    }

    /// Overwrite `columns` of the selected row with the values in `row`.
    pub fn update(self, row: impl Into<Row>, columns: &[Column]) -> Operation {
        Operation::Update {
            table: self.table,
            selector: self.selector,
            row: row.into(),
            columns: columns.to_vec(),
        }
    }

    /// Insert into or delete from a set column of the selected row.
    pub fn mutate(self, column: Column, mutator: Mutator, values: Vec<String>) -> Operation {
        Operation::Mutate {
            table: self.table,
            selector: self.selector,
            mutations: vec![Mutation {
                column,
                mutator,
                values,
            }],
        }
    }

    /// Delete the selected row.
    pub fn delete(self) -> Operation {
        Operation::Delete {
            table: self.table,
            selector: self.selector,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LogicalSwitchPort;

    #[test]
    fn test_named_uuid_is_recognised() {
        let named = build_named_uuid();
        assert!(is_named_uuid(&named));
        assert!(!is_named_uuid(&Uuid::new_v4().to_string()));
    }

    #[test]
    fn test_where_update_keeps_columns() {
        let op = Where::name(Table::LogicalSwitchPort, "ns_pod")
            .update(LogicalSwitchPort::new("ns_pod"), &[Column::Addresses, Column::PortSecurity]);
        match op {
            Operation::Update { table, selector, columns, .. } => {
                assert_eq!(table, Table::LogicalSwitchPort);
                assert_eq!(selector, Selector::Name("ns_pod".to_string()));
                assert_eq!(columns, vec![Column::Addresses, Column::PortSecurity]);
            }
            other => panic!("unexpected operation {:?}", other),
        }
    }
}
