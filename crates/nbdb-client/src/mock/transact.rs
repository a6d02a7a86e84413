//! Transaction application for MockNbdbClient
//!
//! Operations are applied to a staged copy of the database. The copy only
//! replaces the committed state when every operation succeeded and the
//! integrity checks pass.

use super::Database;
use crate::error::NbdbError;
use crate::models::*;
use crate::ops::is_named_uuid;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

type NamedUuids = HashMap<String, String>;

pub(crate) fn apply(
    db: &Database,
    ops: Vec<Operation>,
) -> Result<(Database, Vec<OperationResult>), NbdbError> {
    let mut staged = db.clone();
    let mut named = NamedUuids::new();
    let mut results = Vec::with_capacity(ops.len());

    for (index, op) in ops.into_iter().enumerate() {
        let result = apply_one(&mut staged, &mut named, op).map_err(|e| {
            NbdbError::TransactionFailed(format!("operation {} failed: {}", index, e))
        })?;
        results.push(result);
    }

    check_strong_references(&staged)
        .map_err(|e| NbdbError::TransactionFailed(e.to_string()))?;
    collect_garbage(&mut staged);

    Ok((staged, results))
}

fn apply_one(
    db: &mut Database,
    named: &mut NamedUuids,
    op: Operation,
) -> Result<OperationResult, NbdbError> {
    match op {
        Operation::Insert { mut row } => {
            let real = Uuid::new_v4().to_string();
            let requested = row.uuid().to_string();
            if is_named_uuid(&requested) {
                named.insert(requested, real.clone());
            } else if !requested.is_empty() {
                return Err(NbdbError::InvalidOperation(format!(
                    "insert into {} with explicit uuid {}",
                    row.table(),
                    requested
                )));
            }
            substitute_references(&mut row, named);

            if let Some(name) = row.name() {
                if db.rows(row.table()).any(|existing| existing.name() == Some(name)) {
                    return Err(NbdbError::Constraint(format!(
                        "{} row named {} already exists",
                        row.table(),
                        name
                    )));
                }
            }

            row.set_uuid(real.clone());
            db.table_mut(row.table()).insert(real.clone(), row);
            Ok(OperationResult {
                uuid: Some(real),
                count: 1,
            })
        }
        Operation::Update {
            table,
            selector,
            mut row,
            columns,
        } => {
            if row.table() != table {
                return Err(NbdbError::InvalidOperation(format!(
                    "update of {} with a {} row",
                    table,
                    row.table()
                )));
            }
            substitute_references(&mut row, named);
            let uuid = db.resolve(table, &resolve_selector(selector, named))?;
            let existing = db
                .table_mut(table)
                .get_mut(&uuid)
                .ok_or_else(|| NbdbError::NotFound(format!("{} row {}", table, uuid)))?;
            for column in columns {
                copy_column(existing, &row, column)?;
            }
            Ok(OperationResult { uuid: None, count: 1 })
        }
        Operation::Mutate {
            table,
            selector,
            mutations,
        } => {
            let uuid = db.resolve(table, &resolve_selector(selector, named))?;
            for mutation in mutations {
                let values: Vec<String> = mutation
                    .values
                    .iter()
                    .map(|v| named.get(v).cloned().unwrap_or_else(|| v.clone()))
                    .collect();
                let existing = db
                    .table_mut(table)
                    .get_mut(&uuid)
                    .ok_or_else(|| NbdbError::NotFound(format!("{} row {}", table, uuid)))?;
                let set = set_column_mut(existing, mutation.column)?;
                match mutation.mutator {
                    Mutator::Insert => {
                        for value in values {
                            if !set.contains(&value) {
                                set.push(value);
                            }
                        }
                    }
                    Mutator::Delete => set.retain(|v| !values.contains(v)),
                }
            }
            Ok(OperationResult { uuid: None, count: 1 })
        }
        Operation::Delete { table, selector } => {
            let uuid = db.resolve(table, &resolve_selector(selector, named))?;
            db.table_mut(table).remove(&uuid);
            Ok(OperationResult { uuid: None, count: 1 })
        }
    }
}

fn resolve_selector(selector: Selector, named: &NamedUuids) -> Selector {
    match selector {
        Selector::Uuid(uuid) => Selector::Uuid(named.get(&uuid).cloned().unwrap_or(uuid)),
        other => other,
    }
}

fn substitute_references(row: &mut Row, named: &NamedUuids) {
    let refs = match row {
        Row::LogicalSwitch(ls) => &mut ls.ports,
        Row::PortGroup(pg) => &mut pg.ports,
        Row::LogicalRouter(lr) => &mut lr.nat,
        Row::LogicalSwitchPort(_) | Row::Nat(_) => return,
    };
    for value in refs.iter_mut() {
        if let Some(real) = named.get(value) {
            *value = real.clone();
        }
    }
}

fn copy_column(existing: &mut Row, new: &Row, column: Column) -> Result<(), NbdbError> {
    match (existing, new, column) {
        (Row::LogicalSwitchPort(e), Row::LogicalSwitchPort(n), Column::Addresses) => {
            e.addresses = n.addresses.clone();
        }
        (Row::LogicalSwitchPort(e), Row::LogicalSwitchPort(n), Column::PortSecurity) => {
            e.port_security = n.port_security.clone();
        }
        (Row::LogicalSwitchPort(e), Row::LogicalSwitchPort(n), Column::ExternalIds) => {
            e.external_ids = n.external_ids.clone();
        }
        (Row::LogicalSwitchPort(e), Row::LogicalSwitchPort(n), Column::Options) => {
            e.options = n.options.clone();
        }
        (Row::LogicalSwitch(e), Row::LogicalSwitch(n), Column::Ports) => e.ports = n.ports.clone(),
        (Row::LogicalSwitch(e), Row::LogicalSwitch(n), Column::ExternalIds) => {
            e.external_ids = n.external_ids.clone();
        }
        (Row::PortGroup(e), Row::PortGroup(n), Column::Ports) => e.ports = n.ports.clone(),
        (Row::PortGroup(e), Row::PortGroup(n), Column::ExternalIds) => {
            e.external_ids = n.external_ids.clone();
        }
        (Row::LogicalRouter(e), Row::LogicalRouter(n), Column::Nat) => e.nat = n.nat.clone(),
        (Row::LogicalRouter(e), Row::LogicalRouter(n), Column::ExternalIds) => {
            e.external_ids = n.external_ids.clone();
        }
        (Row::Nat(e), Row::Nat(n), Column::ExternalIds) => e.external_ids = n.external_ids.clone(),
        (existing, _, column) => {
            return Err(NbdbError::InvalidOperation(format!(
                "column {:?} cannot be updated on {}",
                column,
                existing.table()
            )));
        }
    }
    Ok(())
}

fn set_column_mut(row: &mut Row, column: Column) -> Result<&mut Vec<String>, NbdbError> {
    let table = row.table();
    match (row, column) {
        (Row::LogicalSwitch(ls), Column::Ports) => Ok(&mut ls.ports),
        (Row::PortGroup(pg), Column::Ports) => Ok(&mut pg.ports),
        (Row::LogicalRouter(lr), Column::Nat) => Ok(&mut lr.nat),
        (Row::LogicalSwitchPort(lsp), Column::Addresses) => Ok(&mut lsp.addresses),
        (Row::LogicalSwitchPort(lsp), Column::PortSecurity) => Ok(&mut lsp.port_security),
        (_, column) => Err(NbdbError::InvalidOperation(format!(
            "column {:?} of {} is not a set",
            column, table
        ))),
    }
}

/// Switch ports and router NAT entries are strong references.
fn check_strong_references(db: &Database) -> Result<(), NbdbError> {
    for row in db.rows(Table::LogicalSwitch) {
        if let Row::LogicalSwitch(ls) = row {
            if let Some(missing) = ls
                .ports
                .iter()
                .find(|port| !db.contains(Table::LogicalSwitchPort, port))
            {
                return Err(NbdbError::Constraint(format!(
                    "logical switch {} references missing port {}",
                    ls.name, missing
                )));
            }
        }
    }
    for row in db.rows(Table::LogicalRouter) {
        if let Row::LogicalRouter(lr) = row {
            if let Some(missing) = lr.nat.iter().find(|nat| !db.contains(Table::Nat, nat)) {
                return Err(NbdbError::Constraint(format!(
                    "logical router {} references missing NAT {}",
                    lr.name, missing
                )));
            }
        }
    }
    Ok(())
}

/// Ports and NAT rules are non-root rows: drop the unreferenced ones, then
/// clear weak port group references to rows that no longer exist.
fn collect_garbage(db: &mut Database) {
    let referenced_ports: HashSet<String> = db
        .rows(Table::LogicalSwitch)
        .filter_map(|row| match row {
            Row::LogicalSwitch(ls) => Some(ls.ports.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    db.table_mut(Table::LogicalSwitchPort)
        .retain(|uuid, _| referenced_ports.contains(uuid));

    let referenced_nats: HashSet<String> = db
        .rows(Table::LogicalRouter)
        .filter_map(|row| match row {
            Row::LogicalRouter(lr) => Some(lr.nat.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    db.table_mut(Table::Nat)
        .retain(|uuid, _| referenced_nats.contains(uuid));

    let live_ports: HashSet<String> = db
        .rows(Table::LogicalSwitchPort)
        .map(|row| row.uuid().to_string())
        .collect();
    for row in db.table_mut(Table::PortGroup).values_mut() {
        if let Row::PortGroup(pg) = row {
            pg.ports.retain(|port| live_ports.contains(port));
        }
    }
}
