//! Northbound database models
//!
//! These models mirror the subset of the OVN northbound schema the pod
//! network controller reads and writes. Reference columns hold row UUIDs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Free-form key/value column (`external_ids`, `options`, `other_config`)
pub type StringMap = BTreeMap<String, String>;

/// Logical switch: one node's network segment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalSwitch {
    pub uuid: String,
    pub name: String,
    /// Strong references to `Logical_Switch_Port` rows
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub other_config: StringMap,
    #[serde(default)]
    pub external_ids: StringMap,
}

impl LogicalSwitch {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Logical switch port: one workload's attachment to a switch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalSwitchPort {
    pub uuid: String,
    pub name: String,
    /// Each entry is "MAC IP [IP...]" or "dynamic"
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub dynamic_addresses: Option<String>,
    #[serde(default)]
    pub port_security: Vec<String>,
    #[serde(default)]
    pub external_ids: StringMap,
    #[serde(default)]
    pub options: StringMap,
}

impl LogicalSwitchPort {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Address string currently in effect for the port.
    ///
    /// Dynamic addresses win over static ones, as the database assigned them.
    pub fn effective_addresses(&self) -> Option<&str> {
        self.dynamic_addresses
            .as_deref()
            .or_else(|| self.addresses.first().map(String::as_str))
            .filter(|a| !a.is_empty() && *a != "dynamic")
    }
}

/// Port group: a named set of ports used by ACLs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortGroup {
    pub uuid: String,
    pub name: String,
    /// Weak references to `Logical_Switch_Port` rows
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub external_ids: StringMap,
}

impl PortGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Logical router (the per-node gateway router `GR_<node>`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalRouter {
    pub uuid: String,
    pub name: String,
    /// Strong references to `NAT` rows
    #[serde(default)]
    pub nat: Vec<String>,
    #[serde(default)]
    pub external_ids: StringMap,
}

impl LogicalRouter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// NAT rule type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
    #[default]
    Snat,
    Dnat,
    DnatAndSnat,
}

/// NAT rule attached to a logical router
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nat {
    pub uuid: String,
    #[serde(rename = "type")]
    pub nat_type: NatType,
    pub logical_ip: String,
    pub external_ip: String,
    #[serde(default)]
    pub logical_port: Option<String>,
    #[serde(default)]
    pub external_ids: StringMap,
}

/// Database tables known to the contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    LogicalSwitch,
    LogicalSwitchPort,
    PortGroup,
    LogicalRouter,
    Nat,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Table::LogicalSwitch => "Logical_Switch",
            Table::LogicalSwitchPort => "Logical_Switch_Port",
            Table::PortGroup => "Port_Group",
            Table::LogicalRouter => "Logical_Router",
            Table::Nat => "NAT",
        };
        f.write_str(name)
    }
}

/// A row of any known table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Row {
    LogicalSwitch(LogicalSwitch),
    LogicalSwitchPort(LogicalSwitchPort),
    PortGroup(PortGroup),
    LogicalRouter(LogicalRouter),
    Nat(Nat),
}

impl Row {
    pub fn table(&self) -> Table {
        match self {
            Row::LogicalSwitch(_) => Table::LogicalSwitch,
            Row::LogicalSwitchPort(_) => Table::LogicalSwitchPort,
            Row::PortGroup(_) => Table::PortGroup,
            Row::LogicalRouter(_) => Table::LogicalRouter,
            Row::Nat(_) => Table::Nat,
        }
    }

    pub fn uuid(&self) -> &str {
        match self {
            Row::LogicalSwitch(r) => &r.uuid,
            Row::LogicalSwitchPort(r) => &r.uuid,
            Row::PortGroup(r) => &r.uuid,
            Row::LogicalRouter(r) => &r.uuid,
            Row::Nat(r) => &r.uuid,
        }
    }

    pub fn set_uuid(&mut self, uuid: String) {
        match self {
            Row::LogicalSwitch(r) => r.uuid = uuid,
            Row::LogicalSwitchPort(r) => r.uuid = uuid,
            Row::PortGroup(r) => r.uuid = uuid,
            Row::LogicalRouter(r) => r.uuid = uuid,
            Row::Nat(r) => r.uuid = uuid,
        }
    }

    /// Name index value; NAT rows have none.
    pub fn name(&self) -> Option<&str> {
        match self {
            Row::LogicalSwitch(r) => Some(&r.name),
            Row::LogicalSwitchPort(r) => Some(&r.name),
            Row::PortGroup(r) => Some(&r.name),
            Row::LogicalRouter(r) => Some(&r.name),
            Row::Nat(_) => None,
        }
    }
}

macro_rules! row_conversions {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Row {
                fn from(row: $variant) -> Self {
                    Row::$variant(row)
                }
            }

            impl TryFrom<Row> for $variant {
                type Error = crate::error::NbdbError;

                fn try_from(row: Row) -> Result<Self, Self::Error> {
                    match row {
                        Row::$variant(inner) => Ok(inner),
                        other => Err(crate::error::NbdbError::UnexpectedRow {
                            expected: Table::$variant,
                            found: other.table(),
                        }),
                    }
                }
            }
        )*
    };
}

row_conversions!(LogicalSwitch, LogicalSwitchPort, PortGroup, LogicalRouter, Nat);

/// Row selector for conditional operations (`where`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selector {
    Uuid(String),
    Name(String),
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Uuid(uuid) => write!(f, "_uuid == {}", uuid),
            Selector::Name(name) => write!(f, "name == {}", name),
        }
    }
}

/// Columns that can be targeted by update and mutate operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Column {
    Ports,
    Nat,
    Addresses,
    PortSecurity,
    ExternalIds,
    Options,
}

/// Set mutators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutator {
    Insert,
    Delete,
}

/// One set mutation on a reference/set column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub column: Column,
    pub mutator: Mutator,
    pub values: Vec<String>,
}

/// A single database operation; many are submitted together in one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Insert a new row; the row's uuid may be a named UUID
    Insert { row: Row },
    /// Overwrite the listed columns of the selected row
    Update {
        table: Table,
        selector: Selector,
        row: Row,
        columns: Vec<Column>,
    },
    /// Apply set mutations to the selected row
    Mutate {
        table: Table,
        selector: Selector,
        mutations: Vec<Mutation>,
    },
    /// Delete the selected row
    Delete { table: Table, selector: Selector },
}

impl Operation {
    pub fn table(&self) -> Table {
        match self {
            Operation::Insert { row } => row.table(),
            Operation::Update { table, .. }
            | Operation::Mutate { table, .. }
            | Operation::Delete { table, .. } => *table,
        }
    }
}

/// Per-operation outcome of a committed transaction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    /// Real UUID of an inserted row
    pub uuid: Option<String>,
    /// Rows affected
    pub count: usize,
}
