//! Northbound database client errors

use thiserror::Error;

/// Errors that can occur when talking to the northbound database
#[derive(Debug, Error)]
pub enum NbdbError {
    /// No row matched the lookup
    #[error("Not found: {0}")]
    NotFound(String),

    /// A uniqueness or referential integrity constraint was violated
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// The transaction was rejected; none of its operations were applied
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// The operation is malformed (wrong column for table, missing selector, ...)
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A lookup returned a row from a different table than requested
    #[error("Unexpected row: expected {expected}, found {found}")]
    UnexpectedRow {
        expected: crate::models::Table,
        found: crate::models::Table,
    },

    /// The database connection is not usable
    #[error("Connection error: {0}")]
    Connection(String),
}

impl NbdbError {
    /// Returns true when the error means the row simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, NbdbError::NotFound(_))
    }
}
