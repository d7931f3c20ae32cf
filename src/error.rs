//! # Error Kinds
//!
//! The well-known failure conditions of the engine as a tagged sum. The
//! crate-wide result type stays `eyre::Result`; a [`DbError`] is raised
//! through `eyre::Report` (it implements `std::error::Error`), so call sites
//! keep the usual `bail!`/`ensure!`/`?` texture while callers that need to
//! branch on the kind use `report.downcast_ref::<DbError>()`.
//!
//! Every variant carries the fully-qualified name of the offending object
//! where one exists, and maps to a stable numeric code via [`DbError::code`].
//! Binder and planner errors never mutate catalogue state; storage errors
//! mark the enclosing transaction as failed before they propagate.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DbError {
    #[error("data corruption in {0}: {1}")]
    DataCorruption(String, String),
    #[error("file {0} is locked by another process")]
    FileLocked(String),

    #[error("schema {0} does not exist")]
    SchemaDoesNotExist(String),
    #[error("entity {0} does not exist")]
    EntityDoesNotExist(String),
    #[error("column {0} does not exist")]
    ColumnDoesNotExist(String),
    #[error("index {0} does not exist")]
    IndexDoesNotExist(String),
    #[error("schema {0} already exists")]
    SchemaAlreadyExists(String),
    #[error("entity {0} already exists")]
    EntityAlreadyExists(String),
    #[error("duplicate column {0}")]
    DuplicateColumn(String),

    #[error("transaction {0} has already been closed")]
    TransactionClosed(u64),
    #[error("transaction {0} is read-only")]
    TransactionReadOnly(u64),
    #[error("transaction {0} is in an error state and can only be rolled back")]
    TransactionInError(u64),
    #[error("transaction {0} could not acquire a write lock on {1}")]
    TransactionWriteLockFailed(u64, String),
    #[error("transaction {0} accessed {1}, which has been closed")]
    TransactionDboClosed(u64, String),

    #[error("query syntax error: {0}")]
    QuerySyntax(String),
    #[error("query binding failed: {0}")]
    QueryBind(String),
    #[error("no executable plan for query: {0}")]
    QueryPlanner(String),
    #[error("unsupported predicate: {0}")]
    UnsupportedPredicate(String),
    #[error("operator setup failed: {0}")]
    OperatorSetup(String),
    #[error("operator execution failed: {0}")]
    OperatorExecution(String),
    #[error("predicate not supported by index {0}")]
    PredicateNotSupportedByIndex(String),
    #[error("transaction validation failed for {0}: {1}")]
    TxValidation(String, String),

    #[error("deadline expired while {0}")]
    Timeout(String),
    #[error("transaction {0} was cancelled")]
    Cancelled(u64),
}

impl DbError {
    /// Stable wire-level code for the error kind.
    pub fn code(&self) -> u16 {
        match self {
            DbError::DataCorruption(..) => 1,
            DbError::FileLocked(..) => 2,
            DbError::SchemaDoesNotExist(..) => 10,
            DbError::EntityDoesNotExist(..) => 11,
            DbError::ColumnDoesNotExist(..) => 12,
            DbError::IndexDoesNotExist(..) => 13,
            DbError::SchemaAlreadyExists(..) => 14,
            DbError::EntityAlreadyExists(..) => 15,
            DbError::DuplicateColumn(..) => 16,
            DbError::TransactionClosed(..) => 20,
            DbError::TransactionReadOnly(..) => 21,
            DbError::TransactionInError(..) => 22,
            DbError::TransactionWriteLockFailed(..) => 23,
            DbError::TransactionDboClosed(..) => 24,
            DbError::QuerySyntax(..) => 30,
            DbError::QueryBind(..) => 31,
            DbError::QueryPlanner(..) => 32,
            DbError::UnsupportedPredicate(..) => 33,
            DbError::OperatorSetup(..) => 34,
            DbError::OperatorExecution(..) => 35,
            DbError::PredicateNotSupportedByIndex(..) => 36,
            DbError::TxValidation(..) => 37,
            DbError::Timeout(..) => 40,
            DbError::Cancelled(..) => 41,
        }
    }
}

/// Looks up the [`DbError`] kind inside an `eyre::Report`, if any.
pub fn kind_of(report: &eyre::Report) -> Option<&DbError> {
    report.downcast_ref::<DbError>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct() {
        let errors = [
            DbError::DataCorruption("a".into(), "b".into()),
            DbError::FileLocked("f".into()),
            DbError::SchemaDoesNotExist("s".into()),
            DbError::EntityDoesNotExist("e".into()),
            DbError::ColumnDoesNotExist("c".into()),
            DbError::IndexDoesNotExist("i".into()),
            DbError::SchemaAlreadyExists("s".into()),
            DbError::EntityAlreadyExists("e".into()),
            DbError::DuplicateColumn("c".into()),
            DbError::TransactionClosed(1),
            DbError::TransactionReadOnly(1),
            DbError::TransactionInError(1),
            DbError::TransactionWriteLockFailed(1, "e".into()),
            DbError::TransactionDboClosed(1, "e".into()),
            DbError::QuerySyntax("q".into()),
            DbError::QueryBind("q".into()),
            DbError::QueryPlanner("q".into()),
            DbError::UnsupportedPredicate("p".into()),
            DbError::OperatorSetup("o".into()),
            DbError::OperatorExecution("o".into()),
            DbError::PredicateNotSupportedByIndex("i".into()),
            DbError::TxValidation("e".into(), "dup".into()),
            DbError::Timeout("waiting".into()),
            DbError::Cancelled(1),
        ];
        let mut codes: Vec<u16> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn downcast_through_report() {
        let report = eyre::Report::new(DbError::EntityDoesNotExist("warren.test".into()));
        let kind = kind_of(&report).unwrap();
        assert_eq!(kind.code(), 11);
        assert!(report.to_string().contains("warren.test"));
    }
}
