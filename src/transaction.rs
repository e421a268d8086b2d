//! Transaction Module
//!
//! Transaction modes and isolation levels for a [`Handle`], plus the scope
//! guard behind [`Handle::transaction`].
//!
//! A handle runs in one of two modes:
//! - [`TransactionMode::Autocommit`]: every statement commits on its own;
//!   `begin`/`commit`/`rollback` issue explicit `BEGIN`/`COMMIT`/`ROLLBACK`.
//! - [`TransactionMode::Transactional`]: the handle opens a transaction with
//!   the configured isolation level before the first statement, and
//!   `commit`/`rollback` end it.

use std::fmt;
use std::str::FromStr;

use crate::error::DbError;
use crate::handle::Handle;

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsolationLevel {
    /// Read uncommitted (PostgreSQL treats it as ReadCommitted)
    ReadUncommitted,
    /// Read committed (default)
    #[default]
    ReadCommitted,
    /// Repeatable read
    RepeatableRead,
    /// Serializable
    Serializable,
}

impl IsolationLevel {
    /// Convert to PostgreSQL SQL syntax
    pub fn to_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// The statement that opens a transaction at this level.
    pub fn begin_statement(&self) -> String {
        match self {
            IsolationLevel::ReadCommitted => "BEGIN".to_string(),
            other => format!("BEGIN ISOLATION LEVEL {}", other.to_sql()),
        }
    }
}

/// How a handle delimits transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionMode {
    Autocommit,
    Transactional(IsolationLevel),
}

impl TransactionMode {
    /// Map the numeric levels used in configuration files: `0` autocommit,
    /// `1` read committed, `2` serializable, `3` repeatable read.
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(TransactionMode::Autocommit),
            1 => Some(TransactionMode::Transactional(IsolationLevel::ReadCommitted)),
            2 => Some(TransactionMode::Transactional(IsolationLevel::Serializable)),
            3 => Some(TransactionMode::Transactional(IsolationLevel::RepeatableRead)),
            _ => None,
        }
    }

    pub fn is_autocommit(&self) -> bool {
        matches!(self, TransactionMode::Autocommit)
    }
}

impl Default for TransactionMode {
    fn default() -> Self {
        TransactionMode::Transactional(IsolationLevel::default())
    }
}

impl FromStr for TransactionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        match normalized.as_str() {
            "autocommit" => Ok(TransactionMode::Autocommit),
            "read uncommitted" => Ok(TransactionMode::Transactional(
                IsolationLevel::ReadUncommitted,
            )),
            "read committed" => Ok(TransactionMode::Transactional(IsolationLevel::ReadCommitted)),
            "repeatable read" => Ok(TransactionMode::Transactional(
                IsolationLevel::RepeatableRead,
            )),
            "serializable" => Ok(TransactionMode::Transactional(IsolationLevel::Serializable)),
            other => other
                .parse::<u8>()
                .ok()
                .and_then(TransactionMode::from_level)
                .ok_or_else(|| format!("unknown isolation level {:?}", s)),
        }
    }
}

/// Transaction error type
#[derive(Debug)]
pub enum TransactionError {
    /// PostgreSQL error while issuing transaction control
    PostgresError(DbError),
    /// Commit requested on a handle whose connection is closed
    HandleClosed,
    /// Other transaction errors
    Other(String),
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionError::PostgresError(e) => {
                write!(f, "PostgreSQL error: {}", e)
            }
            TransactionError::HandleClosed => {
                write!(f, "Attempting to commit on a closed handle")
            }
            TransactionError::Other(s) => {
                write!(f, "Transaction error: {}", s)
            }
        }
    }
}

impl std::error::Error for TransactionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransactionError::PostgresError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DbError> for TransactionError {
    fn from(err: DbError) -> Self {
        TransactionError::PostgresError(err)
    }
}

/// Rolls the handle back when dropped unless [`TransactionScope::commit`] or
/// [`TransactionScope::rollback`] ran first.
///
/// Used by [`Handle::transaction`] so a panic inside the closure still ends
/// the transaction.
pub(crate) struct TransactionScope<'h> {
    handle: &'h Handle,
    finished: bool,
}

impl<'h> TransactionScope<'h> {
    pub(crate) fn new(handle: &'h Handle) -> Self {
        Self {
            handle,
            finished: false,
        }
    }

    pub(crate) fn commit(mut self) -> crate::Result<()> {
        self.finished = true;
        self.handle.commit()
    }

    pub(crate) fn rollback(mut self) -> crate::Result<()> {
        self.finished = true;
        self.handle.rollback()
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        log::warn!(
            "handle {}: transaction scope dropped without commit, rolling back",
            self.handle.id()
        );
        if let Err(e) = self.handle.rollback() {
            log::warn!("handle {}: rollback failed: {}", self.handle.id(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_sql() {
        assert_eq!(IsolationLevel::ReadCommitted.to_sql(), "READ COMMITTED");
        assert_eq!(IsolationLevel::RepeatableRead.to_sql(), "REPEATABLE READ");
        assert_eq!(IsolationLevel::Serializable.to_sql(), "SERIALIZABLE");
        assert_eq!(IsolationLevel::ReadUncommitted.to_sql(), "READ UNCOMMITTED");
    }

    #[test]
    fn test_begin_statement() {
        assert_eq!(IsolationLevel::ReadCommitted.begin_statement(), "BEGIN");
        assert_eq!(
            IsolationLevel::Serializable.begin_statement(),
            "BEGIN ISOLATION LEVEL SERIALIZABLE"
        );
    }

    #[test]
    fn test_transaction_mode_parsing() {
        assert_eq!(
            "autocommit".parse::<TransactionMode>().unwrap(),
            TransactionMode::Autocommit
        );
        assert_eq!(
            "REPEATABLE_READ".parse::<TransactionMode>().unwrap(),
            TransactionMode::Transactional(IsolationLevel::RepeatableRead)
        );
        assert_eq!(
            "2".parse::<TransactionMode>().unwrap(),
            TransactionMode::Transactional(IsolationLevel::Serializable)
        );
        assert!("sometimes".parse::<TransactionMode>().is_err());
        assert!("9".parse::<TransactionMode>().is_err());
    }

    #[test]
    fn test_transaction_mode_default() {
        let mode = TransactionMode::default();
        assert_eq!(
            mode,
            TransactionMode::Transactional(IsolationLevel::ReadCommitted)
        );
        assert!(!mode.is_autocommit());
        assert!(TransactionMode::Autocommit.is_autocommit());
    }

    #[test]
    fn test_transaction_error_display() {
        let err = TransactionError::HandleClosed;
        assert!(err.to_string().contains("closed handle"));

        let err = TransactionError::Other("test error".to_string());
        assert!(err.to_string().contains("Transaction error"));

        let err = TransactionError::from(DbError::from_sqlstate("25P02", "aborted"));
        assert!(err.to_string().contains("aborted"));
    }
}
