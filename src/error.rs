//! Error types shared by every layer of the crate.
//!
//! Database-reported failures are carried as [`DbError`], classified into a
//! [`DbErrorKind`] from their SQLSTATE. Everything the query and record layers
//! detect on their own is a variant of [`QuarryError`].

use std::fmt;

use crate::connection::ConnectionError;
use crate::transaction::TransactionError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, QuarryError>;

/// SQLSTATE raised by PL/pgSQL when a `STRICT` lookup finds nothing.
pub const NO_DATA_FOUND: &str = "P0002";

/// Category of a database-reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbErrorKind {
    /// Constraint violations (class 23)
    Integrity,
    /// Syntax, undefined objects, access rules
    Programming,
    /// Server-side internal failures, PL/pgSQL raises
    Internal,
    /// Connection, resource and operator-intervention failures
    Operational,
    /// Client-side failures talking to the server
    Interface,
    /// Feature not supported (class 0A)
    NotSupported,
    /// Invalid data for the target type (class 22)
    Data,
    /// Anything without a more specific category
    Database,
}

impl DbErrorKind {
    /// Classify a five-character SQLSTATE code.
    pub fn from_sqlstate(code: &str) -> Self {
        let mut chars = code.chars();
        let class = (chars.next(), chars.next());
        match class {
            (Some('0'), Some('A')) => DbErrorKind::NotSupported,
            (Some('0'), Some('8')) => DbErrorKind::Operational,
            (Some('2'), Some('0' | '1' | '6' | '7' | '8')) => DbErrorKind::Programming,
            (Some('2'), Some('2')) => DbErrorKind::Data,
            (Some('2'), Some('3')) => DbErrorKind::Integrity,
            (Some('2'), Some('4' | '5' | 'B' | 'D' | 'F')) => DbErrorKind::Internal,
            (Some('3'), Some('4')) => DbErrorKind::Operational,
            (Some('3'), Some('8' | '9' | 'B')) => DbErrorKind::Internal,
            (Some('3'), Some('D' | 'F')) => DbErrorKind::Programming,
            (Some('4'), Some('0')) => DbErrorKind::Operational,
            (Some('4'), Some('2' | '4')) => DbErrorKind::Programming,
            (Some('5'), _) => DbErrorKind::Operational,
            (Some('F' | 'H'), _) => DbErrorKind::Operational,
            (Some('P' | 'X'), _) => DbErrorKind::Internal,
            _ => DbErrorKind::Database,
        }
    }
}

impl fmt::Display for DbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DbErrorKind::Integrity => "integrity error",
            DbErrorKind::Programming => "programming error",
            DbErrorKind::Internal => "internal error",
            DbErrorKind::Operational => "operational error",
            DbErrorKind::Interface => "interface error",
            DbErrorKind::NotSupported => "not supported",
            DbErrorKind::Data => "data error",
            DbErrorKind::Database => "database error",
        };
        f.write_str(name)
    }
}

/// An error reported by the database or by the driver while talking to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    kind: DbErrorKind,
    code: Option<String>,
    message: String,
    closed: bool,
}

impl DbError {
    /// Create an error of the given kind.
    pub fn new(kind: DbErrorKind, code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            closed: false,
        }
    }

    /// Create an error from a server-reported SQLSTATE.
    pub fn from_sqlstate(code: &str, message: impl Into<String>) -> Self {
        Self::new(
            DbErrorKind::from_sqlstate(code),
            Some(code.to_string()),
            message,
        )
    }

    /// The connection was closed underneath the client.
    pub fn closed(message: impl Into<String>) -> Self {
        Self {
            kind: DbErrorKind::Operational,
            code: None,
            message: message.into(),
            closed: true,
        }
    }

    /// A value could not be converted between the driver and [`crate::Value`].
    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::Interface, None, message)
    }

    pub fn kind(&self) -> DbErrorKind {
        self.kind
    }

    /// The SQLSTATE code, when the server reported one.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the driver reported the connection as already closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the error means the connection is gone and a reconnect may help.
    ///
    /// Covers driver-level "connection closed" reports, the connection
    /// exception class (08) and administrator/crash shutdowns (57P01..57P03).
    pub fn is_stale(&self) -> bool {
        if self.closed {
            return true;
        }
        match self.code.as_deref() {
            Some(code) => code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03"),
            None => false,
        }
    }

    /// Whether the error is the PL/pgSQL no-data-found condition.
    pub fn is_no_data_found(&self) -> bool {
        self.code.as_deref() == Some(NO_DATA_FOUND)
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} [{}]: {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for DbError {}

/// Crate-wide error type.
#[derive(Debug)]
pub enum QuarryError {
    /// Fewer arguments supplied than the descriptor declares
    InsufficientArguments { expected: usize, got: usize },
    /// More arguments supplied than the descriptor declares
    TooManyArguments { expected: usize, got: usize },
    /// A keyword argument that is not in the declared argument list
    UnknownArgument(String),
    /// A keyword argument whose slot was already filled positionally
    AmbiguousArgument(String),
    /// Positional arguments passed to a member bound to a record
    PositionalArgumentsRejected(String),
    /// Invalid descriptor or call combination, detected before execution
    Programming(String),
    /// Keyed load found no row
    NotFound(String),
    /// Single-row call did not get exactly one row
    UnexpectedRowCount { expected: u64, got: u64 },
    /// Typed cursor got a projection that is not one column wide
    ColumnCountMismatch { expected: usize, got: usize },
    /// Column requested from a row that does not carry it
    ColumnNotFound(String),
    /// Name that is neither a column, a member nor an attribute of a record
    UnknownAttribute { model: String, name: String },
    /// `save()` on a model without a save descriptor
    SaveNotSupported(String),
    /// Connecting or reconnecting failed
    Connection(ConnectionError),
    /// Transaction control failed
    Transaction(TransactionError),
    /// Database-reported error, passed through unchanged
    Database(DbError),
    /// A column value could not be converted to the requested type
    Decode(String),
    /// Configuration could not be loaded
    Config(String),
}

impl QuarryError {
    /// Whether this is one of the argument-count errors.
    pub fn is_argument_count(&self) -> bool {
        matches!(
            self,
            QuarryError::InsufficientArguments { .. } | QuarryError::TooManyArguments { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, QuarryError::NotFound(_))
    }

    /// The database error carried by this error, if any.
    pub fn db_error(&self) -> Option<&DbError> {
        match self {
            QuarryError::Database(e) => Some(e),
            QuarryError::Connection(ConnectionError::PostgresError(e)) => Some(e),
            QuarryError::Transaction(TransactionError::PostgresError(e)) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for QuarryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuarryError::InsufficientArguments { expected, got } => {
                write!(f, "Insufficient arguments: expected {expected}, got {got}")
            }
            QuarryError::TooManyArguments { expected, got } => {
                write!(f, "Too many arguments: expected {expected}, got {got}")
            }
            QuarryError::UnknownArgument(name) => {
                write!(f, "Unknown keyword argument passed: {name}")
            }
            QuarryError::AmbiguousArgument(name) => {
                write!(f, "Argument {name} supplied both positionally and by keyword")
            }
            QuarryError::PositionalArgumentsRejected(member) => {
                write!(f, "Member {member} only accepts keyword arguments")
            }
            QuarryError::Programming(msg) => write!(f, "Programming error: {msg}"),
            QuarryError::NotFound(msg) => write!(f, "Record not found: {msg}"),
            QuarryError::UnexpectedRowCount { expected, got } => {
                write!(f, "Expected {expected} row(s), got {got}")
            }
            QuarryError::ColumnCountMismatch { expected, got } => {
                write!(f, "Expected {expected} column(s) in the result, got {got}")
            }
            QuarryError::ColumnNotFound(name) => write!(f, "Column not found: {name}"),
            QuarryError::UnknownAttribute { model, name } => {
                write!(f, "{model} has no column, member or attribute named {name}")
            }
            QuarryError::SaveNotSupported(model) => {
                write!(f, "Cannot save {model} without a save declaration")
            }
            QuarryError::Connection(e) => write!(f, "{e}"),
            QuarryError::Transaction(e) => write!(f, "{e}"),
            QuarryError::Database(e) => write!(f, "{e}"),
            QuarryError::Decode(msg) => write!(f, "Decode error: {msg}"),
            QuarryError::Config(msg) => write!(f, "Configuration error: {msg}"),
        }
    }
}

impl std::error::Error for QuarryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QuarryError::Connection(e) => Some(e),
            QuarryError::Transaction(e) => Some(e),
            QuarryError::Database(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DbError> for QuarryError {
    fn from(err: DbError) -> Self {
        QuarryError::Database(err)
    }
}

impl From<ConnectionError> for QuarryError {
    fn from(err: ConnectionError) -> Self {
        QuarryError::Connection(err)
    }
}

impl From<TransactionError> for QuarryError {
    fn from(err: TransactionError) -> Self {
        QuarryError::Transaction(err)
    }
}

impl From<config::ConfigError> for QuarryError {
    fn from(err: config::ConfigError) -> Self {
        QuarryError::Config(err.to_string())
    }
}
