//! Connection handle.
//!
//! A [`Handle`] owns one database connection and everything that goes with
//! it: the connection string to reconnect with, the transaction mode, and the
//! registry of composite types that result rows are materialized against.
//! Handles are cheap to clone; clones share the connection and its
//! transaction, and statements from all clones are serialized.
//!
//! Two recovery rules apply:
//! - [`Handle::cursor`] never hands out a dead connection. It reconnects when
//!   the connection is known to be closed and probes it with
//!   `SELECT pg_backend_pid()` otherwise, reconnecting once if the probe finds
//!   the connection stale.
//! - A statement that fails because the connection went stale is re-run
//!   exactly once on a fresh connection. Any other error is returned as is.
//!
//! # Examples
//!
//! ```no_run
//! use quarry::{CursorKind, Handle};
//!
//! # fn main() -> quarry::Result<()> {
//! let handle = Handle::connect("host=localhost user=postgres dbname=mydb")?;
//!
//! let mut cursor = handle.cursor(CursorKind::Plain)?;
//! cursor.execute("SELECT id, value FROM test_table WHERE id = $1", vec![1.into()])?;
//! for row in cursor {
//!     println!("{:?}", row);
//! }
//!
//! handle.transaction(|h| {
//!     h.execute("UPDATE test_table SET value = $1 WHERE id = $2", &["uno".into(), 1.into()])?;
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};
use std::time::Instant;

use crate::config::DatabaseConfig;
use crate::connection::{Connection, ConnectionError, Connector, PgConnector, QueryOutput};
use crate::cursor::{Cursor, CursorKind};
use crate::error::{DbError, QuarryError, Result};
use crate::model::composite::{self, CompositeMap};
use crate::model::ModelDef;
use crate::transaction::{TransactionError, TransactionMode, TransactionScope};
use crate::value::Value;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;
#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// Liveness probe issued before a cursor is handed out.
pub const PROBE_SQL: &str = "SELECT pg_backend_pid()";

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    fn next() -> Self {
        HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A shared connection with reconnect and transaction control.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

struct Shared {
    id: HandleId,
    session: Mutex<Session>,
    composites: RwLock<CompositeMap>,
}

struct Session {
    id: HandleId,
    dsn: String,
    connector: Arc<dyn Connector>,
    conn: Option<Box<dyn Connection>>,
    mode: TransactionMode,
    in_transaction: bool,
}

impl Handle {
    /// Connect to `dsn` with the default transaction mode.
    pub fn connect(dsn: &str) -> Result<Self> {
        Self::with_connector(dsn, TransactionMode::default(), PgConnector)
    }

    /// Connect with the parameters and transaction mode of `config`.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        let mode = config.transaction_mode()?;
        Self::with_connector(&config.dsn(), mode, PgConnector)
    }

    /// Connect through a custom [`Connector`].
    pub fn with_connector<C>(dsn: &str, mode: TransactionMode, connector: C) -> Result<Self>
    where
        C: Connector + 'static,
    {
        Self::with_shared_connector(dsn, mode, Arc::new(connector))
    }

    pub fn with_shared_connector(
        dsn: &str,
        mode: TransactionMode,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let id = HandleId::next();
        let conn = connector.connect(dsn)?;
        log::debug!("handle {} connected ({:?})", id, mode);
        Ok(Self {
            shared: Arc::new(Shared {
                id,
                session: Mutex::new(Session {
                    id,
                    dsn: dsn.to_string(),
                    connector,
                    conn: Some(conn),
                    mode,
                    in_transaction: false,
                }),
                composites: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn id(&self) -> HandleId {
        self.shared.id
    }

    pub fn dsn(&self) -> String {
        self.session().dsn.clone()
    }

    pub fn mode(&self) -> TransactionMode {
        self.session().mode
    }

    /// Change the transaction mode. Not allowed while a transaction is open.
    pub fn set_mode(&self, mode: TransactionMode) -> Result<()> {
        let mut session = self.session();
        if session.in_transaction {
            return Err(QuarryError::Programming(
                "cannot change the transaction mode inside a transaction".to_string(),
            ));
        }
        session.mode = mode;
        Ok(())
    }

    /// Whether a transaction opened by this handle is in progress.
    pub fn in_transaction(&self) -> bool {
        self.session().in_transaction
    }

    /// Whether the connection is closed. A closed handle reconnects on its
    /// next statement or cursor.
    pub fn is_closed(&self) -> bool {
        self.session().conn.as_ref().map_or(true, |c| c.is_closed())
    }

    /// Whether `self` and `other` are clones of the same handle.
    pub fn same_handle(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.shared
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// A cursor over a live connection.
    ///
    /// Reconnects first when the connection is closed. Outside a transaction
    /// the connection is probed, and a stale one is replaced once; inside a
    /// transaction a stale connection surfaces on the next statement instead.
    pub fn cursor(&self, kind: CursorKind) -> Result<Cursor> {
        {
            let mut session = self.session();
            if session.in_transaction {
                session.ensure_connected()?;
            } else {
                session.live_pid()?;
            }
        }
        Ok(Cursor::new(self.clone(), kind))
    }

    /// Backend process id of the current connection, reconnecting if needed.
    pub fn backend_pid(&self) -> Result<i32> {
        self.session().live_pid()
    }

    /// Run a statement and return its columns and rows.
    pub(crate) fn run(&self, sql: &str, params: &[Value]) -> Result<QueryOutput> {
        self.with_retry(sql, |conn| conn.query(sql, params))
    }

    /// Run a statement and return the number of affected rows.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.with_retry(sql, |conn| conn.execute(sql, params))
    }

    /// Run parameterless statements separated by semicolons, e.g. fixtures.
    pub fn batch_execute(&self, sql: &str) -> Result<()> {
        self.with_retry(sql, |conn| conn.batch_execute(sql))
    }

    fn with_retry<T>(
        &self,
        sql: &str,
        mut op: impl FnMut(&mut dyn Connection) -> std::result::Result<T, DbError>,
    ) -> Result<T> {
        let mut session = self.session();
        let in_transaction = session.in_transaction;
        match session.attempt(sql, &mut op) {
            Err(QuarryError::Database(err)) if err.is_stale() && in_transaction => {
                // The transaction's earlier statements died with the connection.
                log::warn!(
                    "handle {}: connection lost inside a transaction ({}), not retrying",
                    self.id(),
                    err
                );
                #[cfg(feature = "metrics")]
                METRICS.record_reconnect();
                if let Err(reconnect) = session.reconnect() {
                    log::warn!("handle {}: reconnect failed: {}", self.id(), reconnect);
                }
                Err(QuarryError::Connection(ConnectionError::PostgresError(err)))
            }
            Err(QuarryError::Database(err)) if err.is_stale() => {
                log::warn!(
                    "handle {}: connection went stale ({}), reconnecting and retrying once",
                    self.id(),
                    err
                );
                #[cfg(feature = "metrics")]
                METRICS.record_reconnect();
                session.reconnect()?;
                session.attempt(sql, &mut op).map_err(|e| match e {
                    QuarryError::Database(err) if err.is_stale() => {
                        QuarryError::Connection(ConnectionError::PostgresError(err))
                    }
                    other => other,
                })
            }
            other => other,
        }
    }

    /// Open a transaction.
    ///
    /// In autocommit mode this issues `BEGIN`. In transactional mode it opens
    /// the transaction the next statement would have opened implicitly. A
    /// transaction that is already open is left as is.
    pub fn begin(&self) -> Result<()> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::begin_transaction_span().entered();

        let mut session = self.session();
        if session.in_transaction {
            return Ok(());
        }
        let statement = match session.mode {
            TransactionMode::Autocommit => "BEGIN".to_string(),
            TransactionMode::Transactional(level) => level.begin_statement(),
        };
        session.ensure_connected()?;
        session.control(&statement)?;
        session.in_transaction = true;
        Ok(())
    }

    /// Commit the open transaction.
    ///
    /// Fails with [`TransactionError::HandleClosed`] when the connection is
    /// closed, since whatever was pending is gone.
    pub fn commit(&self) -> Result<()> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::commit_transaction_span().entered();

        let mut session = self.session();
        if session.conn.as_ref().map_or(true, |c| c.is_closed()) {
            return Err(TransactionError::HandleClosed.into());
        }
        if session.mode.is_autocommit() || session.in_transaction {
            session.in_transaction = false;
            session.control("COMMIT")?;
        }
        Ok(())
    }

    /// Roll back the open transaction. A no-op on a closed connection.
    pub fn rollback(&self) -> Result<()> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::rollback_transaction_span().entered();

        let mut session = self.session();
        if session.conn.as_ref().map_or(true, |c| c.is_closed()) {
            session.in_transaction = false;
            return Ok(());
        }
        if session.mode.is_autocommit() || session.in_transaction {
            session.in_transaction = false;
            session.control("ROLLBACK")?;
        }
        Ok(())
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back and returns the error when it
    /// returns `Err`, and rolls back if `f` panics. When a transaction is
    /// already open, `f` joins it and the commit covers the earlier work too.
    ///
    /// ```no_run
    /// # use quarry::Handle;
    /// # fn main() -> quarry::Result<()> {
    /// # let handle = Handle::connect("host=localhost dbname=mydb")?;
    /// let moved = handle.transaction(|h| {
    ///     let n = h.execute("UPDATE accounts SET balance = balance - 10 WHERE id = $1", &[1.into()])?;
    ///     h.execute("UPDATE accounts SET balance = balance + 10 WHERE id = $1", &[2.into()])?;
    ///     Ok(n)
    /// })?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Handle) -> Result<T>,
    {
        self.begin()?;
        let scope = TransactionScope::new(self);
        match f(self) {
            Ok(value) => {
                scope.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = scope.rollback() {
                    log::warn!("handle {}: rollback failed: {}", self.id(), rollback_err);
                }
                Err(err)
            }
        }
    }

    /// Close the connection. Calling it again is a no-op.
    pub fn close(&self) {
        let mut session = self.session();
        session.in_transaction = false;
        if let Some(mut conn) = session.conn.take() {
            conn.close();
            log::debug!("handle {} closed", session.id);
        }
    }

    /// Build records of `model` from every composite value of `type_name`
    /// this handle returns. Unqualified names are taken to be in `public`.
    pub(crate) fn register_composite(&self, type_name: String, model: Arc<ModelDef>) {
        log::debug!(
            "handle {}: composite {} materializes as {}",
            self.id(),
            type_name,
            model.name()
        );
        self.shared
            .composites
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(type_name, model);
    }

    pub(crate) fn unregister_composite(&self, type_name: &str) -> bool {
        self.shared
            .composites
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(type_name)
            .is_some()
    }

    pub(crate) fn composites(&self) -> RwLockReadGuard<'_, CompositeMap> {
        self.shared
            .composites
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Type names with a registered model.
    pub fn registered_composites(&self) -> Vec<String> {
        let mut names: Vec<String> = self.composites().keys().cloned().collect();
        names.sort();
        names
    }

    /// Replace registered composites inside `value` with records, depth-first.
    pub fn materialize(&self, value: Value) -> Value {
        let registry = self.composites();
        composite::materialize(value, &registry, self)
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.same_handle(other)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Open a fresh connection, dropping the old one.
    fn reconnect(&mut self) -> std::result::Result<(), ConnectionError> {
        if let Some(mut old) = self.conn.take() {
            old.close();
        }
        self.in_transaction = false;
        self.conn = Some(self.connector.connect(&self.dsn)?);
        log::debug!("handle {} reconnected", self.id);
        Ok(())
    }

    fn ensure_connected(&mut self) -> std::result::Result<(), ConnectionError> {
        if self.conn.as_ref().map_or(true, |c| c.is_closed()) {
            self.reconnect()?;
        }
        Ok(())
    }

    fn probe(&mut self) -> Result<i32> {
        let conn = self.connection()?;
        let output = conn.query(PROBE_SQL, &[])?;
        output
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(Value::as_i64)
            .and_then(|pid| i32::try_from(pid).ok())
            .ok_or_else(|| QuarryError::Decode("backend pid probe returned no pid".to_string()))
    }

    /// Probe the connection, replacing it once if it turns out to be stale.
    fn live_pid(&mut self) -> Result<i32> {
        self.ensure_connected()?;
        match self.probe() {
            Err(QuarryError::Database(err)) if err.is_stale() => {
                log::warn!("handle {}: stale connection ({}), reconnecting", self.id, err);
                #[cfg(feature = "metrics")]
                METRICS.record_reconnect();
                self.reconnect()?;
                self.probe().map_err(|e| match e {
                    QuarryError::Database(err) if err.is_stale() => {
                        QuarryError::Connection(ConnectionError::PostgresError(err))
                    }
                    other => other,
                })
            }
            other => other,
        }
    }

    fn connection(&mut self) -> Result<&mut Box<dyn Connection>> {
        self.conn
            .as_mut()
            .ok_or_else(|| ConnectionError::Other("handle has no connection".to_string()).into())
    }

    /// Issue a transaction control statement.
    fn control(&mut self, sql: &str) -> Result<()> {
        log::debug!("handle {}: {}", self.id, sql);
        let conn = self.connection()?;
        conn.batch_execute(sql)
            .map_err(|e| TransactionError::PostgresError(e).into())
    }

    /// One execution of `op`, opening the implicit transaction first in
    /// transactional mode.
    fn attempt<T>(
        &mut self,
        sql: &str,
        op: &mut dyn FnMut(&mut dyn Connection) -> std::result::Result<T, DbError>,
    ) -> Result<T> {
        self.ensure_connected()?;
        let begin = match self.mode {
            TransactionMode::Transactional(level)
                if !self.in_transaction && !is_transaction_control(sql) =>
            {
                Some(level.begin_statement())
            }
            _ => None,
        };
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| ConnectionError::Other("handle has no connection".to_string()))?;
        if let Some(begin) = begin {
            log::debug!("handle {}: {}", self.id, begin);
            conn.batch_execute(&begin)?;
            self.in_transaction = true;
        }

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_query_span(sql).entered();

        let start = Instant::now();
        let result = op(&mut **conn);
        let elapsed = start.elapsed();
        match &result {
            Ok(_) => {
                log::debug!("handle {}: {} ({:?})", self.id, sql, elapsed);
                #[cfg(feature = "metrics")]
                METRICS.record_query(elapsed);
            }
            Err(err) => {
                log::debug!("handle {}: {} failed: {}", self.id, sql, err);
                #[cfg(feature = "metrics")]
                METRICS.record_query_error();
            }
        }
        result.map_err(QuarryError::from)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
            log::debug!("handle {} released", self.id);
        }
    }
}

fn is_transaction_control(sql: &str) -> bool {
    let head = sql.trim_start();
    let keyword = head
        .split(|c: char| c.is_whitespace() || c == ';')
        .next()
        .unwrap_or("");
    ["BEGIN", "START", "COMMIT", "END", "ROLLBACK", "ABORT", "SAVEPOINT", "RELEASE"]
        .iter()
        .any(|kw| keyword.eq_ignore_ascii_case(kw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbErrorKind;
    use crate::mock::{self, MockConnector};
    use crate::transaction::IsolationLevel;

    fn handle(driver: &MockConnector, mode: TransactionMode) -> Handle {
        Handle::with_connector("dbname=mock", mode, driver.clone()).unwrap()
    }

    #[test]
    fn test_cursor_probes_backend_pid() {
        let driver = mock::test_database();
        let h = handle(&driver, TransactionMode::Autocommit);
        h.cursor(CursorKind::Plain).unwrap();
        assert_eq!(driver.executed(), vec![PROBE_SQL]);
    }

    #[test]
    fn test_cursor_reconnects_after_close() {
        let driver = mock::test_database();
        let h = handle(&driver, TransactionMode::Autocommit);
        let first = h.backend_pid().unwrap();
        h.close();
        assert!(h.is_closed());
        h.cursor(CursorKind::Plain).unwrap();
        assert!(!h.is_closed());
        assert_eq!(driver.connects(), 2);
        assert_ne!(h.backend_pid().unwrap(), first);
    }

    #[test]
    fn test_cursor_replaces_stale_connection() {
        let driver = mock::test_database();
        let h = handle(&driver, TransactionMode::Autocommit);
        driver.kill_connections();
        h.cursor(CursorKind::Plain).unwrap();
        assert_eq!(driver.connects(), 2);
        assert_eq!(driver.count(PROBE_SQL), 2);
    }

    #[test]
    fn test_cursor_fails_when_reconnect_fails() {
        let driver = mock::test_database();
        let h = handle(&driver, TransactionMode::Autocommit);
        driver.kill_connections();
        driver.refuse_connects(1);
        let err = h.cursor(CursorKind::Plain).unwrap_err();
        assert!(matches!(err, QuarryError::Connection(_)));
    }

    #[test]
    fn test_stale_statement_retried_exactly_once() {
        let driver = mock::test_database();
        let h = handle(&driver, TransactionMode::Autocommit);
        driver.fail_next("FROM test_table", DbError::closed("server closed the connection"));

        let out = h.run("SELECT * FROM test_table", &[]).unwrap();
        assert_eq!(out.rows.len(), 3);
        assert_eq!(driver.count("FROM test_table"), 2);
        assert_eq!(driver.connects(), 2);
    }

    #[test]
    fn test_second_stale_failure_surfaces_as_connection_error() {
        let driver = mock::test_database();
        let h = handle(&driver, TransactionMode::Autocommit);
        driver.fail_next("FROM test_table", DbError::closed("gone"));
        driver.fail_next("FROM test_table", DbError::closed("gone again"));

        let err = h.run("SELECT * FROM test_table", &[]).unwrap_err();
        assert!(matches!(err, QuarryError::Connection(ConnectionError::PostgresError(_))));
        assert_eq!(driver.count("FROM test_table"), 2);
    }

    #[test]
    fn test_stale_statement_inside_transaction_is_not_retried() {
        let driver = mock::test_database();
        let h = handle(&driver, TransactionMode::Autocommit);
        driver.on("UPDATE test_table", |_, _| Ok(QueryOutput::default()));
        h.begin().unwrap();
        h.execute("UPDATE test_table SET value = 'uno' WHERE id = 1", &[]).unwrap();
        driver.kill_connections();

        let err = h.execute("SELECT * FROM test_table", &[]).unwrap_err();
        assert!(matches!(err, QuarryError::Connection(ConnectionError::PostgresError(_))));
        assert_eq!(driver.count("SELECT * FROM test_table"), 1);
        assert!(!h.in_transaction());
        assert_eq!(driver.connects(), 2);

        // The handle stays usable on the new connection.
        assert_eq!(h.execute("SELECT * FROM test_table", &[]).unwrap(), 3);
    }

    #[test]
    fn test_stale_implicit_transaction_is_not_retried() {
        let driver = mock::test_database();
        let h = handle(
            &driver,
            TransactionMode::Transactional(IsolationLevel::ReadCommitted),
        );
        h.run("SELECT * FROM test_table", &[]).unwrap();
        driver.kill_connections();

        let err = h.run("SELECT * FROM test_table", &[]).unwrap_err();
        assert!(matches!(err, QuarryError::Connection(_)));
        assert_eq!(driver.count("SELECT * FROM test_table"), 2);
        assert_eq!(driver.count("BEGIN"), 1);
    }

    #[test]
    fn test_non_stale_errors_are_not_retried() {
        let driver = mock::test_database();
        let h = handle(&driver, TransactionMode::Autocommit);
        driver.fail_next(
            "FROM test_table",
            DbError::from_sqlstate("23505", "duplicate key value"),
        );

        let err = h.run("SELECT * FROM test_table", &[]).unwrap_err();
        let db = err.db_error().unwrap();
        assert_eq!(db.kind(), DbErrorKind::Integrity);
        assert_eq!(driver.count("FROM test_table"), 1);
        assert_eq!(driver.connects(), 1);
    }

    #[test]
    fn test_transactional_mode_begins_implicitly() {
        let driver = mock::test_database();
        let h = handle(
            &driver,
            TransactionMode::Transactional(IsolationLevel::Serializable),
        );
        h.run("SELECT * FROM test_table", &[]).unwrap();
        h.run("SELECT * FROM test_table", &[]).unwrap();
        assert!(h.in_transaction());
        h.commit().unwrap();
        assert!(!h.in_transaction());
        assert_eq!(
            driver.executed(),
            vec![
                "BEGIN ISOLATION LEVEL SERIALIZABLE",
                "SELECT * FROM test_table",
                "SELECT * FROM test_table",
                "COMMIT",
            ]
        );
    }

    #[test]
    fn test_autocommit_mode_issues_explicit_control() {
        let driver = mock::test_database();
        let h = handle(&driver, TransactionMode::Autocommit);
        h.begin().unwrap();
        h.run("SELECT * FROM test_table", &[]).unwrap();
        h.rollback().unwrap();
        assert_eq!(
            driver.executed(),
            vec!["BEGIN", "SELECT * FROM test_table", "ROLLBACK"]
        );
    }

    #[test]
    fn test_transaction_commits_on_ok() {
        let driver = mock::test_database();
        let h = handle(&driver, TransactionMode::default());
        let n = h
            .transaction(|h| h.execute("SELECT * FROM test_table", &[]))
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(driver.count("COMMIT"), 1);
        assert_eq!(driver.count("ROLLBACK"), 0);
    }

    #[test]
    fn test_transaction_rolls_back_on_err() {
        let driver = mock::test_database();
        let h = handle(&driver, TransactionMode::default());
        let result: Result<()> = h.transaction(|h| {
            h.execute("SELECT * FROM test_table", &[])?;
            Err(QuarryError::Programming("abort".to_string()))
        });
        assert!(matches!(result, Err(QuarryError::Programming(_))));
        assert_eq!(driver.count("COMMIT"), 0);
        assert_eq!(driver.count("ROLLBACK"), 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_panic() {
        let driver = mock::test_database();
        let h = handle(&driver, TransactionMode::default());
        let inner = h.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<()> = inner.transaction(|_| panic!("boom"));
        }));
        assert!(result.is_err());
        assert_eq!(driver.count("ROLLBACK"), 1);
        assert_eq!(driver.count("COMMIT"), 0);
        assert!(!h.in_transaction());
    }

    #[test]
    fn test_commit_on_closed_handle_fails() {
        let driver = mock::test_database();
        let h = handle(&driver, TransactionMode::default());
        h.close();
        assert!(matches!(
            h.commit(),
            Err(QuarryError::Transaction(TransactionError::HandleClosed))
        ));
        assert!(h.rollback().is_ok());
    }

    #[test]
    fn test_close_is_idempotent() {
        let driver = mock::test_database();
        let h = handle(&driver, TransactionMode::default());
        h.close();
        h.close();
        assert!(h.is_closed());
    }

    #[test]
    fn test_set_mode_inside_transaction_rejected() {
        let driver = mock::test_database();
        let h = handle(&driver, TransactionMode::default());
        h.begin().unwrap();
        assert!(h.set_mode(TransactionMode::Autocommit).is_err());
        h.rollback().unwrap();
        h.set_mode(TransactionMode::Autocommit).unwrap();
        assert_eq!(h.mode(), TransactionMode::Autocommit);
    }

    #[test]
    fn test_clones_share_connection() {
        let driver = mock::test_database();
        let h = handle(&driver, TransactionMode::default());
        let other = h.clone();
        assert_eq!(h, other);
        assert_eq!(h.backend_pid().unwrap(), other.backend_pid().unwrap());
        assert_eq!(driver.connects(), 1);
    }

    #[test]
    fn test_is_transaction_control() {
        assert!(is_transaction_control("BEGIN"));
        assert!(is_transaction_control("  commit;"));
        assert!(is_transaction_control("START TRANSACTION"));
        assert!(!is_transaction_control("SELECT 1"));
        assert!(!is_transaction_control("BEGINNING"));
    }
}
