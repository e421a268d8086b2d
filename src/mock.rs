//! Scripted in-memory driver.
//!
//! [`MockConnector`] hands out [`MockConnection`]s that answer statements from
//! a list of responders matched by SQL substring, so the handle, descriptor
//! and record layers can be exercised without a server. Every statement is
//! logged, and failures (stale connections, SQLSTATE errors, refused
//! connects) can be injected.
//!
//! ```ignore
//! // Needs the `mock` feature.
//! use quarry::mock::MockConnector;
//! use quarry::{Descriptor, Handle, Value, args};
//!
//! let driver = MockConnector::new();
//! driver.on_rows("FROM test_table", ["id", "value"], vec![
//!     vec![Value::Int(1), Value::from("one")],
//! ]);
//! let handle = Handle::with_connector("dbname=mock", Default::default(), driver.clone())?;
//!
//! let get = Descriptor::query("test_table", &["id"]).single();
//! let item = get.fetch_one(args![1].handle(handle))?;
//! let row = item.as_row().expect("plain query yields rows");
//! assert_eq!(row.get("value"), Some(&Value::from("one")));
//! assert!(driver.executed().iter().any(|sql| sql == "SELECT * FROM test_table WHERE id=$1"));
//! # Ok::<(), quarry::QuarryError>(())
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::connection::{Connection, ConnectionError, Connector, QueryOutput};
use crate::error::DbError;
use crate::value::Value;

const FIRST_PID: i32 = 4242;

type Responder = Arc<dyn Fn(&str, &[Value]) -> Result<QueryOutput, DbError> + Send + Sync>;

struct Route {
    pattern: String,
    respond: Responder,
}

struct Failure {
    pattern: String,
    error: DbError,
}

/// A statement seen by a mock connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Executed {
    pub sql: String,
    pub params: Vec<Value>,
    pub pid: i32,
}

#[derive(Default)]
struct MockState {
    routes: Vec<Route>,
    failures: Vec<Failure>,
    log: Vec<Executed>,
    connects: usize,
    refuse_connects: usize,
    next_pid: i32,
    /// Connections opened before this generation were dropped by the server.
    kill_generation: u64,
    generation: u64,
}

/// Connector producing scripted connections. Clones share one script and log.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer statements containing `pattern` with a computed result.
    ///
    /// Responders registered later are tried first.
    pub fn on<F>(&self, pattern: &str, respond: F)
    where
        F: Fn(&str, &[Value]) -> Result<QueryOutput, DbError> + Send + Sync + 'static,
    {
        self.state().routes.push(Route {
            pattern: pattern.to_string(),
            respond: Arc::new(respond),
        });
    }

    /// Answer statements containing `pattern` with fixed rows.
    pub fn on_rows<const N: usize>(&self, pattern: &str, columns: [&str; N], rows: Vec<Vec<Value>>) {
        let output = QueryOutput {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        };
        self.on(pattern, move |_, _| Ok(output.clone()));
    }

    /// Answer statements containing `pattern` with an error.
    pub fn on_error(&self, pattern: &str, error: DbError) {
        self.on(pattern, move |_, _| Err(error.clone()));
    }

    /// Fail the next statement containing `pattern` once with `error`.
    ///
    /// A [`DbError::closed`] error also marks the connection closed.
    pub fn fail_next(&self, pattern: &str, error: DbError) {
        self.state().failures.push(Failure {
            pattern: pattern.to_string(),
            error,
        });
    }

    /// Simulate the server dropping every open connection without telling
    /// the client. The next statement on each of them fails as closed.
    pub fn kill_connections(&self) {
        let mut state = self.state();
        state.generation += 1;
        state.kill_generation = state.generation;
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_connects(&self, n: usize) {
        self.state().refuse_connects = n;
    }

    /// Number of successful connects so far.
    pub fn connects(&self) -> usize {
        self.state().connects
    }

    /// SQL of every statement seen, in order.
    pub fn executed(&self) -> Vec<String> {
        self.state().log.iter().map(|e| e.sql.clone()).collect()
    }

    pub fn executed_with_params(&self) -> Vec<Executed> {
        self.state().log.clone()
    }

    /// How many logged statements contain `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.state()
            .log
            .iter()
            .filter(|e| e.sql.contains(pattern))
            .count()
    }

    pub fn clear_log(&self) {
        self.state().log.clear();
    }
}

impl Connector for MockConnector {
    fn connect(&self, dsn: &str) -> Result<Box<dyn Connection>, ConnectionError> {
        crate::connection::validate_connection_string(dsn)?;
        let mut state = self.state();
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(ConnectionError::PostgresError(DbError::from_sqlstate(
                "08001",
                "could not connect to server: Connection refused",
            )));
        }
        state.connects += 1;
        if state.next_pid == 0 {
            state.next_pid = FIRST_PID;
        }
        let pid = state.next_pid;
        state.next_pid += 1;
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
            pid,
            generation: state.generation,
            closed: false,
        }))
    }
}

/// One scripted session.
pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
    pid: i32,
    generation: u64,
    closed: bool,
}

impl MockConnection {
    fn run(&mut self, sql: &str, params: &[Value]) -> Result<QueryOutput, DbError> {
        if self.closed {
            return Err(DbError::closed("connection already closed"));
        }
        let responder = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.log.push(Executed {
                sql: sql.to_string(),
                params: params.to_vec(),
                pid: self.pid,
            });
            if self.generation < state.kill_generation {
                drop(state);
                self.closed = true;
                return Err(DbError::closed(
                    "server closed the connection unexpectedly",
                ));
            }
            if let Some(i) = state.failures.iter().position(|f| sql.contains(&f.pattern)) {
                let failure = state.failures.remove(i);
                drop(state);
                if failure.error.is_closed() {
                    self.closed = true;
                }
                return Err(failure.error);
            }
            state
                .routes
                .iter()
                .rev()
                .find(|r| sql.contains(&r.pattern))
                .map(|r| Arc::clone(&r.respond))
        };
        if let Some(respond) = responder {
            return respond(sql, params);
        }
        builtin(sql, self.pid)
    }
}

/// Answers for statements every test would otherwise have to script.
fn builtin(sql: &str, pid: i32) -> Result<QueryOutput, DbError> {
    let upper = sql.trim().to_ascii_uppercase();
    if upper == "SELECT PG_BACKEND_PID()" {
        return Ok(QueryOutput {
            columns: vec!["pg_backend_pid".to_string()],
            rows: vec![vec![Value::Int(pid.into())]],
        });
    }
    let control = ["BEGIN", "COMMIT", "ROLLBACK", "SET ", "SAVEPOINT", "RELEASE"];
    if control.iter().any(|kw| upper.starts_with(kw)) {
        return Ok(QueryOutput::default());
    }
    Err(DbError::from_sqlstate(
        "42883",
        format!("no mock response for statement: {}", sql),
    ))
}

impl Connection for MockConnection {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryOutput, DbError> {
        self.run(sql, params)
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        self.run(sql, params).map(|out| out.rows.len() as u64)
    }

    fn batch_execute(&mut self, sql: &str) -> Result<(), DbError> {
        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            self.run(statement, &[])?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// `test_table(id, value)` with rows `1 one`, `2 two`, `3 three`, plus the
/// functions the crate's own tests call against it.
#[cfg(test)]
pub(crate) fn test_database() -> MockConnector {
    let driver = MockConnector::new();
    let table = vec![
        vec![Value::Int(1), Value::from("one")],
        vec![Value::Int(2), Value::from("two")],
        vec![Value::Int(3), Value::from("three")],
    ];

    let rows = table.clone();
    driver.on("FROM test_table", move |sql, params| {
        let selected = rows
            .iter()
            .filter(|row| params.is_empty() || row[0] == params[0])
            .cloned()
            .collect();
        if sql.contains("row(t.*)::test_table") {
            let composites = rows_as_composites(selected);
            return Ok(QueryOutput {
                columns: vec!["row".to_string()],
                rows: composites,
            });
        }
        Ok(QueryOutput {
            columns: vec!["id".to_string(), "value".to_string()],
            rows: selected,
        })
    });
    driver.on_rows("FROM test()", ["id", "value"], table.clone());

    let rows = table;
    driver.on("FROM test_get(", move |_, params| {
        Ok(QueryOutput {
            columns: vec!["id".to_string(), "value".to_string()],
            rows: rows
                .iter()
                .filter(|row| params.first() == Some(&row[0]))
                .cloned()
                .collect(),
        })
    });
    driver.on("update_row(", |_, _| {
        Ok(QueryOutput {
            columns: vec!["update_row".to_string()],
            rows: vec![vec![Value::Bool(true)]],
        })
    });
    driver.on_rows("SELECT test_constant()", ["test_constant"], vec![vec![Value::Int(1)]]);
    driver
}

#[cfg(test)]
fn rows_as_composites(rows: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
    use crate::value::Composite;

    rows.into_iter()
        .map(|row| {
            let mut row = row.into_iter();
            let id = row.next().unwrap_or(Value::Null);
            let value = row.next().unwrap_or(Value::Null);
            vec![Value::Composite(Composite::new(
                "public.test_table",
                vec![("id".to_string(), id), ("value".to_string(), value)],
            ))]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_descriptor_call() {
        use crate::{args, Descriptor, Handle};

        let driver = MockConnector::new();
        driver.on_rows(
            "FROM test_table",
            ["id", "value"],
            vec![vec![Value::Int(1), Value::from("one")]],
        );
        let handle = Handle::with_connector("dbname=mock", Default::default(), driver.clone()).unwrap();

        let get = Descriptor::query("test_table", &["id"]).single();
        let item = get.fetch_one(args![1].handle(handle)).unwrap();
        let row = item.as_row().unwrap();
        assert_eq!(row.get("value"), Some(&Value::from("one")));
        assert!(driver
            .executed()
            .iter()
            .any(|sql| sql == "SELECT * FROM test_table WHERE id=$1"));
    }

    #[test]
    fn test_routes_latest_registration_wins() {
        let driver = MockConnector::new();
        driver.on_rows("FROM t", ["a"], vec![vec![Value::Int(1)]]);
        driver.on_rows("FROM t", ["a"], vec![vec![Value::Int(2)]]);
        let mut conn = driver.connect("dbname=mock").unwrap();
        let out = conn.query("SELECT * FROM t", &[]).unwrap();
        assert_eq!(out.rows, vec![vec![Value::Int(2)]]);
    }

    #[test]
    fn test_builtin_probe_and_control() {
        let driver = MockConnector::new();
        let mut conn = driver.connect("dbname=mock").unwrap();
        let out = conn.query("SELECT pg_backend_pid()", &[]).unwrap();
        assert_eq!(out.rows[0][0], Value::Int(FIRST_PID.into()));
        conn.batch_execute("BEGIN; COMMIT").unwrap();
        assert_eq!(driver.executed(), vec!["SELECT pg_backend_pid()", "BEGIN", "COMMIT"]);
        assert!(conn.query("SELECT nothing", &[]).is_err());
    }

    #[test]
    fn test_fail_next_is_one_shot() {
        let driver = MockConnector::new();
        driver.on_rows("FROM t", ["a"], vec![vec![Value::Int(1)]]);
        driver.fail_next("FROM t", DbError::from_sqlstate("40001", "serialization failure"));
        let mut conn = driver.connect("dbname=mock").unwrap();
        assert!(conn.query("SELECT * FROM t", &[]).is_err());
        assert!(conn.query("SELECT * FROM t", &[]).is_ok());
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_killed_connection_fails_once_used() {
        let driver = MockConnector::new();
        let mut old = driver.connect("dbname=mock").unwrap();
        driver.kill_connections();
        assert!(!old.is_closed());
        let err = old.query("SELECT pg_backend_pid()", &[]).unwrap_err();
        assert!(err.is_stale());
        assert!(old.is_closed());

        let mut fresh = driver.connect("dbname=mock").unwrap();
        assert!(fresh.query("SELECT pg_backend_pid()", &[]).is_ok());
        assert_eq!(driver.connects(), 2);
    }

    #[test]
    fn test_refused_connects() {
        let driver = MockConnector::new();
        driver.refuse_connects(1);
        assert!(driver.connect("dbname=mock").is_err());
        assert!(driver.connect("dbname=mock").is_ok());
        assert_eq!(driver.connects(), 1);
    }
}
