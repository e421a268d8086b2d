//! Buffered result sets.
//!
//! A [`Cursor`] runs one statement at a time through its handle and buffers
//! the whole result. Two kinds exist:
//! - [`CursorKind::Plain`] yields each row as a [`Row`].
//! - [`CursorKind::Typed`] requires a one-column projection and yields that
//!   column's value per row, which is how `SELECT row(t.*)::type` queries
//!   become records.
//!
//! Composite values are materialized against the handle's registered models
//! when the statement completes; the row callback runs as each item is
//! fetched.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::error::{QuarryError, Result};
use crate::handle::Handle;
use crate::model::composite;
use crate::model::Record;
use crate::row::Row;
use crate::value::Value;

/// Shape of the items a cursor yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CursorKind {
    #[default]
    Plain,
    Typed,
}

/// Per-row transform applied before an item is handed to the caller.
pub type RowCallback = Arc<dyn Fn(Item) -> Item + Send + Sync>;

/// One fetched result: a full row, or the single value of a typed cursor.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Row(Row),
    Value(Value),
}

impl Item {
    pub fn as_row(&self) -> Option<&Row> {
        match self {
            Item::Row(row) => Some(row),
            Item::Value(_) => None,
        }
    }

    pub fn into_row(self) -> Option<Row> {
        match self {
            Item::Row(row) => Some(row),
            Item::Value(_) => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Item::Value(value) => Some(value),
            Item::Row(_) => None,
        }
    }

    /// The value of a typed item, or the first column of a row.
    pub fn into_value(self) -> Value {
        match self {
            Item::Value(value) => value,
            Item::Row(row) => row.into_values().into_iter().next().unwrap_or(Value::Null),
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        self.as_value().and_then(Value::as_record)
    }

    pub fn as_record_mut(&mut self) -> Option<&mut Record> {
        match self {
            Item::Value(value) => value.as_record_mut(),
            Item::Row(_) => None,
        }
    }

    pub fn into_record(self) -> Option<Record> {
        match self {
            Item::Value(value) => value.into_record(),
            Item::Row(_) => None,
        }
    }

    /// Named field of the item: a row column, a record column or a composite
    /// attribute. Records are read as they are; no lazy load is triggered.
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self {
            Item::Row(row) => row.get(name),
            Item::Value(Value::Record(record)) => record.peek(name),
            Item::Value(Value::Composite(composite)) => composite.get(name),
            Item::Value(_) => None,
        }
    }

    /// `(name, value)` pairs of a row, record or composite; empty for scalars.
    pub fn into_pairs(self) -> Vec<(String, Value)> {
        match self {
            Item::Row(row) => row.into_pairs(),
            Item::Value(value) => composite::value_pairs(value),
        }
    }
}

/// A buffered result set bound to a handle.
pub struct Cursor {
    handle: Handle,
    kind: CursorKind,
    callback: Option<RowCallback>,
    statement: Option<String>,
    params: Vec<Value>,
    columns: Arc<[String]>,
    items: VecDeque<Item>,
    rowcount: Option<u64>,
}

impl Cursor {
    /// Cursors are normally obtained from [`Handle::cursor`], which checks the
    /// connection first.
    pub(crate) fn new(handle: Handle, kind: CursorKind) -> Self {
        Self {
            handle,
            kind,
            callback: None,
            statement: None,
            params: Vec::new(),
            columns: Arc::from(Vec::new()),
            items: VecDeque::new(),
            rowcount: None,
        }
    }

    /// Set the per-row callback.
    pub fn with_callback(mut self, callback: Option<RowCallback>) -> Self {
        self.callback = callback;
        self
    }

    pub fn set_callback(&mut self, callback: Option<RowCallback>) {
        self.callback = callback;
    }

    pub fn kind(&self) -> CursorKind {
        self.kind
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Text of the last executed statement.
    pub fn statement(&self) -> Option<&str> {
        self.statement.as_deref()
    }

    /// Parameters of the last executed statement.
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Column names of the last result.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of rows the last statement produced; `None` before the first.
    pub fn rowcount(&self) -> Option<u64> {
        self.rowcount
    }

    /// Rows not fetched yet.
    pub fn remaining(&self) -> usize {
        self.items.len()
    }

    /// Execute `sql` with `params`, replacing any previous result.
    ///
    /// A typed cursor fails with [`QuarryError::ColumnCountMismatch`] unless
    /// the statement projects exactly one column; no row is read in that case.
    pub fn execute(&mut self, sql: &str, params: Vec<Value>) -> Result<()> {
        self.items.clear();
        self.rowcount = None;
        let output = self.handle.run(sql, &params)?;
        self.statement = Some(sql.to_string());
        self.params = params;

        if self.kind == CursorKind::Typed && output.columns.len() != 1 {
            return Err(QuarryError::ColumnCountMismatch {
                expected: 1,
                got: output.columns.len(),
            });
        }

        self.columns = Arc::from(output.columns);
        self.rowcount = Some(output.rows.len() as u64);
        let registry = self.handle.composites();
        for values in output.rows {
            let mut values: Vec<Value> = values
                .into_iter()
                .map(|v| composite::materialize(v, &registry, &self.handle))
                .collect();
            let item = match self.kind {
                CursorKind::Typed => Item::Value(values.pop().unwrap_or(Value::Null)),
                CursorKind::Plain => Item::Row(Row::new(Arc::clone(&self.columns), values)),
            };
            self.items.push_back(item);
        }
        Ok(())
    }

    fn deliver(&self, item: Item) -> Item {
        match &self.callback {
            Some(callback) => callback(item),
            None => item,
        }
    }

    /// Next item, or `None` once the result is exhausted.
    pub fn fetchone(&mut self) -> Option<Item> {
        let item = self.items.pop_front()?;
        Some(self.deliver(item))
    }

    /// Up to `n` further items.
    pub fn fetchmany(&mut self, n: usize) -> Vec<Item> {
        let n = n.min(self.items.len());
        let items: Vec<Item> = self.items.drain(..n).collect();
        items.into_iter().map(|item| self.deliver(item)).collect()
    }

    /// All remaining items.
    pub fn fetchall(&mut self) -> Vec<Item> {
        let n = self.items.len();
        self.fetchmany(n)
    }

    /// Commit through the cursor's handle.
    pub fn commit(&self) -> Result<()> {
        self.handle.commit()
    }

    /// Roll back through the cursor's handle.
    pub fn rollback(&self) -> Result<()> {
        self.handle.rollback()
    }
}

impl Iterator for Cursor {
    type Item = Item;

    fn next(&mut self) -> Option<Item> {
        self.fetchone()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.items.len(), Some(self.items.len()))
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("statement", &self.statement)
            .field("rowcount", &self.rowcount)
            .field("remaining", &self.items.len())
            .finish()
    }
}
