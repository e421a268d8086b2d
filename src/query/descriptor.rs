//! Query descriptors.
//!
//! A [`Descriptor`] is a reusable, named piece of SQL: a raw statement, a
//! select from a table or view, or a call of a set-returning function. It
//! declares the names of its arguments once; each call positions the supplied
//! arguments against that list, builds the statement, picks a handle and runs
//! it through a cursor.
//!
//! | constructor                 | statement                                     |
//! |-----------------------------|-----------------------------------------------|
//! | `Descriptor::raw(sql, ..)`  | `sql` as written (`%s` markers become `$n`)   |
//! | `Descriptor::query(t, ..)`  | `SELECT * FROM t WHERE a=$1 AND b=$2`         |
//! | `Descriptor::function(f, ..)` | `SELECT * FROM f($1,$2)`                    |
//!
//! Modifiers pick the result shape: [`Descriptor::single`] returns the one
//! row instead of a cursor, [`Descriptor::typed`] yields the single projected
//! value of each row (whole-row casts for queries, direct calls for
//! functions), and [`Descriptor::direct`] calls a function as `SELECT f(..)`.
//!
//! # Examples
//!
//! ```no_run
//! use quarry::{args, Descriptor, Handle};
//!
//! # fn main() -> quarry::Result<()> {
//! let handle = Handle::connect("host=localhost dbname=mydb")?;
//!
//! let by_id = Descriptor::query("test_table", &["id"]).single();
//! let row = by_id.call(args![id = 1].handle(handle.clone()))?.into_item()?;
//! println!("{:?}", row.get("value"));
//!
//! let update = Descriptor::function("update_row", &["id", "new_value"]).direct().single();
//! update.call(args![1, "uno"].handle(handle.clone()))?;
//! handle.commit()?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config;
use crate::cursor::{Cursor, CursorKind, Item, RowCallback};
use crate::error::{QuarryError, Result};
use crate::handle::Handle;
use crate::model::{Lookup, Record};
use crate::query::args::{position, Args, Options};
use crate::query::sql;
use crate::value::Value;

/// What the descriptor's base text names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// Complete SQL text
    Raw,
    /// Table or view
    Table,
    /// Set-returning function
    Function,
}

/// How many rows a call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Reduction {
    #[default]
    All,
    /// Exactly one row, returned directly
    Single,
}

/// Result of [`Descriptor::call`].
#[derive(Debug)]
pub enum Output {
    Cursor(Cursor),
    Item(Item),
}

impl Output {
    pub fn is_cursor(&self) -> bool {
        matches!(self, Output::Cursor(_))
    }

    pub fn into_cursor(self) -> Result<Cursor> {
        match self {
            Output::Cursor(cursor) => Ok(cursor),
            Output::Item(_) => Err(QuarryError::Programming(
                "single-row call returns an item, not a cursor".to_string(),
            )),
        }
    }

    pub fn into_item(self) -> Result<Item> {
        match self {
            Output::Item(item) => Ok(item),
            Output::Cursor(_) => Err(QuarryError::Programming(
                "multi-row call returns a cursor, not an item".to_string(),
            )),
        }
    }

    /// The single item's value (see [`Item::into_value`]).
    pub fn into_value(self) -> Result<Value> {
        self.into_item().map(Item::into_value)
    }

    pub fn into_record(self) -> Result<Record> {
        match self.into_item()? {
            Item::Value(value) => Record::try_from(value),
            Item::Row(_) => Err(QuarryError::Decode(
                "row is not a record; use a typed descriptor".to_string(),
            )),
        }
    }

    /// The item, or the first row of the cursor.
    pub fn first(self) -> Option<Item> {
        match self {
            Output::Item(item) => Some(item),
            Output::Cursor(mut cursor) => cursor.fetchone(),
        }
    }
}

/// A declared query.
#[derive(Clone)]
pub struct Descriptor {
    kind: QueryKind,
    base: String,
    args: Arc<[String]>,
    reduction: Reduction,
    cursor: CursorKind,
    direct: bool,
    property: bool,
    callback: Option<RowCallback>,
    handle: Arc<Mutex<Option<Handle>>>,
}

impl Descriptor {
    fn new(kind: QueryKind, base: impl Into<String>, args: &[&str]) -> Self {
        Self {
            kind,
            base: base.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            reduction: Reduction::All,
            cursor: CursorKind::Plain,
            direct: false,
            property: false,
            callback: None,
            handle: Arc::new(Mutex::new(None)),
        }
    }

    /// A complete statement. `%s` markers outside literals are rewritten to
    /// `$1..$n`; native `$n` placeholders are used as written. The `columns`
    /// option does not apply.
    pub fn raw(sql: impl Into<String>, args: &[&str]) -> Self {
        Self::new(QueryKind::Raw, sql, args)
    }

    /// A select from `table`, with one equality condition per argument.
    pub fn query(table: impl Into<String>, args: &[&str]) -> Self {
        Self::new(QueryKind::Table, table, args)
    }

    /// A call of `function`.
    pub fn function(function: impl Into<String>, args: &[&str]) -> Self {
        Self::new(QueryKind::Function, function, args)
    }

    /// A typed single-row function call, evaluated when a record attribute of
    /// the same name is read.
    pub fn property(function: impl Into<String>, args: &[&str]) -> Self {
        Self::function(function, args).typed().single().as_property()
    }

    pub fn single(mut self) -> Self {
        self.reduction = Reduction::Single;
        self
    }

    pub fn typed(mut self) -> Self {
        self.cursor = CursorKind::Typed;
        self
    }

    pub fn direct(mut self) -> Self {
        self.direct = true;
        self
    }

    pub fn as_property(mut self) -> Self {
        self.property = true;
        self
    }

    /// Default row callback; a `callback` option on a call replaces it.
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(Item) -> Item + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Bind a handle used by every call without a `handle` option.
    pub fn with_handle(self, handle: Handle) -> Self {
        self.bind_handle(handle);
        self
    }

    pub fn bind_handle(&self, handle: Handle) {
        *self.handle_slot() = Some(handle);
    }

    pub fn bound_handle(&self) -> Option<Handle> {
        self.handle_slot().clone()
    }

    fn handle_slot(&self) -> MutexGuard<'_, Option<Handle>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn declared_args(&self) -> &[String] {
        &self.args
    }

    pub fn reduction(&self) -> Reduction {
        self.reduction
    }

    pub fn cursor_kind(&self) -> CursorKind {
        self.cursor
    }

    pub fn is_single(&self) -> bool {
        self.reduction == Reduction::Single
    }

    pub fn is_typed(&self) -> bool {
        self.cursor == CursorKind::Typed
    }

    pub fn is_direct(&self) -> bool {
        self.direct
    }

    pub fn is_property(&self) -> bool {
        self.property
    }

    /// Statement text and ordered parameter values for `args`.
    pub fn build(&self, args: &Args) -> Result<(String, Vec<Value>)> {
        self.check_declared()?;
        let values = position(&self.args, args)?;
        let sql = self.statement(args.options())?;
        Ok((sql, values))
    }

    fn check_declared(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for name in self.args.iter() {
            if !seen.insert(name.as_str()) {
                return Err(QuarryError::Programming(format!(
                    "argument {} declared twice for {}",
                    name, self.base
                )));
            }
        }
        Ok(())
    }

    fn statement(&self, options: &Options) -> Result<String> {
        let columns = options.columns.as_deref();
        match self.kind {
            QueryKind::Raw => Ok(sql::rewrite_pyformat(&self.base)),
            QueryKind::Table => sql::select_from_table(&self.base, &self.args, columns, self.is_typed()),
            QueryKind::Function => {
                let direct = options.direct.unwrap_or(self.direct) || self.is_typed();
                sql::call_function(&self.base, self.args.len(), columns, direct)
            }
        }
    }

    /// Run the descriptor.
    ///
    /// The handle is the `handle` option if given, else the bound handle,
    /// else a new one from the handle factory, which is then bound. Single
    /// descriptors fail with [`QuarryError::UnexpectedRowCount`] unless
    /// exactly one row comes back.
    pub fn call(&self, args: Args) -> Result<Output> {
        let (sql, values) = self.build(&args)?;
        let handle = self.resolve_handle(args.options().handle.clone())?;
        let callback = args
            .options()
            .callback
            .clone()
            .or_else(|| self.callback.clone());

        log::debug!("{} -> {}", self.base, sql);
        let mut cursor = handle.cursor(self.cursor)?.with_callback(callback);
        cursor.execute(&sql, values)?;

        match self.reduction {
            Reduction::All => Ok(Output::Cursor(cursor)),
            Reduction::Single => {
                let got = cursor.rowcount().unwrap_or(0);
                if got != 1 {
                    return Err(QuarryError::UnexpectedRowCount { expected: 1, got });
                }
                cursor
                    .fetchone()
                    .map(Output::Item)
                    .ok_or(QuarryError::UnexpectedRowCount { expected: 1, got: 0 })
            }
        }
    }

    /// [`Descriptor::call`] expecting a cursor.
    pub fn fetch(&self, args: Args) -> Result<Cursor> {
        self.call(args)?.into_cursor()
    }

    /// [`Descriptor::call`] expecting a single item.
    pub fn fetch_one(&self, args: Args) -> Result<Item> {
        self.call(args)?.into_item()
    }

    /// [`Descriptor::call`] for a keyed lookup; no row is
    /// [`Lookup::NotFound`] rather than an error.
    pub fn lookup(&self, args: Args) -> Result<Lookup> {
        Lookup::from_result(self.call(args))
    }

    fn resolve_handle(&self, explicit: Option<Handle>) -> Result<Handle> {
        if let Some(handle) = explicit {
            return Ok(handle);
        }
        let mut slot = self.handle_slot();
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.clone());
        }
        let handle = config::new_handle()?;
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Commit on the bound handle.
    pub fn commit(&self) -> Result<()> {
        self.require_handle("commit")?.commit()
    }

    /// Roll back on the bound handle.
    pub fn rollback(&self) -> Result<()> {
        self.require_handle("rollback")?.rollback()
    }

    fn require_handle(&self, action: &str) -> Result<Handle> {
        self.bound_handle().ok_or_else(|| {
            QuarryError::Programming(format!(
                "cannot {} {}: no handle bound",
                action, self.base
            ))
        })
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("kind", &self.kind)
            .field("base", &self.base)
            .field("args", &self.args)
            .field("reduction", &self.reduction)
            .field("cursor", &self.cursor)
            .field("direct", &self.direct)
            .field("property", &self.property)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.statement(&Options::default()) {
            Ok(sql) => f.write_str(&sql),
            Err(_) => f.write_str(&self.base),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use crate::mock::{self, MockConnector};
    use crate::transaction::TransactionMode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (MockConnector, Handle) {
        let driver = mock::test_database();
        let handle = Handle::with_connector("dbname=mock", TransactionMode::Autocommit, driver.clone())
            .unwrap();
        (driver, handle)
    }

    #[test]
    fn test_query_filters_by_declared_args() {
        let (driver, h) = setup();
        let by_id = Descriptor::query("test_table", &["id"]);
        let mut cursor = by_id.fetch(args![id = 1].handle(h)).unwrap();
        assert_eq!(cursor.rowcount(), Some(1));
        let row = cursor.fetchone().unwrap();
        assert_eq!(row.get("id"), Some(&Value::Int(1)));
        assert_eq!(row.get("value"), Some(&Value::from("one")));
        assert!(driver
            .executed()
            .contains(&"SELECT * FROM test_table WHERE id=$1".to_string()));
    }

    #[test]
    fn test_function_single_with_no_rows() {
        let (_driver, h) = setup();
        let get = Descriptor::function("test_get", &["id"]).single();
        let err = get.call(args![id = 999].handle(h)).unwrap_err();
        assert!(matches!(
            err,
            QuarryError::UnexpectedRowCount { expected: 1, got: 0 }
        ));
    }

    #[test]
    fn test_single_with_many_rows() {
        let (_driver, h) = setup();
        let all = Descriptor::function("test", &[]).single();
        let err = all.call(args![].handle(h)).unwrap_err();
        assert!(matches!(
            err,
            QuarryError::UnexpectedRowCount { expected: 1, got: 3 }
        ));
    }

    #[test]
    fn test_function_typed_single_returns_bare_value() {
        let (driver, h) = setup();
        let constant = Descriptor::function("test_constant", &[]).typed().single();
        let value = constant.call(args![].handle(h)).unwrap().into_value().unwrap();
        assert_eq!(value, Value::Int(1));
        assert!(driver.executed().contains(&"SELECT test_constant()".to_string()));
    }

    #[test]
    fn test_argument_errors_run_nothing() {
        let (driver, h) = setup();
        let update = Descriptor::function("update_row", &["id", "new_value"]);
        let err = update.call(args![1].handle(h.clone())).unwrap_err();
        assert!(matches!(
            err,
            QuarryError::InsufficientArguments { expected: 2, got: 1 }
        ));
        let err = update
            .call(args![1; new_value = "x", extra = 3].handle(h))
            .unwrap_err();
        assert!(err.is_argument_count());
        assert!(driver.executed().is_empty());
    }

    #[test]
    fn test_direct_option_and_default() {
        let update = Descriptor::function("update_row", &["id", "new_value"]);
        let (sql, values) = update.build(&args![1, "uno"].direct(true)).unwrap();
        assert_eq!(sql, "SELECT update_row($1,$2)");
        assert_eq!(values, vec![Value::Int(1), Value::from("uno")]);

        let direct = update.clone().direct();
        let (sql, _) = direct.build(&args![1, "uno"]).unwrap();
        assert_eq!(sql, "SELECT update_row($1,$2)");
        let (sql, _) = direct.build(&args![1, "uno"].direct(false)).unwrap();
        assert_eq!(sql, "SELECT * FROM update_row($1,$2)");
    }

    #[test]
    fn test_columns_option() {
        let get = Descriptor::query("test_table", &["id"]);
        let (sql, _) = get.build(&args![1].columns(["value"])).unwrap();
        assert_eq!(sql, "SELECT value FROM test_table WHERE id=$1");

        let typed = Descriptor::query("test_table", &["id"]).typed();
        let err = typed.build(&args![1].columns(["value"])).unwrap_err();
        assert!(matches!(err, QuarryError::Programming(_)));

        let direct = Descriptor::function("test_get", &["id"]);
        let err = direct
            .build(&args![1].columns(["value"]).direct(true))
            .unwrap_err();
        assert!(matches!(err, QuarryError::Programming(_)));
    }

    #[test]
    fn test_typed_query_uses_row_cast() {
        let typed = Descriptor::query("test_table", &["id"]).typed();
        let (sql, _) = typed.build(&args![2]).unwrap();
        assert_eq!(sql, "SELECT row(t.*)::test_table FROM test_table t WHERE id=$1");
    }

    #[test]
    fn test_raw_pyformat_template() {
        let (driver, h) = setup();
        let raw = Descriptor::raw("SELECT * FROM test_table WHERE id = %s", &["id"]);
        assert_eq!(raw.to_string(), "SELECT * FROM test_table WHERE id = $1");
        let cursor = raw.fetch(args![3].handle(h)).unwrap();
        assert_eq!(cursor.rowcount(), Some(1));
        let logged = driver.executed_with_params();
        let last = logged.last().unwrap();
        assert_eq!(last.sql, "SELECT * FROM test_table WHERE id = $1");
        assert_eq!(last.params, vec![Value::Int(3)]);
    }

    #[test]
    fn test_duplicate_declared_args_rejected() {
        let bad = Descriptor::query("test_table", &["id", "id"]);
        assert!(matches!(
            bad.build(&args![1, 2]),
            Err(QuarryError::Programming(_))
        ));
    }

    #[test]
    fn test_callback_option_overrides_default() {
        let (_driver, h) = setup();
        let all = Descriptor::function("test", &[])
            .with_callback(|item| Item::Value(item.get("id").cloned().unwrap_or(Value::Null)));
        let ids: Vec<Item> = all.fetch(args![].handle(h.clone())).unwrap().collect();
        assert_eq!(ids[0], Item::Value(Value::Int(1)));

        let values: Vec<Item> = all
            .fetch(
                args![]
                    .handle(h)
                    .callback(|item| Item::Value(item.get("value").cloned().unwrap_or(Value::Null))),
            )
            .unwrap()
            .collect();
        assert_eq!(values[2], Item::Value(Value::from("three")));
    }

    #[test]
    fn test_bound_handle_and_transaction_control() {
        let (driver, h) = setup();
        let get = Descriptor::function("test_get", &["id"]).single();
        assert!(matches!(get.commit(), Err(QuarryError::Programming(_))));

        let get = get.with_handle(h.clone());
        let row = get.fetch_one(args![2]).unwrap();
        assert_eq!(row.get("value"), Some(&Value::from("two")));
        get.commit().unwrap();
        get.rollback().unwrap();
        assert_eq!(driver.count("COMMIT"), 1);
        assert_eq!(driver.count("ROLLBACK"), 1);
    }

    #[test]
    fn test_factory_handle_is_created_once_and_cached() {
        static CREATED: AtomicUsize = AtomicUsize::new(0);
        let driver = mock::test_database();
        let factory_driver = driver.clone();
        config::set_handle_factory(move || {
            CREATED.fetch_add(1, Ordering::SeqCst);
            Handle::with_connector("dbname=mock", TransactionMode::Autocommit, factory_driver.clone())
        });

        let get = Descriptor::function("test_get", &["id"]).single();
        get.fetch_one(args![1]).unwrap();
        get.fetch_one(args![2]).unwrap();
        config::reset_handle_factory();

        assert_eq!(CREATED.load(Ordering::SeqCst), 1);
        assert!(get.bound_handle().is_some());
        assert_eq!(driver.connects(), 1);
    }

    #[test]
    fn test_lookup() {
        let (_driver, h) = setup();
        let get = Descriptor::function("test_get", &["id"]).single();
        assert!(get.lookup(args![1].handle(h.clone())).unwrap().is_found());
        assert!(!get.lookup(args![999].handle(h)).unwrap().is_found());
    }

    #[test]
    fn test_output_accessors() {
        let (_driver, h) = setup();
        let all = Descriptor::function("test", &[]);
        let out = all.call(args![].handle(h.clone())).unwrap();
        assert!(out.is_cursor());
        assert!(matches!(out.into_item(), Err(QuarryError::Programming(_))));

        let first = all.call(args![].handle(h)).unwrap().first().unwrap();
        assert_eq!(first.get("value"), Some(&Value::from("one")));
    }
}
