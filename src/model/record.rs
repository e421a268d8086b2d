//! Record instances.
//!
//! A [`Record`] holds one row of a [`ModelDef`]: a [`ColumnState`] per
//! column, extra attributes set by callers, the handle its queries run on
//! and, for lazy records, the arguments of the load still to come.

use std::fmt;
use std::sync::Arc;

use crate::config;
use crate::cursor::Item;
use crate::error::{QuarryError, Result};
use crate::handle::Handle;
use crate::model::composite;
use crate::model::ModelDef;
use crate::query::{Args, Descriptor, Output};
use crate::value::{Composite, Value};

/// Pseudo-column carrying the values of a base composite type.
const BASE_COLUMN: &str = "base_";

/// State of one column.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ColumnState {
    #[default]
    Unset,
    Loaded(Value),
    /// Assigned since the last load or save
    Dirty {
        baseline: Option<Value>,
        value: Value,
    },
}

impl ColumnState {
    /// The value a read returns.
    pub fn current(&self) -> Option<&Value> {
        match self {
            ColumnState::Unset => None,
            ColumnState::Loaded(value) => Some(value),
            ColumnState::Dirty { value, .. } => Some(value),
        }
    }

    /// The value last loaded from the database.
    pub fn baseline(&self) -> Option<&Value> {
        match self {
            ColumnState::Unset => None,
            ColumnState::Loaded(value) => Some(value),
            ColumnState::Dirty { baseline, .. } => baseline.as_ref(),
        }
    }

    pub fn is_set(&self) -> bool {
        !matches!(self, ColumnState::Unset)
    }

    pub fn is_dirty(&self) -> bool {
        matches!(self, ColumnState::Dirty { .. })
    }

    /// Dirty value, else loaded value, else NULL.
    pub fn save_value(&self) -> Value {
        self.current().cloned().unwrap_or(Value::Null)
    }

    fn assign(&mut self, value: Value) {
        let baseline = match std::mem::take(self) {
            ColumnState::Unset => None,
            ColumnState::Loaded(loaded) => Some(loaded),
            ColumnState::Dirty { baseline, .. } => baseline,
        };
        *self = ColumnState::Dirty { baseline, value };
    }

    /// Take a value read from the database. A pending assignment keeps
    /// precedence and only its baseline moves.
    fn reload(&mut self, loaded: Value) {
        match self {
            ColumnState::Dirty { baseline, .. } => *baseline = Some(loaded),
            _ => *self = ColumnState::Loaded(loaded),
        }
    }

    fn settle(&mut self) {
        if let ColumnState::Dirty { value, .. } = self {
            *self = ColumnState::Loaded(std::mem::replace(value, Value::Null));
        }
    }
}

/// Outcome of a keyed load.
#[derive(Debug)]
pub enum Lookup {
    Found(Item),
    NotFound,
}

impl Lookup {
    /// Interpret the result of a keyed query.
    ///
    /// No row, a zero-row single call and the `P0002` no-data-found error are
    /// [`Lookup::NotFound`]; more than one row is an error.
    pub fn from_result(result: Result<Output>) -> Result<Lookup> {
        match result {
            Ok(Output::Item(item)) => Ok(Lookup::Found(item)),
            Ok(Output::Cursor(mut cursor)) => match cursor.rowcount().unwrap_or(0) {
                0 => Ok(Lookup::NotFound),
                1 => Ok(cursor.fetchone().map_or(Lookup::NotFound, Lookup::Found)),
                got => Err(QuarryError::UnexpectedRowCount { expected: 1, got }),
            },
            Err(QuarryError::UnexpectedRowCount { got: 0, .. }) => Ok(Lookup::NotFound),
            Err(e) if e.db_error().is_some_and(|db| db.is_no_data_found()) => {
                log::debug!("keyed load: {}", e);
                Ok(Lookup::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn found(self) -> Option<Item> {
        match self {
            Lookup::Found(item) => Some(item),
            Lookup::NotFound => None,
        }
    }
}

/// What a name resolves to on a record.
#[derive(Debug)]
pub enum Attribute {
    Column(Value),
    /// Result of a property member
    Property(Output),
    /// A member ready to be called with keyword arguments
    Method(BoundQuery),
}

/// A member query bound to a snapshot of a record's columns and handle.
#[derive(Debug, Clone)]
pub struct BoundQuery {
    name: String,
    descriptor: Descriptor,
    columns: Vec<(String, Value)>,
    handle: Option<Handle>,
}

impl BoundQuery {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Call with keyword arguments; record columns fill the declared
    /// arguments not given.
    pub fn call(&self, args: Args) -> Result<Output> {
        let mut args = member_args(&self.name, &self.descriptor, args, |name| {
            Ok(self
                .columns
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone()))
        })?;
        if args.options().handle.is_none() {
            args.options_mut().handle = self.handle.clone();
        }
        self.descriptor.call(args)
    }
}

fn member_args<F>(member: &str, descriptor: &Descriptor, args: Args, mut column: F) -> Result<Args>
where
    F: FnMut(&str) -> Result<Option<Value>>,
{
    if !args.positional().is_empty() {
        return Err(QuarryError::PositionalArgumentsRejected(member.to_string()));
    }
    let mut args = args;
    for name in descriptor.declared_args() {
        if args.has_keyword(name) {
            continue;
        }
        if let Some(value) = column(name)? {
            args.set_keyword(name.clone(), value);
        }
    }
    Ok(args)
}

/// Move the columns of `base_` values in front of the others, recursively,
/// so that the record's own columns are applied last.
fn flatten(pairs: Vec<(String, Value)>) -> Vec<(String, Value)> {
    let mut merged = Vec::with_capacity(pairs.len());
    let mut own = Vec::with_capacity(pairs.len());
    for (name, value) in pairs {
        if name == BASE_COLUMN {
            merged.extend(flatten(composite::value_pairs(value)));
        } else {
            own.push((name, value));
        }
    }
    merged.extend(own);
    merged
}

/// One instance of a model.
///
/// ```
/// use quarry::{ModelDef, Record, Value};
///
/// let model = ModelDef::builder("TestTable").columns(["id", "value"]).build();
/// let mut record = Record::new(model);
/// record.set("value", "one");
/// assert!(record.is_dirty());
/// assert_eq!(record.peek("value"), Some(&Value::from("one")));
/// assert_eq!(record.get("id").unwrap(), Value::Null);
/// ```
#[derive(Clone)]
pub struct Record {
    model: Arc<ModelDef>,
    handle: Option<Handle>,
    values: Vec<(String, ColumnState)>,
    attributes: Vec<(String, Value)>,
    pending: Option<Args>,
    loaded: bool,
}

impl Record {
    /// An empty record of `model`, not loaded.
    pub fn new(model: Arc<ModelDef>) -> Self {
        let values = model
            .columns()
            .iter()
            .map(|c| (c.clone(), ColumnState::Unset))
            .collect();
        Self {
            model,
            handle: None,
            values,
            attributes: Vec::new(),
            pending: None,
            loaded: false,
        }
    }

    pub fn with_handle(model: Arc<ModelDef>, handle: Handle) -> Self {
        let mut record = Self::new(model);
        record.handle = Some(handle);
        record
    }

    /// Load a record by key.
    ///
    /// Models with a `lazyload` keep `args` and load on first access of an
    /// unset column; models with a `load` run it now and fail with
    /// [`QuarryError::NotFound`] when there is no row. The `handle` option of
    /// `args` becomes the record's handle.
    pub fn load(model: Arc<ModelDef>, args: Args) -> Result<Self> {
        let mut record = Self::new(model);
        record.handle = args.options().handle.clone();

        if record.model.lazyload().is_some() {
            log::debug!("{}: deferring load {:?}", record.model.name(), args.keywords());
            record.pending = Some(args);
            return Ok(record);
        }
        if record.model.load().is_some() {
            record.load_by_key(args)?;
            return Ok(record);
        }
        Err(QuarryError::Programming(format!(
            "{} declares neither load nor lazyload",
            record.model.name()
        )))
    }

    /// A record from the attributes of a composite value.
    ///
    /// Loaded when the model's loaded indicator is among the attributes, or
    /// when it declares none. A lazy model that is not loaded keeps its
    /// lazyload arguments from the attributes it did get.
    pub fn from_composite(model: Arc<ModelDef>, composite: Composite, handle: Option<Handle>) -> Self {
        let mut record = Self::new(model);
        record.handle = handle;
        let pairs = flatten(composite.into_fields());
        let declared = !record.model.columns().is_empty();
        for (name, value) in pairs {
            if !declared || record.model.has_column(&name) {
                *record.state_mut(&name) = ColumnState::Loaded(value);
            }
        }

        record.loaded = match record.model.loaded_indicator() {
            Some(indicator) => record.column(indicator).is_some_and(ColumnState::is_set),
            None => true,
        };
        if record.loaded {
            record.fill_unset();
        } else {
            record.pending = record.lazy_args_from_columns();
        }
        record
    }

    /// A loaded record from `(name, value)` pairs, `base_` values included.
    pub fn from_pairs(model: Arc<ModelDef>, pairs: Vec<(String, Value)>, handle: Option<Handle>) -> Self {
        let mut record = Self::new(model);
        record.handle = handle;
        record.merge(pairs);
        record
    }

    pub fn model(&self) -> &Arc<ModelDef> {
        &self.model
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Whether a lazy load is still to run.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn bound_handle(&self) -> Option<&Handle> {
        self.handle.as_ref()
    }

    pub fn set_handle(&mut self, handle: Handle) {
        self.handle = Some(handle);
    }

    /// The record's handle, created by the handle factory on first use.
    pub fn handle(&mut self) -> Result<Handle> {
        if let Some(handle) = &self.handle {
            return Ok(handle.clone());
        }
        let handle = config::new_handle()?;
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    fn column(&self, name: &str) -> Option<&ColumnState> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    fn state_mut(&mut self, name: &str) -> &mut ColumnState {
        let index = match self.values.iter().position(|(n, _)| n == name) {
            Some(index) => index,
            None => {
                self.values.push((name.to_string(), ColumnState::Unset));
                self.values.len() - 1
            }
        };
        &mut self.values[index].1
    }

    fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn column_state(&self, name: &str) -> Option<&ColumnState> {
        self.column(name)
    }

    /// Current value of a column or attribute, without loading anything.
    pub fn peek(&self, name: &str) -> Option<&Value> {
        self.column(name)
            .and_then(ColumnState::current)
            .or_else(|| self.attribute(name))
    }

    /// Read a column or attribute.
    ///
    /// An unset declared column of a lazy record runs the lazy load first;
    /// it runs once, and a declared column still unset afterwards reads as
    /// NULL.
    pub fn get(&mut self, name: &str) -> Result<Value> {
        if let Some(value) = self.column(name).and_then(ColumnState::current) {
            return Ok(value.clone());
        }
        if self.model.has_column(name) {
            if self.pending.is_some() && !self.loaded {
                self.lazy_load()?;
            }
            return Ok(self.peek(name).cloned().unwrap_or(Value::Null));
        }
        if let Some(value) = self.attribute(name) {
            return Ok(value.clone());
        }
        if self.column(name).is_some() {
            return Ok(Value::Null);
        }
        Err(QuarryError::UnknownAttribute {
            model: self.model.name().to_string(),
            name: name.to_string(),
        })
    }

    /// Assign a column, marking it dirty. Names that are not columns are
    /// stored as plain attributes.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        if self.model.has_column(name) || self.column(name).is_some() {
            self.state_mut(name).assign(value);
            return;
        }
        match self.attributes.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((name.to_string(), value)),
        }
    }

    /// Resolve `name` to a column, a member or an attribute.
    pub fn attr(&mut self, name: &str) -> Result<Attribute> {
        if self.model.has_column(name) || self.column(name).is_some() {
            return self.get(name).map(Attribute::Column);
        }
        let model = Arc::clone(&self.model);
        if let Some(descriptor) = model.member(name) {
            if descriptor.is_property() {
                return self.property(name).map(Attribute::Property);
            }
            let mut columns = Vec::new();
            for declared in descriptor.declared_args() {
                if let Some(value) = self.arg_value(declared)? {
                    columns.push((declared.clone(), value));
                }
            }
            return Ok(Attribute::Method(BoundQuery {
                name: name.to_string(),
                descriptor: descriptor.clone(),
                columns,
                handle: Some(self.handle()?),
            }));
        }
        self.get(name).map(Attribute::Column)
    }

    /// Call the member `name` with keyword arguments.
    ///
    /// Declared arguments not given are taken from the record's columns, and
    /// the record's handle is used unless `args` names another.
    pub fn call(&mut self, name: &str, args: Args) -> Result<Output> {
        let model = Arc::clone(&self.model);
        let descriptor = model.member(name).ok_or_else(|| QuarryError::UnknownAttribute {
            model: model.name().to_string(),
            name: name.to_string(),
        })?;
        let mut args = member_args(name, descriptor, args, |arg| self.arg_value(arg))?;
        if args.options().handle.is_none() {
            args.options_mut().handle = Some(self.handle()?);
        }
        log::debug!("{}.{}({:?})", model.name(), name, args.keywords());
        descriptor.call(args)
    }

    /// Evaluate the property member `name`, its arguments all taken from the
    /// record's columns (NULL when missing).
    pub fn property(&mut self, name: &str) -> Result<Output> {
        let model = Arc::clone(&self.model);
        let descriptor = model.member(name).ok_or_else(|| QuarryError::UnknownAttribute {
            model: model.name().to_string(),
            name: name.to_string(),
        })?;
        let mut args = Args::new();
        for declared in descriptor.declared_args() {
            let value = self.arg_value(declared)?.unwrap_or(Value::Null);
            args.set_keyword(declared.clone(), value);
        }
        args.options_mut().handle = Some(self.handle()?);
        descriptor.call(args)
    }

    fn arg_value(&mut self, name: &str) -> Result<Option<Value>> {
        if self.model.has_column(name) || self.column(name).is_some() {
            return self.get(name).map(Some);
        }
        Ok(self.attribute(name).cloned())
    }

    /// Send the columns through the model's save query.
    ///
    /// Each declared argument of the save query gets the dirty value, else
    /// the loaded value, else NULL. Columns in the returned row replace the
    /// record's values; the rest keep theirs, now as loaded values. Nothing is
    /// committed.
    pub fn save(&mut self) -> Result<()> {
        let model = Arc::clone(&self.model);
        let descriptor = model
            .save()
            .ok_or_else(|| QuarryError::SaveNotSupported(model.name().to_string()))?;

        let mut args = Args::new();
        for name in descriptor.declared_args() {
            let value = match self.column(name) {
                Some(state) => state.save_value(),
                None => self.attribute(name).cloned().unwrap_or(Value::Null),
            };
            args.set_keyword(name.clone(), value);
        }
        args.options_mut().handle = Some(self.handle()?);

        let returned = match descriptor.call(args)? {
            Output::Item(item) => Some(item),
            Output::Cursor(mut cursor) => cursor.fetchone(),
        };
        let returned = flatten(returned.map(Item::into_pairs).unwrap_or_default());
        for (name, state) in self.values.iter_mut() {
            match returned.iter().rev().find(|(n, _)| n == name) {
                Some((_, value)) => *state = ColumnState::Loaded(value.clone()),
                None => state.settle(),
            }
        }
        log::debug!("{}: saved", model.name());
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.values.iter().any(|(_, s)| s.is_dirty())
    }

    pub fn dirty_columns(&self) -> Vec<&str> {
        self.values
            .iter()
            .filter(|(_, s)| s.is_dirty())
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// Columns with their current values, unset ones as NULL.
    pub fn pairs(&self) -> Vec<(String, Value)> {
        self.values
            .iter()
            .map(|(n, s)| (n.clone(), s.save_value()))
            .collect()
    }

    pub fn into_pairs(self) -> Vec<(String, Value)> {
        self.values
            .into_iter()
            .map(|(n, s)| {
                let value = s.save_value();
                (n, value)
            })
            .collect()
    }

    /// Plain attributes set on this record.
    pub fn attributes(&self) -> &[(String, Value)] {
        &self.attributes
    }

    pub fn commit(&self) -> Result<()> {
        self.require_handle("commit")?.commit()
    }

    pub fn rollback(&self) -> Result<()> {
        self.require_handle("rollback")?.rollback()
    }

    /// Close the record's handle, if it has one.
    pub fn close(&self) {
        if let Some(handle) = &self.handle {
            handle.close();
        }
    }

    fn require_handle(&self, action: &str) -> Result<&Handle> {
        self.handle.as_ref().ok_or_else(|| {
            QuarryError::Programming(format!(
                "cannot {} {} without a handle",
                action,
                self.model.name()
            ))
        })
    }

    fn lazy_load(&mut self) -> Result<()> {
        let Some(args) = self.pending.take() else {
            return Ok(());
        };
        if let Err(e) = self.load_by_key(args.clone()) {
            self.pending = Some(args);
            return Err(e);
        }
        Ok(())
    }

    fn load_by_key(&mut self, mut args: Args) -> Result<()> {
        let model = Arc::clone(&self.model);
        let descriptor = model.lazyload().or_else(|| model.load()).ok_or_else(|| {
            QuarryError::Programming(format!("{} declares no load", model.name()))
        })?;
        args.options_mut().handle = Some(self.handle()?);

        let item = match Lookup::from_result(descriptor.call(args))? {
            Lookup::Found(item) => item,
            Lookup::NotFound => {
                return Err(QuarryError::NotFound(format!("{} ({})", model.name(), descriptor.base())));
            }
        };
        let pairs = match item {
            Item::Value(value) if !matches!(value, Value::Record(_) | Value::Composite(_)) => {
                match model.columns().first() {
                    Some(first) => vec![(first.clone(), value)],
                    None => Vec::new(),
                }
            }
            item => item.into_pairs(),
        };
        self.merge(pairs);
        Ok(())
    }

    /// Apply a loaded row: every declared column is set, absent ones NULL.
    /// Dirty columns keep their assigned value.
    fn merge(&mut self, pairs: Vec<(String, Value)>) {
        let declared = !self.model.columns().is_empty();
        for (name, value) in flatten(pairs) {
            if !declared || self.model.has_column(&name) {
                self.state_mut(&name).reload(value);
            }
        }
        self.fill_unset();
        self.loaded = true;
        self.pending = None;
    }

    fn fill_unset(&mut self) {
        for (_, state) in self.values.iter_mut() {
            if !state.is_set() {
                *state = ColumnState::Loaded(Value::Null);
            }
        }
    }

    fn lazy_args_from_columns(&self) -> Option<Args> {
        let descriptor = self.model.lazyload()?;
        let mut args = Args::new();
        for name in descriptor.declared_args() {
            let value = self.column(name).and_then(ColumnState::current)?;
            args.set_keyword(name.clone(), value.clone());
        }
        Some(args)
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.model.name() == other.model.name()
            && self.values == other.values
            && self.attributes == other.attributes
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("model", &self.model.name())
            .field("values", &self.values)
            .field("attributes", &self.attributes)
            .field("loaded", &self.loaded)
            .field("pending", &self.pending.is_some())
            .finish()
    }
}
