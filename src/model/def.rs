//! Model definitions.

use std::sync::{Arc, OnceLock};

use crate::cursor::CursorKind;
use crate::error::{QuarryError, Result};
use crate::handle::Handle;
use crate::model::composite::{self, CompositeRegistration};
use crate::query::Descriptor;
use crate::value::Value;

/// Attribute names of a composite type, in declaration order.
const CATALOG_COLUMNS_SQL: &str = "SELECT a.attname \
     FROM pg_catalog.pg_attribute a \
     JOIN pg_catalog.pg_type t ON a.attrelid = t.typrelid \
     JOIN pg_catalog.pg_namespace n ON t.typnamespace = n.oid \
     WHERE n.nspname = $1 AND t.typname = $2 \
     AND a.attnum > 0 AND NOT a.attisdropped AND a.attname <> 'base_' \
     ORDER BY a.attnum";

/// Declaration of a record type.
///
/// Built once with [`ModelDef::builder`] and shared as `Arc<ModelDef>` by all
/// its records. The column list is fixed when the model is built, or read
/// from the catalog the first time the model is registered for a composite
/// type when only `pg_type` is given.
///
/// ```
/// use quarry::{Descriptor, ModelDef};
///
/// let model = ModelDef::builder("TestTable")
///     .columns(["id", "value"])
///     .load(Descriptor::function("test_get", &["id"]))
///     .save(Descriptor::function("update_row", &["id", "value"]))
///     .member("neighbours", Descriptor::query("test_table", &["value"]))
///     .build();
///
/// assert_eq!(model.columns(), ["id", "value"]);
/// assert!(model.member("neighbours").is_some());
/// ```
#[derive(Debug)]
pub struct ModelDef {
    name: String,
    columns: OnceLock<Arc<[String]>>,
    pg_type: Option<(String, String)>,
    loaded_indicator: Option<String>,
    load: Option<Descriptor>,
    lazyload: Option<Descriptor>,
    save: Option<Descriptor>,
    members: Vec<(String, Descriptor)>,
}

impl ModelDef {
    pub fn builder(name: impl Into<String>) -> ModelBuilder {
        ModelBuilder {
            name: name.into(),
            columns: None,
            pg_type: None,
            loaded_indicator: None,
            load: None,
            lazyload: None,
            save: None,
            members: Vec::new(),
        }
    }

    /// A builder starting from everything `parent` declares.
    pub fn extend(parent: &ModelDef, name: impl Into<String>) -> ModelBuilder {
        ModelBuilder {
            name: name.into(),
            columns: parent.columns.get().map(|c| c.to_vec()),
            pg_type: parent.pg_type.clone(),
            loaded_indicator: parent.loaded_indicator.clone(),
            load: parent.load.clone(),
            lazyload: parent.lazyload.clone(),
            save: parent.save.clone(),
            members: parent.members.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared columns; empty until resolved for catalog-described models.
    pub fn columns(&self) -> &[String] {
        self.columns.get().map(|c| &c[..]).unwrap_or(&[])
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns().iter().any(|c| c == name)
    }

    pub fn pg_type(&self) -> Option<(&str, &str)> {
        self.pg_type
            .as_ref()
            .map(|(schema, name)| (schema.as_str(), name.as_str()))
    }

    pub fn loaded_indicator(&self) -> Option<&str> {
        self.loaded_indicator.as_deref()
    }

    pub fn load(&self) -> Option<&Descriptor> {
        self.load.as_ref()
    }

    pub fn lazyload(&self) -> Option<&Descriptor> {
        self.lazyload.as_ref()
    }

    pub fn save(&self) -> Option<&Descriptor> {
        self.save.as_ref()
    }

    pub fn member(&self, name: &str) -> Option<&Descriptor> {
        self.members
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d)
    }

    pub fn members(&self) -> impl Iterator<Item = (&str, &Descriptor)> {
        self.members.iter().map(|(n, d)| (n.as_str(), d))
    }

    /// Read the column list from the catalog if it is not known yet.
    ///
    /// Does nothing for models with declared columns or without `pg_type`.
    pub fn resolve_columns(&self, handle: &Handle) -> Result<()> {
        if self.columns.get().is_some() {
            return Ok(());
        }
        let Some((schema, type_name)) = &self.pg_type else {
            return Ok(());
        };

        let mut cursor = handle.cursor(CursorKind::Typed)?;
        cursor.execute(
            CATALOG_COLUMNS_SQL,
            vec![Value::from(schema.as_str()), Value::from(type_name.as_str())],
        )?;
        let columns = cursor
            .map(|item| String::try_from(item.into_value()))
            .collect::<Result<Vec<String>>>()?;
        if columns.is_empty() {
            return Err(QuarryError::Programming(format!(
                "composite type {}.{} has no attributes",
                schema, type_name
            )));
        }

        log::debug!("{} columns from {}.{}: {:?}", self.name, schema, type_name, columns);
        // A concurrent resolution may have won; both read the same catalog.
        let _ = self.columns.set(Arc::from(columns));
        Ok(())
    }

    /// Materialize values of the composite `type_name` as records of this
    /// model on `handle`.
    pub fn register_composite(self: &Arc<Self>, type_name: &str, handle: &Handle) -> Result<CompositeRegistration> {
        composite::register(self, type_name, handle)
    }
}

/// Builder for [`ModelDef`].
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    name: String,
    columns: Option<Vec<String>>,
    pg_type: Option<(String, String)>,
    loaded_indicator: Option<String>,
    load: Option<Descriptor>,
    lazyload: Option<Descriptor>,
    save: Option<Descriptor>,
    members: Vec<(String, Descriptor)>,
}

impl ModelBuilder {
    /// Replace the column list.
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Append one column.
    pub fn column(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        let columns = self.columns.get_or_insert_with(Vec::new);
        if !columns.contains(&name) {
            columns.push(name);
        }
        self
    }

    /// Composite type whose attributes are the columns, for models that do
    /// not list them.
    pub fn pg_type(mut self, schema: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.pg_type = Some((schema.into(), type_name.into()));
        self
    }

    /// Column whose presence marks a record as loaded.
    pub fn loaded_indicator(mut self, column: impl Into<String>) -> Self {
        self.loaded_indicator = Some(column.into());
        self
    }

    /// Keyed load, run when a record is constructed with arguments.
    pub fn load(mut self, descriptor: Descriptor) -> Self {
        self.load = Some(descriptor);
        self
    }

    /// Deferred load, run on first access of an unset column.
    pub fn lazyload(mut self, descriptor: Descriptor) -> Self {
        self.lazyload = Some(descriptor);
        self
    }

    pub fn save(mut self, descriptor: Descriptor) -> Self {
        self.save = Some(descriptor);
        self
    }

    /// Add a member, replacing one of the same name.
    pub fn member(mut self, name: impl Into<String>, descriptor: Descriptor) -> Self {
        let name = name.into();
        match self.members.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = descriptor,
            None => self.members.push((name, descriptor)),
        }
        self
    }

    pub fn build(self) -> Arc<ModelDef> {
        let columns = OnceLock::new();
        if let Some(list) = self.columns {
            let _ = columns.set(Arc::from(list));
        }
        Arc::new(ModelDef {
            name: self.name,
            columns,
            pg_type: self.pg_type,
            loaded_indicator: self.loaded_indicator,
            load: self.load,
            lazyload: self.lazyload,
            save: self.save,
            members: self.members,
        })
    }
}
