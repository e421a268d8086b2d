//! Composite type registration and result materialization.
//!
//! Registering a model for a composite type on a handle makes every value of
//! that type the handle returns come back as a [`Record`]: top-level columns,
//! elements of arrays and attributes of other composites alike. Nested values
//! are converted first, so a record's columns already hold records.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::handle::Handle;
use crate::model::{ModelDef, Record};
use crate::value::Value;

/// Registered models of one handle, keyed by `schema.type`.
pub(crate) type CompositeMap = HashMap<String, Arc<ModelDef>>;

/// Qualify an unqualified type name with `public`.
pub(crate) fn qualified_name(type_name: &str) -> String {
    if type_name.contains('.') {
        type_name.to_string()
    } else {
        format!("public.{}", type_name)
    }
}

/// A model registered for a composite type on one handle.
#[derive(Clone)]
pub struct CompositeRegistration {
    type_name: String,
    model: Arc<ModelDef>,
}

impl CompositeRegistration {
    /// Qualified name of the composite type.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn model(&self) -> &Arc<ModelDef> {
        &self.model
    }

    /// Stop materializing the type on `handle`. Returns whether it was
    /// registered there.
    pub fn unregister(&self, handle: &Handle) -> bool {
        handle.unregister_composite(&self.type_name)
    }
}

impl fmt::Debug for CompositeRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeRegistration")
            .field("type_name", &self.type_name)
            .field("model", &self.model.name())
            .finish()
    }
}

/// Register `model` for the composite `type_name` on `handle`.
///
/// A model without declared columns but with a `pg_type` reads its column
/// list from the catalog first. Registering the same type again replaces the
/// earlier model.
pub fn register(model: &Arc<ModelDef>, type_name: &str, handle: &Handle) -> Result<CompositeRegistration> {
    let type_name = qualified_name(type_name);
    model.resolve_columns(handle)?;
    handle.register_composite(type_name.clone(), Arc::clone(model));
    log::debug!(
        "registered {} for composite {} on handle {}",
        model.name(),
        type_name,
        handle.id()
    );
    Ok(CompositeRegistration {
        type_name,
        model: Arc::clone(model),
    })
}

/// Convert registered composites inside `value` into records, depth-first.
pub(crate) fn materialize(value: Value, registry: &CompositeMap, handle: &Handle) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| materialize(item, registry, handle))
                .collect(),
        ),
        Value::Composite(composite) => {
            let composite = composite.map_fields(|field| materialize(field, registry, handle));
            match registry.get(composite.type_name()) {
                Some(model) => Value::Record(Box::new(Record::from_composite(
                    Arc::clone(model),
                    composite,
                    Some(handle.clone()),
                ))),
                None => Value::Composite(composite),
            }
        }
        other => other,
    }
}

/// `(name, value)` pairs of a record or composite; empty for anything else.
pub(crate) fn value_pairs(value: Value) -> Vec<(String, Value)> {
    match value {
        Value::Record(record) => record.into_pairs(),
        Value::Composite(composite) => composite.into_fields(),
        _ => Vec::new(),
    }
}
