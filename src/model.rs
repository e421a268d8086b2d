//! Records bound to database rows.
//!
//! A [`ModelDef`] declares a record type once: its columns, how an instance
//! is loaded and saved, and the query members callable on an instance. A
//! [`Record`] is one instance carrying column values and dirty state.
//! Registering a model for a composite type turns every value of that type
//! returned on a handle into a record.

pub mod composite;
mod def;
mod record;

pub use composite::CompositeRegistration;
pub use def::{ModelBuilder, ModelDef};
pub use record::{Attribute, BoundQuery, ColumnState, Lookup, Record};
