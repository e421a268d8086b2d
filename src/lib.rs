//! # Quarry
//!
//! Declarative PostgreSQL queries, stored-procedure calls and record mapping
//! on top of `may_postgres`.
//!
//! - [`Descriptor`]: a named table query, function call or raw statement
//!   with a declared argument list.
//! - [`Handle`]: one connection with transaction control, reconnecting when
//!   the server went away.
//! - [`Cursor`]: a buffered result yielding rows, or single values for typed
//!   queries.
//! - [`ModelDef`] and [`Record`]: rows bound to a model, with keyed and lazy
//!   loading, dirty tracking and member queries. Composite types registered
//!   on a handle come back as records.
//! - [`Context`]: one lazily opened handle shared by the descriptors and
//!   records built through it.
//!
//! ```no_run
//! use quarry::{args, Descriptor, Handle, ModelDef, Record};
//!
//! # fn main() -> quarry::Result<()> {
//! let handle = Handle::connect("host=localhost dbname=app user=app")?;
//!
//! let all = Descriptor::function("test", &[]);
//! for row in all.fetch(args![].handle(handle.clone()))? {
//!     println!("{:?}", row.get("value"));
//! }
//!
//! let model = ModelDef::builder("TestTable")
//!     .columns(["id", "value"])
//!     .load(Descriptor::function("test_get", &["id"]).single())
//!     .save(Descriptor::function("update_row", &["id", "value"]))
//!     .build();
//! let mut record = Record::load(model, args![id = 1].handle(handle.clone()))?;
//! record.set("value", "uno");
//! record.save()?;
//! record.commit()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod context;
pub mod cursor;
pub mod error;
pub mod handle;
pub mod metrics;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod model;
pub mod query;
pub mod registry;
pub mod row;
pub mod transaction;
pub mod value;

pub use config::DatabaseConfig;
pub use connection::{Connection, ConnectionError, Connector, QueryOutput};
pub use context::Context;
pub use cursor::{Cursor, CursorKind, Item, RowCallback};
pub use error::{DbError, DbErrorKind, QuarryError, Result};
pub use handle::{Handle, HandleId};
pub use model::{Attribute, BoundQuery, ColumnState, CompositeRegistration, Lookup, ModelBuilder, ModelDef, Record};
pub use query::{Args, Descriptor, Options, Output, QueryKind, Reduction};
pub use row::Row;
pub use transaction::{IsolationLevel, TransactionError, TransactionMode};
pub use value::{Composite, Value};
