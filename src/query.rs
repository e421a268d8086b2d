//! Query descriptors and their arguments.
//!
//! See [`Descriptor`] for the statement forms and [`Args`] for how call
//! arguments are supplied.

pub mod args;
pub mod descriptor;
pub(crate) mod sql;

pub use args::{position, Args, Options};
pub use descriptor::{Descriptor, Output, QueryKind, Reduction};
