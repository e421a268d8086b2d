//! Call arguments and per-call options.

use std::fmt;
use std::sync::Arc;

use crate::cursor::{Item, RowCallback};
use crate::error::{QuarryError, Result};
use crate::handle::Handle;
use crate::value::Value;

/// Options that steer one invocation instead of filling placeholders.
#[derive(Clone, Default)]
pub struct Options {
    /// Projection replacing `*` for table and function queries.
    pub columns: Option<Vec<String>>,
    /// Handle to run on, taking priority over the descriptor's own.
    pub handle: Option<Handle>,
    /// Row callback replacing the descriptor's default.
    pub callback: Option<RowCallback>,
    /// Call a function as `SELECT f(...)` instead of `SELECT * FROM f(...)`.
    pub direct: Option<bool>,
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("columns", &self.columns)
            .field("handle", &self.handle)
            .field("callback", &self.callback.as_ref().map(|_| "<fn>"))
            .field("direct", &self.direct)
            .finish()
    }
}

/// Positional and keyword arguments for one invocation, plus its options.
///
/// ```
/// use quarry::{args, Args, Value};
///
/// let a = Args::new().arg(1).kwarg("value", "one");
/// assert_eq!(a.len(), 2);
///
/// let b = args![1; value = "one"];
/// assert_eq!(a.positional(), b.positional());
/// assert_eq!(b.keyword("value"), Some(&Value::from("one")));
/// ```
#[derive(Clone, Default, Debug)]
pub struct Args {
    positional: Vec<Value>,
    keywords: Vec<(String, Value)>,
    options: Options,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arguments from positional values only.
    pub fn from_values<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            positional: values.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a keyword argument, replacing an earlier one of the same name.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_keyword(name.into(), value.into());
        self
    }

    pub(crate) fn set_keyword(&mut self, name: String, value: Value) {
        match self.keywords.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.keywords.push((name, value)),
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn handle(mut self, handle: Handle) -> Self {
        self.options.handle = Some(handle);
        self
    }

    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(Item) -> Item + Send + Sync + 'static,
    {
        self.options.callback = Some(Arc::new(callback));
        self
    }

    pub fn direct(mut self, direct: bool) -> Self {
        self.options.direct = Some(direct);
        self
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn keywords(&self) -> &[(String, Value)] {
        &self.keywords
    }

    pub fn keyword(&self, name: &str) -> Option<&Value> {
        self.keywords
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn has_keyword(&self, name: &str) -> bool {
        self.keyword(name).is_some()
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub(crate) fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    /// Number of supplied values, positional and keyword.
    pub fn len(&self) -> usize {
        self.positional.len() + self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Place supplied arguments into declared order.
///
/// Checks run in this order: total count against the declaration, then
/// unknown keyword names, then keywords naming a slot already filled
/// positionally.
pub fn position(declared: &[String], args: &Args) -> Result<Vec<Value>> {
    let expected = declared.len();
    let got = args.len();
    if got < expected {
        return Err(QuarryError::InsufficientArguments { expected, got });
    }
    if got > expected {
        return Err(QuarryError::TooManyArguments { expected, got });
    }

    let mut slots: Vec<Option<Value>> = args.positional.iter().cloned().map(Some).collect();
    slots.resize(expected, None);
    for (name, value) in &args.keywords {
        let index = declared
            .iter()
            .position(|d| d == name)
            .ok_or_else(|| QuarryError::UnknownArgument(name.clone()))?;
        if index < args.positional.len() || slots[index].is_some() {
            return Err(QuarryError::AmbiguousArgument(name.clone()));
        }
        slots[index] = Some(value.clone());
    }

    slots
        .into_iter()
        .zip(declared)
        .map(|(slot, name)| {
            slot.ok_or_else(|| {
                QuarryError::Programming(format!("argument {name} was not supplied"))
            })
        })
        .collect()
}

/// Build [`Args`] from positional values and/or `name = value` keywords.
///
/// ```
/// use quarry::args;
///
/// let positional = args![1, "one"];
/// let keywords = args![id = 1, value = "one"];
/// let mixed = args![1; value = "one"];
/// assert_eq!(positional.len(), 2);
/// assert_eq!(keywords.len(), 2);
/// assert_eq!(mixed.len(), 2);
/// ```
#[macro_export]
macro_rules! args {
    () => {
        $crate::Args::new()
    };
    ($($name:ident = $value:expr),+ $(,)?) => {
        $crate::Args::new()$(.kwarg(stringify!($name), $value))+
    };
    ($($value:expr),+ ; $($name:ident = $kwvalue:expr),+ $(,)?) => {
        $crate::Args::new()$(.arg($value))+$(.kwarg(stringify!($name), $kwvalue))+
    };
    ($($value:expr),+ $(,)?) => {
        $crate::Args::new()$(.arg($value))+
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declared(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_position_positional_only() {
        let values = position(&declared(&["a", "b"]), &args![1, 2]).unwrap();
        assert_eq!(values, vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn test_position_keywords_follow_declaration_order() {
        let values = position(&declared(&["a", "b", "c"]), &args![c = 3, a = 1, b = 2]).unwrap();
        assert_eq!(values, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    }

    #[test]
    fn test_position_mixed() {
        let values = position(&declared(&["id", "value"]), &args![7; value = "x"]).unwrap();
        assert_eq!(values, vec![Value::Int(7), Value::from("x")]);
    }

    #[test]
    fn test_position_counts() {
        let names = declared(&["a", "b"]);
        assert!(matches!(
            position(&names, &args![1]),
            Err(QuarryError::InsufficientArguments { expected: 2, got: 1 })
        ));
        assert!(matches!(
            position(&names, &args![1, 2, 3]),
            Err(QuarryError::TooManyArguments { expected: 2, got: 3 })
        ));
        assert!(position(&[], &Args::new()).unwrap().is_empty());
    }

    #[test]
    fn test_position_count_checked_before_names() {
        let err = position(&declared(&["a", "b"]), &args![nope = 1]).unwrap_err();
        assert!(err.is_argument_count());
    }

    #[test]
    fn test_position_unknown_keyword() {
        let err = position(&declared(&["a", "b"]), &args![1; nope = 2]).unwrap_err();
        assert!(matches!(err, QuarryError::UnknownArgument(name) if name == "nope"));
    }

    #[test]
    fn test_position_ambiguous_keyword() {
        let err = position(&declared(&["a", "b"]), &args![1; a = 2]).unwrap_err();
        assert!(matches!(err, QuarryError::AmbiguousArgument(name) if name == "a"));
    }

    #[test]
    fn test_kwarg_replaces_same_name() {
        let a = Args::new().kwarg("id", 1).kwarg("id", 2);
        assert_eq!(a.len(), 1);
        assert_eq!(a.keyword("id"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_options_do_not_count_as_arguments() {
        let a = Args::from_values([1, 2]).columns(["id"]).direct(true);
        assert_eq!(a.len(), 2);
        assert_eq!(a.options().columns.as_deref(), Some(&["id".to_string()][..]));
        assert_eq!(a.options().direct, Some(true));
    }
}
