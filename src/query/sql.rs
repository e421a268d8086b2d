//! SQL text for the descriptor kinds.
//!
//! Only placeholders are generated here; values always travel as driver
//! parameters.

use crate::error::{QuarryError, Result};

/// `$1,$2,...,$n`
pub(crate) fn placeholders(n: usize) -> String {
    (1..=n)
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn projection(columns: Option<&[String]>) -> String {
    match columns {
        Some(columns) if !columns.is_empty() => columns.join(", "),
        _ => "*".to_string(),
    }
}

/// `SELECT <cols> FROM <table> [WHERE a=$1 AND b=$2 ...]`, or the whole-row
/// cast `SELECT row(t.*)::<table> FROM <table> t ...` when `typed`.
pub(crate) fn select_from_table(
    table: &str,
    args: &[String],
    columns: Option<&[String]>,
    typed: bool,
) -> Result<String> {
    let has_columns = columns.is_some_and(|c| !c.is_empty());
    let mut sql = if typed {
        if has_columns {
            return Err(QuarryError::Programming(format!(
                "typed query on {table} projects whole rows and cannot take a column list"
            )));
        }
        format!("SELECT row(t.*)::{table} FROM {table} t")
    } else {
        format!("SELECT {} FROM {}", projection(columns), table)
    };
    if !args.is_empty() {
        let conditions: Vec<String> = args
            .iter()
            .enumerate()
            .map(|(i, name)| format!("{}=${}", name, i + 1))
            .collect();
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    Ok(sql)
}

/// `SELECT <cols> FROM <func>($1,...)`, or `SELECT <func>($1,...)` when
/// `direct`.
pub(crate) fn call_function(
    function: &str,
    arg_count: usize,
    columns: Option<&[String]>,
    direct: bool,
) -> Result<String> {
    let call = format!("{}({})", function, placeholders(arg_count));
    if direct {
        if columns.is_some_and(|c| !c.is_empty()) {
            return Err(QuarryError::Programming(format!(
                "direct call of {function} returns a single value and cannot take a column list"
            )));
        }
        return Ok(format!("SELECT {call}"));
    }
    Ok(format!("SELECT {} FROM {}", projection(columns), call))
}

/// Rewrite `%s` markers outside quoted literals and identifiers to `$1..$n`,
/// turning `%%` into `%`. Templates without a `%s` marker are returned as
/// they are.
pub(crate) fn rewrite_pyformat(template: &str) -> String {
    if !has_pyformat_marker(template) {
        return template.to_string();
    }
    let mut out = String::with_capacity(template.len() + 8);
    let mut quote: Option<char> = None;
    let mut next = 1;
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                out.push(c);
            }
            (Some(_), c) => out.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                out.push(c);
            }
            (None, '%') => match chars.peek() {
                Some('s') => {
                    chars.next();
                    out.push_str(&format!("${next}"));
                    next += 1;
                }
                Some('%') => {
                    chars.next();
                    out.push('%');
                }
                _ => out.push('%'),
            },
            (None, c) => out.push(c),
        }
    }
    out
}

fn has_pyformat_marker(template: &str) -> bool {
    let mut quote: Option<char> = None;
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '%') => match chars.peek() {
                Some('s') => return true,
                Some('%') => {
                    chars.next();
                }
                _ => {}
            },
            _ => {}
        }
    }
    false
}
