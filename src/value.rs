//! Dynamic column values.
//!
//! Every column the driver hands back is decoded into a [`Value`], whatever
//! its PostgreSQL type: scalars, arrays (recursively), and composite types as
//! an ordered list of named attributes. Composites whose type name has been
//! registered against a model are turned into [`Record`]s by the result
//! materializer, so a `Value` can also carry a record.
//!
//! `Value` implements both `FromSql` and `ToSql`, so the same type is used for
//! parameters and results. Parameters are converted to whatever type the
//! server inferred for the placeholder: an `Int` bound to an `int4` slot is
//! sent as `i32`, a `Text` bound to a `uuid` slot is parsed, and records and
//! composites are encoded field by field into the target composite type.

use std::error::Error as StdError;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres_types::{to_sql_checked, FromSql, IsNull, Kind, ToSql, Type};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::QuarryError;
use crate::model::Record;

type BoxError = Box<dyn StdError + Sync + Send>;

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    /// All integer types (`int2`, `int4`, `int8`, `oid`)
    Int(i64),
    /// `float4` and `float8`
    Float(f64),
    Numeric(Decimal),
    /// Text-like types and enum labels
    Text(String),
    Bytes(Vec<u8>),
    /// `json` and `jsonb`
    Json(serde_json::Value),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Array(Vec<Value>),
    /// A composite value whose type has no registered model
    Composite(Composite),
    /// A composite value materialized into a record
    Record(Box<Record>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Numeric(_) => "numeric",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Json(_) => "json",
            Value::Uuid(_) => "uuid",
            Value::Date(_) => "date",
            Value::Time(_) => "time",
            Value::Timestamp(_) => "timestamp",
            Value::TimestampTz(_) => "timestamptz",
            Value::Array(_) => "array",
            Value::Composite(_) => "composite",
            Value::Record(_) => "record",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_composite(&self) -> Option<&Composite> {
        match self {
            Value::Composite(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_record_mut(&mut self) -> Option<&mut Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_record(self) -> Option<Record> {
        match self {
            Value::Record(r) => Some(*r),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Numeric(d) => write!(f, "{d}"),
            Value::Text(s) => f.write_str(s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Json(j) => write!(f, "{j}"),
            Value::Uuid(u) => write!(f, "{u}"),
            Value::Date(d) => write!(f, "{d}"),
            Value::Time(t) => write!(f, "{t}"),
            Value::Timestamp(ts) => write!(f, "{ts}"),
            Value::TimestampTz(ts) => write!(f, "{ts}"),
            Value::Array(items) => {
                f.write_str("{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("}")
            }
            Value::Composite(c) => write!(f, "{c}"),
            Value::Record(r) => write!(f, "{}", r.model().name()),
        }
    }
}

/// A composite-type value: its qualified type name and named attributes in
/// declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct Composite {
    type_name: String,
    fields: Vec<(String, Value)>,
}

impl Composite {
    /// `type_name` is the schema-qualified name, e.g. `public.test_table`.
    pub fn new(type_name: impl Into<String>, fields: Vec<(String, Value)>) -> Self {
        Self {
            type_name: type_name.into(),
            fields,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    pub fn into_fields(self) -> Vec<(String, Value)> {
        self.fields
    }

    pub(crate) fn map_fields(self, mut f: impl FnMut(Value) -> Value) -> Self {
        Self {
            type_name: self.type_name,
            fields: self
                .fields
                .into_iter()
                .map(|(name, value)| (name, f(value)))
                .collect(),
        }
    }
}

impl fmt::Display for Composite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.type_name)?;
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        f.write_str(")")
    }
}

macro_rules! impl_from {
    ($($ty:ty => |$v:ident| $conv:expr),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from($v: $ty) -> Self {
                    $conv
                }
            }
        )*
    };
}

impl_from! {
    bool => |v| Value::Bool(v),
    i16 => |v| Value::Int(v.into()),
    i32 => |v| Value::Int(v.into()),
    i64 => |v| Value::Int(v),
    u32 => |v| Value::Int(v.into()),
    f32 => |v| Value::Float(v.into()),
    f64 => |v| Value::Float(v),
    Decimal => |v| Value::Numeric(v),
    String => |v| Value::Text(v),
    &str => |v| Value::Text(v.to_string()),
    Vec<u8> => |v| Value::Bytes(v),
    serde_json::Value => |v| Value::Json(v),
    Uuid => |v| Value::Uuid(v),
    NaiveDate => |v| Value::Date(v),
    NaiveTime => |v| Value::Time(v),
    NaiveDateTime => |v| Value::Timestamp(v),
    DateTime<Utc> => |v| Value::TimestampTz(v),
    Vec<Value> => |v| Value::Array(v),
    Composite => |v| Value::Composite(v),
    Record => |v| Value::Record(Box::new(v)),
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

fn decode_error(expected: &str, value: &Value) -> QuarryError {
    QuarryError::Decode(format!(
        "cannot convert {} value to {}",
        value.type_name(),
        expected
    ))
}

impl TryFrom<Value> for i64 {
    type Error = QuarryError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_i64().ok_or_else(|| decode_error("i64", &value))
    }
}

impl TryFrom<Value> for i32 {
    type Error = QuarryError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value
            .as_i64()
            .and_then(|i| i32::try_from(i).ok())
            .ok_or_else(|| decode_error("i32", &value))
    }
}

impl TryFrom<Value> for f64 {
    type Error = QuarryError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_f64().ok_or_else(|| decode_error("f64", &value))
    }
}

impl TryFrom<Value> for bool {
    type Error = QuarryError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_bool().ok_or_else(|| decode_error("bool", &value))
    }
}

impl TryFrom<Value> for String {
    type Error = QuarryError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Text(s) => Ok(s),
            other => Err(decode_error("String", &other)),
        }
    }
}

impl TryFrom<Value> for Record {
    type Error = QuarryError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Record(r) => Ok(*r),
            other => Err(decode_error("record", &other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

impl<'a> FromSql<'a> for Value {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        decode(ty, raw)
    }

    fn from_sql_null(_ty: &Type) -> Result<Self, BoxError> {
        Ok(Value::Null)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn decode(ty: &Type, raw: &[u8]) -> Result<Value, BoxError> {
    match ty.kind() {
        Kind::Array(member) => decode_array(member, raw),
        Kind::Composite(fields) => {
            let mut buf = raw;
            let count = read_i32(&mut buf)?;
            let mut values = Vec::with_capacity(fields.len());
            for field in fields {
                let _oid = read_u32(&mut buf)?;
                let value = read_value(field.type_(), &mut buf)?;
                values.push((field.name().to_string(), value));
            }
            if usize::try_from(count)? != fields.len() {
                return Err(format!(
                    "composite {} has {} attributes on the wire, {} in its definition",
                    ty.name(),
                    count,
                    fields.len()
                )
                .into());
            }
            Ok(Value::Composite(Composite::new(
                qualified_name(ty),
                values,
            )))
        }
        Kind::Domain(inner) => decode(inner, raw),
        Kind::Enum(_) => Ok(Value::Text(std::str::from_utf8(raw)?.to_string())),
        _ if *ty == Type::RECORD => decode_anonymous_record(raw),
        _ => decode_simple(ty, raw),
    }
}

fn qualified_name(ty: &Type) -> String {
    format!("{}.{}", ty.schema(), ty.name())
}

fn decode_simple(ty: &Type, raw: &[u8]) -> Result<Value, BoxError> {
    let value = match *ty {
        Type::BOOL => Value::Bool(bool::from_sql(ty, raw)?),
        Type::INT2 => Value::Int(i16::from_sql(ty, raw)?.into()),
        Type::INT4 => Value::Int(i32::from_sql(ty, raw)?.into()),
        Type::INT8 => Value::Int(i64::from_sql(ty, raw)?),
        Type::OID => Value::Int(u32::from_sql(ty, raw)?.into()),
        Type::FLOAT4 => Value::Float(f32::from_sql(ty, raw)?.into()),
        Type::FLOAT8 => Value::Float(f64::from_sql(ty, raw)?),
        Type::NUMERIC => Value::Numeric(Decimal::from_sql(ty, raw)?),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            Value::Text(std::str::from_utf8(raw)?.to_string())
        }
        Type::BYTEA => Value::Bytes(raw.to_vec()),
        Type::JSON | Type::JSONB => Value::Json(serde_json::Value::from_sql(ty, raw)?),
        Type::UUID => Value::Uuid(Uuid::from_sql(ty, raw)?),
        Type::DATE => Value::Date(NaiveDate::from_sql(ty, raw)?),
        Type::TIME => Value::Time(NaiveTime::from_sql(ty, raw)?),
        Type::TIMESTAMP => Value::Timestamp(NaiveDateTime::from_sql(ty, raw)?),
        Type::TIMESTAMPTZ => Value::TimestampTz(DateTime::<Utc>::from_sql(ty, raw)?),
        Type::CHAR => Value::Text(char::from(i8::from_sql(ty, raw)? as u8).to_string()),
        Type::XML => Value::Text(std::str::from_utf8(raw)?.to_string()),
        Type::MONEY => Value::Numeric(Decimal::new(i64::from_sql(ty, raw)?, 2)),
        Type::INTERVAL => Value::Text(decode_interval(raw)?),
        Type::TIMETZ => Value::Text(decode_timetz(raw)?),
        Type::INET | Type::CIDR => Value::Text(decode_inet(raw, *ty == Type::CIDR)?),
        Type::BIT | Type::VARBIT => Value::Text(decode_bits(raw)?),
        // Ranges, geometric and extension types stay in their wire format.
        _ => Value::Bytes(raw.to_vec()),
    };
    Ok(value)
}

/// Rendered the way the server prints intervals by default, e.g.
/// `1 year 2 mons 3 days 04:05:06.5`.
fn decode_interval(raw: &[u8]) -> Result<String, BoxError> {
    let mut buf = raw;
    let micros = read_i64(&mut buf)?;
    let days = read_i32(&mut buf)?;
    let months = read_i32(&mut buf)?;

    let mut parts = Vec::new();
    let unit = |n: i64, singular: &str, plural: &str| {
        format!("{} {}", n, if n == 1 { singular } else { plural })
    };
    let (years, mons) = (i64::from(months / 12), i64::from(months % 12));
    if years != 0 {
        parts.push(unit(years, "year", "years"));
    }
    if mons != 0 {
        parts.push(unit(mons, "mon", "mons"));
    }
    if days != 0 {
        parts.push(unit(days.into(), "day", "days"));
    }
    if micros != 0 || parts.is_empty() {
        let sign = if micros < 0 { "-" } else { "" };
        parts.push(format!("{}{}", sign, clock(micros.unsigned_abs())));
    }
    Ok(parts.join(" "))
}

/// `HH:MM:SS` with a fractional part only when there is one.
fn clock(micros: u64) -> String {
    let secs = micros / 1_000_000;
    let frac = micros % 1_000_000;
    let mut out = format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60);
    if frac != 0 {
        let digits = format!("{:06}", frac);
        out.push('.');
        out.push_str(digits.trim_end_matches('0'));
    }
    out
}

/// Microseconds since midnight, then the zone offset in seconds west of UTC.
fn decode_timetz(raw: &[u8]) -> Result<String, BoxError> {
    let mut buf = raw;
    let micros = read_i64(&mut buf)?;
    let west = read_i32(&mut buf)?;
    let east = -i64::from(west);
    let sign = if east < 0 { '-' } else { '+' };
    let (hours, rest) = (east.abs() / 3600, east.abs() % 3600);
    let mut zone = format!("{}{:02}", sign, hours);
    if rest != 0 {
        zone.push_str(&format!(":{:02}", rest / 60));
    }
    Ok(format!("{}{}", clock(u64::try_from(micros)?), zone))
}

/// Family, netmask bits, cidr flag, address length, address bytes.
fn decode_inet(raw: &[u8], cidr: bool) -> Result<String, BoxError> {
    let [_family, bits, _is_cidr, len, addr @ ..] = raw else {
        return Err("unexpected end of inet data".into());
    };
    let ip = match (*len, addr) {
        (4, addr) if addr.len() == 4 => IpAddr::from([addr[0], addr[1], addr[2], addr[3]]),
        (16, addr) if addr.len() == 16 => {
            let octets: [u8; 16] = addr.try_into()?;
            IpAddr::from(octets)
        }
        _ => return Err(format!("invalid inet address length {}", len).into()),
    };
    let full = if ip.is_ipv4() { 32 } else { 128 };
    if cidr || *bits != full {
        Ok(format!("{}/{}", ip, bits))
    } else {
        Ok(ip.to_string())
    }
}

/// Bit count, then the bits packed high-order first.
fn decode_bits(raw: &[u8]) -> Result<String, BoxError> {
    let mut buf = raw;
    let count = usize::try_from(read_i32(&mut buf)?)?;
    if buf.len() * 8 < count {
        return Err("unexpected end of bit string data".into());
    }
    Ok((0..count)
        .map(|i| if buf[i / 8] & (0x80 >> (i % 8)) != 0 { '1' } else { '0' })
        .collect())
}

/// Binary array layout: ndim, has-null flag, element oid, then a
/// (length, lower bound) pair per dimension, then the elements.
/// Multi-dimensional arrays decode as nested arrays.
fn decode_array(member: &Type, raw: &[u8]) -> Result<Value, BoxError> {
    let mut buf = raw;
    let ndim = read_i32(&mut buf)?;
    let _has_null = read_i32(&mut buf)?;
    let _element_oid = read_u32(&mut buf)?;
    if ndim == 0 {
        return Ok(Value::Array(Vec::new()));
    }
    let mut dims = Vec::with_capacity(usize::try_from(ndim)?);
    for _ in 0..ndim {
        let len = read_i32(&mut buf)?;
        let _lower_bound = read_i32(&mut buf)?;
        dims.push(usize::try_from(len)?);
    }
    read_dimension(member, &dims, &mut buf)
}

fn read_dimension(member: &Type, dims: &[usize], buf: &mut &[u8]) -> Result<Value, BoxError> {
    let (len, rest) = match dims.split_first() {
        Some(split) => split,
        None => return read_value(member, buf),
    };
    let mut items = Vec::with_capacity(*len);
    for _ in 0..*len {
        items.push(read_dimension(member, rest, buf)?);
    }
    Ok(Value::Array(items))
}

/// Anonymous `record` values only carry field oids, so fields are named
/// `f1`, `f2`, ... and must be of built-in types.
fn decode_anonymous_record(raw: &[u8]) -> Result<Value, BoxError> {
    let mut buf = raw;
    let count = read_i32(&mut buf)?;
    let mut fields = Vec::with_capacity(usize::try_from(count)?);
    for i in 1..=count {
        let oid = read_u32(&mut buf)?;
        let ty = Type::from_oid(oid)
            .ok_or_else(|| format!("record field {} has non built-in type oid {}", i, oid))?;
        fields.push((format!("f{i}"), read_value(&ty, &mut buf)?));
    }
    Ok(Value::Composite(Composite::new("pg_catalog.record", fields)))
}

fn read_value(ty: &Type, buf: &mut &[u8]) -> Result<Value, BoxError> {
    let len = read_i32(buf)?;
    if len < 0 {
        return Ok(Value::Null);
    }
    let len = usize::try_from(len)?;
    if buf.len() < len {
        return Err("unexpected end of value data".into());
    }
    let (data, rest) = buf.split_at(len);
    *buf = rest;
    decode(ty, data)
}

fn read_i32(buf: &mut &[u8]) -> Result<i32, BoxError> {
    if buf.len() < 4 {
        return Err("unexpected end of value data".into());
    }
    let (head, rest) = buf.split_at(4);
    *buf = rest;
    Ok(i32::from_be_bytes(head.try_into()?))
}

fn read_i64(buf: &mut &[u8]) -> Result<i64, BoxError> {
    if buf.len() < 8 {
        return Err("unexpected end of value data".into());
    }
    let (head, rest) = buf.split_at(8);
    *buf = rest;
    Ok(i64::from_be_bytes(head.try_into()?))
}

fn read_u32(buf: &mut &[u8]) -> Result<u32, BoxError> {
    if buf.len() < 4 {
        return Err("unexpected end of value data".into());
    }
    let (head, rest) = buf.split_at(4);
    *buf = rest;
    Ok(u32::from_be_bytes(head.try_into()?))
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        if let Kind::Domain(inner) = ty.kind() {
            return self.to_sql(inner, out);
        }
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => b.to_sql(ty, out),
            Value::Int(i) => encode_int(*i, ty, out),
            Value::Float(x) => encode_float(*x, ty, out),
            Value::Numeric(d) => match *ty {
                Type::FLOAT8 | Type::FLOAT4 => {
                    let x = f64::from_str(&d.to_string())?;
                    encode_float(x, ty, out)
                }
                _ => d.to_sql(ty, out),
            },
            Value::Text(s) => encode_text(s, ty, out),
            Value::Bytes(b) => b.as_slice().to_sql(ty, out),
            Value::Json(j) => j.to_sql(ty, out),
            Value::Uuid(u) => u.to_sql(ty, out),
            Value::Date(d) => d.to_sql(ty, out),
            Value::Time(t) => t.to_sql(ty, out),
            Value::Timestamp(ts) => ts.to_sql(ty, out),
            Value::TimestampTz(ts) => ts.to_sql(ty, out),
            Value::Array(items) => match ty.kind() {
                Kind::Array(_) => items.to_sql(ty, out),
                _ => Err(format!("cannot bind an array to parameter of type {}", ty).into()),
            },
            Value::Composite(c) => encode_composite(ty, out, |name| c.get(name)),
            Value::Record(r) => encode_composite(ty, out, |name| r.peek(name)),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn is_text(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN
    )
}

fn encode_int(v: i64, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match *ty {
        Type::INT2 => i16::try_from(v)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(v)?.to_sql(ty, out),
        Type::OID => u32::try_from(v)?.to_sql(ty, out),
        Type::FLOAT4 => (v as f32).to_sql(ty, out),
        Type::FLOAT8 => (v as f64).to_sql(ty, out),
        Type::NUMERIC => Decimal::from(v).to_sql(ty, out),
        _ if is_text(ty) => v.to_string().as_str().to_sql(ty, out),
        _ => v.to_sql(ty, out),
    }
}

fn encode_float(v: f64, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match *ty {
        Type::FLOAT4 => (v as f32).to_sql(ty, out),
        Type::NUMERIC => Decimal::try_from(v)?.to_sql(ty, out),
        _ if is_text(ty) => v.to_string().as_str().to_sql(ty, out),
        _ => v.to_sql(ty, out),
    }
}

/// Text parameters are parsed into the type the server expects, so callers
/// can pass string keys for uuid, numeric or date columns.
fn encode_text(s: &str, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match *ty {
        Type::INT2 | Type::INT4 | Type::INT8 | Type::OID => encode_int(s.trim().parse()?, ty, out),
        Type::FLOAT4 | Type::FLOAT8 => encode_float(s.trim().parse()?, ty, out),
        Type::NUMERIC => Decimal::from_str(s.trim())?.to_sql(ty, out),
        Type::BOOL => match s.trim().to_ascii_lowercase().as_str() {
            "t" | "true" | "y" | "yes" | "on" | "1" => true.to_sql(ty, out),
            "f" | "false" | "n" | "no" | "off" | "0" => false.to_sql(ty, out),
            other => Err(format!("invalid boolean literal {:?}", other).into()),
        },
        Type::UUID => Uuid::parse_str(s.trim())?.to_sql(ty, out),
        Type::JSON | Type::JSONB => serde_json::from_str::<serde_json::Value>(s)?.to_sql(ty, out),
        Type::DATE => NaiveDate::from_str(s.trim())?.to_sql(ty, out),
        Type::TIME => NaiveTime::from_str(s.trim())?.to_sql(ty, out),
        Type::TIMESTAMP => NaiveDateTime::from_str(s.trim())?.to_sql(ty, out),
        Type::TIMESTAMPTZ => DateTime::<Utc>::from_str(s.trim())?.to_sql(ty, out),
        Type::BYTEA => s.as_bytes().to_sql(ty, out),
        _ => {
            out.put_slice(s.as_bytes());
            Ok(IsNull::No)
        }
    }
}

/// Binary composite layout: attribute count, then oid, length and data for
/// each attribute. Attributes are looked up by name; missing ones are NULL.
fn encode_composite<'v>(
    ty: &Type,
    out: &mut BytesMut,
    lookup: impl Fn(&str) -> Option<&'v Value>,
) -> Result<IsNull, BoxError> {
    let fields = match ty.kind() {
        Kind::Composite(fields) => fields,
        _ => {
            return Err(format!("cannot bind a composite to parameter of type {}", ty).into());
        }
    };
    out.put_i32(i32::try_from(fields.len())?);
    for field in fields {
        out.put_u32(field.type_().oid());
        let start = out.len();
        out.put_i32(0);
        let is_null = match lookup(field.name()) {
            Some(value) => value.to_sql(field.type_(), out)?,
            None => IsNull::Yes,
        };
        let len = match is_null {
            IsNull::Yes => {
                out.truncate(start + 4);
                -1
            }
            IsNull::No => i32::try_from(out.len() - start - 4)?,
        };
        out[start..start + 4].copy_from_slice(&len.to_be_bytes());
    }
    Ok(IsNull::No)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &Value, ty: &Type) -> BytesMut {
        let mut out = BytesMut::new();
        let is_null = value.to_sql(ty, &mut out).expect("encode");
        assert!(matches!(is_null, IsNull::No));
        out
    }

    #[test]
    fn test_from_impls() {
        assert_eq!(Value::from(7i32), Value::Int(7));
        assert_eq!(Value::from("one"), Value::Text("one".to_string()));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some(true)), Value::Bool(true));
        assert_eq!(
            Value::from(vec![Value::from(1i64), Value::Null]),
            Value::Array(vec![Value::Int(1), Value::Null])
        );
    }

    #[test]
    fn test_try_from_value() {
        assert_eq!(i64::try_from(Value::Int(3)).unwrap(), 3);
        assert_eq!(String::try_from(Value::from("x")).unwrap(), "x");
        assert!(matches!(
            i32::try_from(Value::Int(i64::MAX)),
            Err(QuarryError::Decode(_))
        ));
        assert!(bool::try_from(Value::Null).is_err());
    }

    #[test]
    fn test_decode_scalars() {
        let raw = 42i32.to_be_bytes();
        assert_eq!(decode(&Type::INT4, &raw).unwrap(), Value::Int(42));
        assert_eq!(
            decode(&Type::TEXT, b"hello").unwrap(),
            Value::Text("hello".to_string())
        );
        assert_eq!(decode(&Type::BOOL, &[1]).unwrap(), Value::Bool(true));
        assert_eq!(Value::from_sql_null(&Type::INT4).unwrap(), Value::Null);
    }

    #[test]
    fn test_decode_int_array_with_null() {
        let mut raw = BytesMut::new();
        raw.put_i32(1); // ndim
        raw.put_i32(1); // has null
        raw.put_u32(Type::INT4.oid());
        raw.put_i32(3); // length
        raw.put_i32(1); // lower bound
        raw.put_i32(4);
        raw.put_i32(1);
        raw.put_i32(-1);
        raw.put_i32(4);
        raw.put_i32(3);

        let value = decode(&Type::INT4_ARRAY, &raw).unwrap();
        assert_eq!(
            value,
            Value::Array(vec![Value::Int(1), Value::Null, Value::Int(3)])
        );
    }

    #[test]
    fn test_decode_empty_array() {
        let mut raw = BytesMut::new();
        raw.put_i32(0);
        raw.put_i32(0);
        raw.put_u32(Type::TEXT.oid());
        assert_eq!(
            decode(&Type::TEXT_ARRAY, &raw).unwrap(),
            Value::Array(Vec::new())
        );
    }

    #[test]
    fn test_decode_anonymous_record() {
        let mut raw = BytesMut::new();
        raw.put_i32(2);
        raw.put_u32(Type::INT4.oid());
        raw.put_i32(4);
        raw.put_i32(9);
        raw.put_u32(Type::TEXT.oid());
        raw.put_i32(-1);

        let value = decode(&Type::RECORD, &raw).unwrap();
        let composite = value.as_composite().unwrap();
        assert_eq!(composite.get("f1"), Some(&Value::Int(9)));
        assert_eq!(composite.get("f2"), Some(&Value::Null));
    }

    #[test]
    fn test_decode_interval() {
        let mut raw = BytesMut::new();
        raw.put_i64(4 * 3_600_000_000 + 5 * 60_000_000 + 6_500_000);
        raw.put_i32(3);
        raw.put_i32(14);
        assert_eq!(
            decode(&Type::INTERVAL, &raw).unwrap(),
            Value::from("1 year 2 mons 3 days 04:05:06.5")
        );

        let mut raw = BytesMut::new();
        raw.put_i64(-7_200_000_000);
        raw.put_i32(-1);
        raw.put_i32(0);
        assert_eq!(decode(&Type::INTERVAL, &raw).unwrap(), Value::from("-1 days -02:00:00"));

        let zero = [0u8; 16];
        assert_eq!(decode(&Type::INTERVAL, &zero).unwrap(), Value::from("00:00:00"));
    }

    #[test]
    fn test_decode_inet_and_cidr() {
        let host = [2u8, 32, 0, 4, 192, 168, 0, 1];
        assert_eq!(decode(&Type::INET, &host).unwrap(), Value::from("192.168.0.1"));

        let net = [2u8, 24, 1, 4, 10, 1, 2, 0];
        assert_eq!(decode(&Type::CIDR, &net).unwrap(), Value::from("10.1.2.0/24"));

        let mut v6 = vec![3u8, 128, 0, 16];
        v6.extend_from_slice(&[0; 15]);
        v6.push(1);
        assert_eq!(decode(&Type::INET, &v6).unwrap(), Value::from("::1"));

        assert!(decode(&Type::INET, &[2, 32, 0]).is_err());
    }

    #[test]
    fn test_decode_misc_scalars() {
        assert_eq!(decode(&Type::CHAR, b"r").unwrap(), Value::from("r"));
        assert_eq!(
            decode(&Type::MONEY, &1234i64.to_be_bytes()).unwrap(),
            Value::Numeric(Decimal::new(1234, 2))
        );

        let mut bits = BytesMut::new();
        bits.put_i32(5);
        bits.put_u8(0b1011_0000);
        assert_eq!(decode(&Type::VARBIT, &bits).unwrap(), Value::from("10110"));

        let mut timetz = BytesMut::new();
        timetz.put_i64(13 * 3_600_000_000 + 30 * 60_000_000);
        timetz.put_i32(-2 * 3600);
        assert_eq!(decode(&Type::TIMETZ, &timetz).unwrap(), Value::from("13:30:00+02"));
    }

    #[test]
    fn test_unknown_types_keep_wire_bytes() {
        let raw = [1u8, 2, 3];
        assert_eq!(
            decode(&Type::INT4_RANGE, &raw).unwrap(),
            Value::Bytes(raw.to_vec())
        );
        assert_eq!(decode(&Type::POINT, &raw).unwrap(), Value::Bytes(raw.to_vec()));
    }

    #[test]
    fn test_decode_truncated_input() {
        assert!(decode(&Type::INT4_ARRAY, &[0, 0]).is_err());
    }

    #[test]
    fn test_encode_int_follows_parameter_type() {
        assert_eq!(&encode(&Value::Int(5), &Type::INT4)[..], &5i32.to_be_bytes());
        assert_eq!(&encode(&Value::Int(5), &Type::INT2)[..], &5i16.to_be_bytes());
        assert_eq!(&encode(&Value::Int(5), &Type::INT8)[..], &5i64.to_be_bytes());
        assert_eq!(&encode(&Value::Int(5), &Type::TEXT)[..], b"5");

        let mut out = BytesMut::new();
        assert!(Value::Int(i64::MAX).to_sql(&Type::INT4, &mut out).is_err());
    }

    #[test]
    fn test_encode_text_is_parsed_for_typed_parameters() {
        assert_eq!(
            &encode(&Value::from("12"), &Type::INT4)[..],
            &12i32.to_be_bytes()
        );
        assert_eq!(&encode(&Value::from("two"), &Type::TEXT)[..], b"two");

        let mut out = BytesMut::new();
        assert!(Value::from("abc").to_sql(&Type::INT4, &mut out).is_err());
    }

    #[test]
    fn test_encode_null() {
        let mut out = BytesMut::new();
        let is_null = Value::Null.to_sql(&Type::INT4, &mut out).unwrap();
        assert!(matches!(is_null, IsNull::Yes));
        assert!(out.is_empty());
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Null.to_string(), "NULL");
        assert_eq!(
            Value::Array(vec![Value::Int(1), Value::from("a")]).to_string(),
            "{1,a}"
        );
        let composite = Composite::new(
            "public.test_table",
            vec![("id".into(), Value::Int(1)), ("value".into(), "one".into())],
        );
        assert_eq!(
            composite.to_string(),
            "public.test_table(id=1, value=one)"
        );
    }
}
