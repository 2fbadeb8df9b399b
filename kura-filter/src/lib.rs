//! List filters shared by the SQL backend, the file backend and policy
//! enforcement.
//!
//! A [`Filter`] is parsed once from its JSON wire shape and can then be
//! compiled into a SQL predicate ([`sql::compile`]) or evaluated against a
//! resource map ([`memory::matches`]). Both evaluators must agree for every
//! stored row.

use serde_json::{json, Map, Value};
use thiserror::Error;

pub mod memory;
pub mod sql;

pub use memory::matches;
pub use sql::{compile, Column, ColumnResolver, SqlPredicate};

pub const AND_KEY: &str = "__and__";
pub const OR_KEY: &str = "__or__";
pub const BOOL_KEY: &str = "__bool__";
pub const SUBSTRING_KEY: &str = "__substring__";

#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("invalid filter: {0}")]
    Invalid(String),
    #[error("unknown filter type: {0}")]
    UnknownType(String),
    #[error("unknown property in filter: {0}")]
    UnknownProperty(String),
    #[error("cannot use {value} as boolean for property {property}")]
    NotBoolean { property: String, value: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Eq,
    Neq,
}

impl Op {
    pub fn as_str(self) -> &'static str {
        match self {
            Op::Eq => "eq",
            Op::Neq => "neq",
        }
    }
}

/// Case-insensitive substring search carried as a pre-escaped LIKE pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Substring {
    term: String,
    pattern: String,
}

impl Substring {
    pub fn new(term: impl Into<String>) -> Self {
        let term = term.into();
        let pattern = format!("%{}%", escape_like(&term));
        Self { term, pattern }
    }

    pub fn term(&self) -> &str {
        &self.term
    }

    /// `%…%` pattern with `\`, `_` and `%` escaped by a backslash.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

pub fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '\\' | '_' | '%') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[derive(Clone, Debug, PartialEq)]
pub enum FilterValue {
    Scalar(Value),
    List(Vec<Value>),
    Substring(Substring),
}

impl From<Value> for FilterValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(items) => FilterValue::List(items),
            other => FilterValue::Scalar(other),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Condition {
    pub property: String,
    pub op: Op,
    pub value: FilterValue,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Bool(bool),
    Cond(Condition),
}

impl Default for Filter {
    fn default() -> Self {
        Filter::And(Vec::new())
    }
}

impl Filter {
    /// Matches every row.
    pub fn all() -> Self {
        Filter::And(Vec::new())
    }

    pub fn eq(property: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Filter::Cond(Condition {
            property: property.into(),
            op: Op::Eq,
            value: value.into(),
        })
    }

    pub fn neq(property: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Filter::Cond(Condition {
            property: property.into(),
            op: Op::Neq,
            value: value.into(),
        })
    }

    pub fn substring(property: impl Into<String>, term: impl Into<String>) -> Self {
        Filter::Cond(Condition {
            property: property.into(),
            op: Op::Eq,
            value: FilterValue::Substring(Substring::new(term)),
        })
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Filter::And(v) if v.is_empty()) || matches!(self, Filter::Bool(true))
    }

    /// Conjunction that drops match-all operands.
    pub fn and_with(self, other: Filter) -> Filter {
        match (self.is_all(), other.is_all()) {
            (true, _) => other,
            (_, true) => self,
            _ => match self {
                Filter::And(mut items) => {
                    items.push(other);
                    Filter::And(items)
                }
                lhs => Filter::And(vec![lhs, other]),
            },
        }
    }

    /// Parses the wire shape. `null` and `{}` match everything; keys other
    /// than the combinators are sugar for an `eq` condition.
    pub fn from_value(value: &Value) -> Result<Filter, FilterError> {
        match value {
            Value::Null => Ok(Filter::all()),
            Value::Object(obj) => parse_object(obj),
            Value::Array(items) => Ok(Filter::And(
                items
                    .iter()
                    .map(Filter::from_value)
                    .collect::<Result<_, _>>()?,
            )),
            other => Err(FilterError::Invalid(format!("expected object, got {other}"))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Filter::And(items) => json!({ AND_KEY: items.iter().map(Filter::to_value).collect::<Vec<_>>() }),
            Filter::Or(items) => json!({ OR_KEY: items.iter().map(Filter::to_value).collect::<Vec<_>>() }),
            Filter::Bool(b) => json!({ BOOL_KEY: b }),
            Filter::Cond(c) => {
                let value = match &c.value {
                    FilterValue::Scalar(v) => v.clone(),
                    FilterValue::List(items) => Value::Array(items.clone()),
                    FilterValue::Substring(s) => json!({ SUBSTRING_KEY: s.term() }),
                };
                json!({"property": c.property, "type": c.op.as_str(), "value": value})
            }
        }
    }

    /// Every property id referenced by a condition.
    pub fn properties(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_properties(&mut out);
        out
    }

    fn collect_properties<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Filter::And(items) | Filter::Or(items) => {
                for item in items {
                    item.collect_properties(out);
                }
            }
            Filter::Bool(_) => {}
            Filter::Cond(c) => out.push(&c.property),
        }
    }

    pub fn validate_properties(&self, exists: impl Fn(&str) -> bool) -> Result<(), FilterError> {
        for property in self.properties() {
            if !exists(property) {
                return Err(FilterError::UnknownProperty(property.to_string()));
            }
        }
        Ok(())
    }
}

fn parse_object(obj: &Map<String, Value>) -> Result<Filter, FilterError> {
    if obj.contains_key("property") && obj.contains_key("type") {
        return parse_condition(obj);
    }
    let mut parts = Vec::with_capacity(obj.len());
    for (key, value) in obj {
        let part = match key.as_str() {
            AND_KEY => Filter::And(parse_list(key, value)?),
            OR_KEY => Filter::Or(parse_list(key, value)?),
            BOOL_KEY => Filter::Bool(
                value
                    .as_bool()
                    .ok_or_else(|| FilterError::Invalid(format!("{BOOL_KEY} expects a boolean")))?,
            ),
            property => Filter::eq(property, parse_value(value)?),
        };
        parts.push(part);
    }
    Ok(match parts.len() {
        1 => parts.remove(0),
        _ => Filter::And(parts),
    })
}

fn parse_list(key: &str, value: &Value) -> Result<Vec<Filter>, FilterError> {
    match value {
        Value::Array(items) => items.iter().map(Filter::from_value).collect(),
        Value::Null => Ok(Vec::new()),
        _ => Err(FilterError::Invalid(format!("{key} expects a list"))),
    }
}

fn parse_condition(obj: &Map<String, Value>) -> Result<Filter, FilterError> {
    let property = obj
        .get("property")
        .and_then(Value::as_str)
        .ok_or_else(|| FilterError::Invalid("property should be a string".into()))?;
    let op = match obj.get("type").and_then(Value::as_str) {
        Some("eq") => Op::Eq,
        Some("neq") => Op::Neq,
        Some(other) => return Err(FilterError::UnknownType(other.to_string())),
        None => return Err(FilterError::Invalid("type should be a string".into())),
    };
    let value = parse_value(obj.get("value").unwrap_or(&Value::Null))?;
    Ok(Filter::Cond(Condition {
        property: property.to_string(),
        op,
        value,
    }))
}

fn parse_value(value: &Value) -> Result<FilterValue, FilterError> {
    if let Value::Object(obj) = value {
        if let Some(term) = obj.get(SUBSTRING_KEY) {
            let term = term
                .as_str()
                .ok_or_else(|| FilterError::Invalid(format!("{SUBSTRING_KEY} expects a string")))?;
            return Ok(FilterValue::Substring(Substring::new(term)));
        }
    }
    Ok(FilterValue::from(value.clone()))
}

/// `strconv.ParseBool`-compatible parsing used when string inputs meet
/// boolean columns.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}
