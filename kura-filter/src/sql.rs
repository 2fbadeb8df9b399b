use serde_json::Value;

use crate::{parse_bool, Condition, Filter, FilterError, FilterValue, Op};

/// A column as it appears in a compiled predicate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    /// Quoted, possibly table-qualified, column expression.
    pub expr: String,
    pub boolean: bool,
}

/// Maps filter properties onto columns of the statement being built.
pub trait ColumnResolver {
    fn column(&self, property: &str) -> Option<Column>;

    /// Literal used in `LIKE … ESCAPE <literal>`.
    fn escape_literal(&self) -> &str {
        r"'\'"
    }
}

/// Predicate text with `?` placeholders and the values to bind, in order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SqlPredicate {
    pub sql: String,
    pub args: Vec<Value>,
}

const TRUE_SQL: &str = "(1=1)";
const FALSE_SQL: &str = "(1=0)";

pub fn compile(filter: &Filter, resolver: &dyn ColumnResolver) -> Result<SqlPredicate, FilterError> {
    let mut out = SqlPredicate::default();
    out.sql = compile_into(filter, resolver, &mut out.args)?;
    Ok(out)
}

fn compile_into(
    filter: &Filter,
    resolver: &dyn ColumnResolver,
    args: &mut Vec<Value>,
) -> Result<String, FilterError> {
    match filter {
        Filter::Bool(true) => Ok(TRUE_SQL.into()),
        Filter::Bool(false) => Ok(FALSE_SQL.into()),
        Filter::And(items) if items.is_empty() => Ok(TRUE_SQL.into()),
        Filter::Or(items) if items.is_empty() => Ok(FALSE_SQL.into()),
        Filter::And(items) => join(items, " AND ", resolver, args),
        Filter::Or(items) => join(items, " OR ", resolver, args),
        Filter::Cond(cond) => compile_condition(cond, resolver, args),
    }
}

fn join(
    items: &[Filter],
    sep: &str,
    resolver: &dyn ColumnResolver,
    args: &mut Vec<Value>,
) -> Result<String, FilterError> {
    let parts = items
        .iter()
        .map(|f| compile_into(f, resolver, args))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(format!("({})", parts.join(sep)))
}

fn compile_condition(
    cond: &Condition,
    resolver: &dyn ColumnResolver,
    args: &mut Vec<Value>,
) -> Result<String, FilterError> {
    let column = resolver
        .column(&cond.property)
        .ok_or_else(|| FilterError::UnknownProperty(cond.property.clone()))?;
    let col = &column.expr;
    match &cond.value {
        FilterValue::Scalar(Value::Null) => Ok(FALSE_SQL.into()),
        FilterValue::Scalar(v) => {
            args.push(coerce(&column, &cond.property, v)?);
            Ok(match cond.op {
                Op::Eq => format!("{col} = ?"),
                Op::Neq => format!("{col} != ?"),
            })
        }
        FilterValue::List(items) => {
            let items: Vec<&Value> = items.iter().filter(|v| !v.is_null()).collect();
            if items.is_empty() {
                return Ok(match cond.op {
                    Op::Eq => FALSE_SQL.into(),
                    Op::Neq => format!("({col} IS NOT NULL)"),
                });
            }
            for v in &items {
                args.push(coerce(&column, &cond.property, v)?);
            }
            let marks = vec!["?"; items.len()].join(", ");
            Ok(match cond.op {
                Op::Eq => format!("{col} IN ({marks})"),
                Op::Neq => format!("{col} NOT IN ({marks})"),
            })
        }
        FilterValue::Substring(s) => {
            args.push(Value::String(s.pattern().to_string()));
            let escape = resolver.escape_literal();
            Ok(match cond.op {
                Op::Eq => format!("{col} LIKE ? ESCAPE {escape}"),
                Op::Neq => format!("{col} NOT LIKE ? ESCAPE {escape}"),
            })
        }
    }
}

fn coerce(column: &Column, property: &str, value: &Value) -> Result<Value, FilterError> {
    if !column.boolean {
        return Ok(value.clone());
    }
    match value {
        Value::String(s) => parse_bool(s).map(Value::Bool).ok_or_else(|| FilterError::NotBoolean {
            property: property.to_string(),
            value: s.clone(),
        }),
        other => Ok(other.clone()),
    }
}
