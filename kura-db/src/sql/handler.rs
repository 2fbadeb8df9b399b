//! Property-type encoders and statement builders for the SQL backend.

use std::sync::Arc;

use kura_filter::{parse_bool, Column, ColumnResolver};
use kura_schema::{Manager, Property, PropertyType, Schema};
use serde_json::{Map, Number, Value};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, ValueRef};

use crate::{DbError, ResourceState};

pub(crate) type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

pub(crate) const CONFIG_VERSION: &str = "config_version";
pub(crate) const STATE_VERSION: &str = "state_version";
pub(crate) const STATE_ERROR: &str = "state_error";
pub(crate) const STATE: &str = "state";
pub(crate) const STATE_MONITORING: &str = "state_monitoring";

/// Value ready to be bound to a placeholder.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum SqlArg {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

pub(crate) fn bind_all<'q>(mut query: SqliteQuery<'q>, args: Vec<SqlArg>) -> SqliteQuery<'q> {
    for arg in args {
        query = match arg {
            SqlArg::Null => query.bind(Option::<String>::None),
            SqlArg::Bool(b) => query.bind(b),
            SqlArg::Int(i) => query.bind(i),
            SqlArg::Float(f) => query.bind(f),
            SqlArg::Text(s) => query.bind(s),
        };
    }
    query
}

pub(crate) fn quote(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Untyped conversion used for filter and raw query arguments.
pub(crate) fn arg_from_value(value: &Value) -> SqlArg {
    match value {
        Value::Null => SqlArg::Null,
        Value::Bool(b) => SqlArg::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlArg::Int(i),
            None => SqlArg::Float(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlArg::Text(s.clone()),
        composite => SqlArg::Text(composite.to_string()),
    }
}

pub(crate) fn encode(property: &Property, value: &Value) -> Result<SqlArg, DbError> {
    if value.is_null() {
        return Ok(SqlArg::Null);
    }
    let invalid = || DbError::Other(format!("invalid {} value for {}: {value}", property.kind.as_str(), property.id));
    Ok(match property.kind {
        PropertyType::Boolean => match value {
            Value::Bool(b) => SqlArg::Bool(*b),
            Value::String(s) => SqlArg::Bool(parse_bool(s).ok_or_else(invalid)?),
            Value::Number(n) => SqlArg::Bool(n.as_f64().unwrap_or_default() != 0.0),
            _ => return Err(invalid()),
        },
        PropertyType::Integer => match value {
            Value::Number(n) => SqlArg::Int(n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).ok_or_else(invalid)?),
            Value::String(s) => SqlArg::Int(s.trim().parse().map_err(|_| invalid())?),
            Value::Bool(b) => SqlArg::Int(i64::from(*b)),
            _ => return Err(invalid()),
        },
        PropertyType::Number => match value {
            Value::Number(_) => arg_from_value(value),
            Value::String(s) => SqlArg::Float(s.trim().parse().map_err(|_| invalid())?),
            _ => return Err(invalid()),
        },
        PropertyType::String => match value {
            Value::String(s) => SqlArg::Text(s.clone()),
            other => SqlArg::Text(other.to_string()),
        },
        PropertyType::Object | PropertyType::Array => SqlArg::Text(value.to_string()),
        PropertyType::Any => arg_from_value(value),
    })
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

/// Decodes a column, tolerating the storage class the driver reports.
pub(crate) fn decode(row: &SqliteRow, column: &str, kind: PropertyType) -> Result<Value, DbError> {
    if row.try_get_raw(column)?.is_null() {
        return Ok(Value::Null);
    }
    let text = || row.try_get::<String, _>(column);
    let value = match kind {
        PropertyType::Boolean => row
            .try_get::<bool, _>(column)
            .map(Value::Bool)
            .or_else(|_| row.try_get::<i64, _>(column).map(|i| Value::Bool(i != 0)))
            .or_else(|_| text().map(|s| Value::Bool(parse_bool(&s).unwrap_or(false))))?,
        PropertyType::Integer => row
            .try_get::<i64, _>(column)
            .map(Value::from)
            .or_else(|_| row.try_get::<f64, _>(column).map(|f| Value::from(f as i64)))
            .or_else(|_| text().map(|s| s.trim().parse::<i64>().map(Value::from).unwrap_or(Value::Null)))?,
        PropertyType::Number => row
            .try_get::<i64, _>(column)
            .map(Value::from)
            .or_else(|_| row.try_get::<f64, _>(column).map(float))
            .or_else(|_| text().map(|s| s.trim().parse::<f64>().map(float).unwrap_or(Value::Null)))?,
        PropertyType::String => text()
            .map(Value::String)
            .or_else(|_| row.try_get::<i64, _>(column).map(|i| Value::String(i.to_string())))
            .or_else(|_| row.try_get::<f64, _>(column).map(|f| Value::String(f.to_string())))?,
        PropertyType::Object | PropertyType::Array => {
            let raw = text()?;
            serde_json::from_str(&raw).unwrap_or(Value::String(raw))
        }
        PropertyType::Any => row
            .try_get::<i64, _>(column)
            .map(Value::from)
            .or_else(|_| row.try_get::<f64, _>(column).map(float))
            .or_else(|_| {
                text().map(|s| match s.trim_start().chars().next() {
                    Some('{') | Some('[') => serde_json::from_str(&s).unwrap_or(Value::String(s)),
                    _ => Value::String(s),
                })
            })?,
    };
    Ok(value)
}

pub(crate) fn decode_state(row: &SqliteRow) -> Result<ResourceState, DbError> {
    Ok(ResourceState {
        config_version: row.try_get(CONFIG_VERSION)?,
        state_version: row.try_get(STATE_VERSION)?,
        error: row.try_get(STATE_ERROR)?,
        state: row.try_get(STATE)?,
        monitoring: row.try_get(STATE_MONITORING)?,
    })
}

pub(crate) fn column_type(property: &Property) -> String {
    if let Some(sql) = &property.sql_type {
        return sql.replace("auto_increment", "autoincrement");
    }
    match property.kind {
        PropertyType::String if property.id == "id" || property.relation.is_some() || property.unique => {
            "varchar(255)".into()
        }
        PropertyType::Integer | PropertyType::Number => "numeric".into(),
        PropertyType::Boolean => "boolean".into(),
        _ => "text".into(),
    }
}

/// Constraint name: the last 64 characters of `fk_<table>_<column>`.
pub(crate) fn foreign_key_name(table: &str, column: &str) -> String {
    let name = format!("fk_{table}_{column}");
    let skip = name.chars().count().saturating_sub(64);
    name.chars().skip(skip).collect()
}

fn column_definition(property: &Property) -> String {
    let mut def = format!("{} {}", quote(&property.id), column_type(property));
    let overridden = property.sql_type.is_some();
    if property.id == "id" {
        if !overridden || !def.to_ascii_lowercase().contains("primary key") {
            def.push_str(" NOT NULL PRIMARY KEY");
        }
        return def;
    }
    if !property.nullable && !overridden {
        def.push_str(" NOT NULL");
    }
    if property.unique && !overridden {
        def.push_str(" UNIQUE");
    }
    def
}

/// `CREATE TABLE` followed by its index statements.
pub(crate) fn create_table_sql(schema: &Schema, manager: &Manager, cascade: bool) -> Result<Vec<String>, DbError> {
    let table = schema.table_name();
    let mut defs: Vec<String> = schema.properties.iter().map(column_definition).collect();
    if schema.state_versioning() {
        defs.push(format!("{} int NOT NULL DEFAULT 1", quote(CONFIG_VERSION)));
        defs.push(format!("{} int NOT NULL DEFAULT 0", quote(STATE_VERSION)));
        for col in [STATE_ERROR, STATE, STATE_MONITORING] {
            defs.push(format!("{} text NOT NULL DEFAULT ''", quote(col)));
        }
    }
    let parent_column = schema.parent_property_id();
    for property in &schema.properties {
        let Some(relation) = &property.relation else {
            continue;
        };
        let target = manager
            .schema(relation)
            .ok_or_else(|| DbError::Other(format!("relation target {relation} of {}.{} not registered", schema.id, property.id)))?;
        let is_parent = parent_column.as_deref() == Some(property.id.as_str());
        let on_delete = if cascade || property.on_delete_cascade || (is_parent && schema.on_parent_delete_cascade) {
            " ON DELETE CASCADE"
        } else {
            ""
        };
        defs.push(format!(
            "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {}({}){on_delete}",
            quote(&foreign_key_name(table, &property.id)),
            quote(&property.id),
            quote(target.table_name()),
            quote("id"),
        ));
    }
    let mut statements = vec![format!("CREATE TABLE {} ({})", quote(table), defs.join(", "))];
    statements.extend(index_sql(schema));
    Ok(statements)
}

pub(crate) fn index_sql(schema: &Schema) -> Vec<String> {
    let table = schema.table_name();
    schema
        .properties
        .iter()
        .filter(|p| p.indexed)
        .map(|p| {
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {}({})",
                quote(&format!("idx_{table}_{}", p.id)),
                quote(table),
                quote(&p.id)
            )
        })
        .collect()
}

/// `ALTER TABLE … ADD COLUMN` for properties missing from `existing`.
pub(crate) fn migrate_sql(schema: &Schema, existing: &[String]) -> Vec<String> {
    let table = schema.table_name();
    let mut out = Vec::new();
    for p in &schema.properties {
        if existing.iter().any(|c| *c == p.id) {
            continue;
        }
        let mut def = format!("{} {}", quote(&p.id), column_type(p));
        if let Some(default) = &p.default {
            if let Ok(literal) = literal(p, default) {
                def.push_str(&format!(" DEFAULT {literal}"));
            }
        }
        out.push(format!("ALTER TABLE {} ADD COLUMN {def}", quote(table)));
    }
    if schema.state_versioning() && !existing.iter().any(|c| c == CONFIG_VERSION) {
        out.push(format!("ALTER TABLE {} ADD COLUMN {} int NOT NULL DEFAULT 1", quote(table), quote(CONFIG_VERSION)));
        out.push(format!("ALTER TABLE {} ADD COLUMN {} int NOT NULL DEFAULT 0", quote(table), quote(STATE_VERSION)));
        for col in [STATE_ERROR, STATE, STATE_MONITORING] {
            out.push(format!("ALTER TABLE {} ADD COLUMN {} text NOT NULL DEFAULT ''", quote(table), quote(col)));
        }
    }
    out.extend(index_sql(schema));
    out
}

fn literal(property: &Property, value: &Value) -> Result<String, DbError> {
    Ok(match encode(property, value)? {
        SqlArg::Null => "NULL".into(),
        SqlArg::Bool(b) => i64::from(b).to_string(),
        SqlArg::Int(i) => i.to_string(),
        SqlArg::Float(f) => f.to_string(),
        SqlArg::Text(s) => format!("'{}'", s.replace('\'', "''")),
    })
}

/// Related table pulled in through `relation_property`.
#[derive(Clone, Debug)]
pub(crate) struct Join {
    pub property: String,
    pub relation_property: String,
    pub alias: String,
    pub target: Arc<Schema>,
}

/// Shape of a `SELECT` over one schema and its joined relations.
pub(crate) struct Select<'a> {
    pub schema: &'a Schema,
    pub joins: Vec<Join>,
}

impl<'a> Select<'a> {
    pub fn new(schema: &'a Schema, manager: &Manager, join: bool) -> Self {
        let mut joins = Vec::new();
        if join {
            for p in &schema.properties {
                let (Some(relation), Some(relation_property)) = (&p.relation, &p.relation_property) else {
                    continue;
                };
                if let Some(target) = manager.schema(relation) {
                    joins.push(Join {
                        property: p.id.clone(),
                        relation_property: relation_property.clone(),
                        alias: format!("{}__{}", schema.table_name(), relation_property),
                        target,
                    });
                }
            }
        }
        Self { schema, joins }
    }

    fn qualified(&self) -> bool {
        !self.joins.is_empty()
    }

    fn table(&self) -> &str {
        self.schema.table_name()
    }

    pub fn column_label(&self, column: &str) -> String {
        if self.qualified() {
            format!("{}__{column}", self.table())
        } else {
            column.to_string()
        }
    }

    pub fn column_expr(&self, column: &str) -> String {
        if self.qualified() {
            format!("{}.{}", quote(self.table()), quote(column))
        } else {
            quote(column)
        }
    }

    pub fn select_sql(&self) -> String {
        let mut cols: Vec<String> = self
            .schema
            .properties
            .iter()
            .map(|p| {
                if self.qualified() {
                    format!("{} AS {}", self.column_expr(&p.id), quote(&self.column_label(&p.id)))
                } else {
                    quote(&p.id)
                }
            })
            .collect();
        for j in &self.joins {
            for p in &j.target.properties {
                cols.push(format!(
                    "{}.{} AS {}",
                    quote(&j.alias),
                    quote(&p.id),
                    quote(&format!("{}__{}", j.alias, p.id))
                ));
            }
        }
        let mut sql = format!("SELECT {} FROM {}", cols.join(", "), quote(self.table()));
        for j in &self.joins {
            sql.push_str(&format!(
                " LEFT JOIN {} AS {} ON {}.{} = {}",
                quote(j.target.table_name()),
                quote(&j.alias),
                quote(&j.alias),
                quote("id"),
                self.column_expr(&j.property),
            ));
        }
        sql
    }

    pub fn count_sql(&self) -> String {
        let mut sql = format!("SELECT count({}) FROM {}", self.column_expr("id"), quote(self.table()));
        for j in &self.joins {
            sql.push_str(&format!(
                " LEFT JOIN {} AS {} ON {}.{} = {}",
                quote(j.target.table_name()),
                quote(&j.alias),
                quote(&j.alias),
                quote("id"),
                self.column_expr(&j.property),
            ));
        }
        sql
    }

    pub fn decode(&self, row: &SqliteRow) -> Result<Map<String, Value>, DbError> {
        let mut data = Map::new();
        for p in &self.schema.properties {
            data.insert(p.id.clone(), decode(row, &self.column_label(&p.id), p.kind)?);
        }
        for j in &self.joins {
            let mut related = Map::new();
            for p in &j.target.properties {
                related.insert(p.id.clone(), decode(row, &format!("{}__{}", j.alias, p.id), p.kind)?);
            }
            let value = if related.get("id").map_or(true, Value::is_null) {
                Value::Null
            } else {
                Value::Object(related)
            };
            data.insert(j.relation_property.clone(), value);
        }
        Ok(data)
    }
}

impl ColumnResolver for Select<'_> {
    fn column(&self, property: &str) -> Option<Column> {
        self.schema.property(property).map(|p| Column {
            expr: self.column_expr(&p.id),
            boolean: p.kind == PropertyType::Boolean,
        })
    }
}

/// Decodes whatever schema columns a raw query returned.
pub(crate) fn decode_loose(row: &SqliteRow, schema: &Schema) -> Result<Map<String, Value>, DbError> {
    use sqlx::Column as _;
    let mut data = Map::new();
    for col in row.columns() {
        if let Some(p) = schema.property(col.name()) {
            data.insert(p.id.clone(), decode(row, col.name(), p.kind)?);
        }
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn manager() -> Manager {
        let mut m = Manager::new();
        for raw in [
            json!({"id": "network", "plural": "networks", "metadata": {"state_versioning": true},
                   "schema": {"properties": {"name": {"type": "string", "indexed": true},
                                             "shared": {"type": "boolean", "default": false},
                                             "seq": {"type": "integer", "sql": "integer auto_increment"}}}}),
            json!({"id": "subnet", "plural": "subnets", "parent": "network", "on_parent_delete_cascade": true,
                   "schema": {"properties": {"network_id": {"type": "string", "relation": "network",
                                                            "relation_property": "network"}}}}),
        ] {
            m.register_schema(Schema::from_value(&raw).unwrap()).unwrap();
        }
        m
    }

    #[test]
    fn ddl_uses_column_types_and_state_columns() {
        let m = manager();
        let stmts = create_table_sql(&m.schema("network").unwrap(), &m, false).unwrap();
        let ddl = &stmts[0];
        assert!(ddl.starts_with("CREATE TABLE `networks`"));
        assert!(ddl.contains("`id` varchar(255) NOT NULL PRIMARY KEY"));
        assert!(ddl.contains("`name` text"));
        assert!(ddl.contains("`shared` boolean NOT NULL"));
        assert!(ddl.contains("`seq` integer autoincrement"));
        assert!(ddl.contains("`config_version` int NOT NULL DEFAULT 1"));
        assert!(ddl.contains("`state_monitoring` text NOT NULL DEFAULT ''"));
        assert!(stmts[1].contains("`idx_networks_name`"));
    }

    #[test]
    fn parent_cascade_and_fk_name() {
        let m = manager();
        let ddl = &create_table_sql(&m.schema("subnet").unwrap(), &m, false).unwrap()[0];
        assert!(ddl.contains(
            "CONSTRAINT `fk_subnets_network_id` FOREIGN KEY (`network_id`) REFERENCES `networks`(`id`) ON DELETE CASCADE"
        ));
        let long = foreign_key_name(&"t".repeat(70), "column");
        assert_eq!(long.chars().count(), 64);
        assert!(long.ends_with("_column"));
    }

    #[test]
    fn join_select_aliases_columns() {
        let m = manager();
        let subnet = m.schema("subnet").unwrap();
        let select = Select::new(&subnet, &m, true);
        let sql = select.select_sql();
        assert!(sql.contains("`subnets`.`network_id` AS `subnets__network_id`"));
        assert!(sql.contains("LEFT JOIN `networks` AS `subnets__network` ON `subnets__network`.`id` = `subnets`.`network_id`"));
        assert_eq!(select.column("network_id").unwrap().expr, "`subnets`.`network_id`");

        let bare = Select::new(&subnet, &m, false);
        assert_eq!(bare.column("network_id").unwrap().expr, "`network_id`");
    }

    #[test]
    fn encode_coerces_by_property_type() {
        let mut p = Property::new("flag", PropertyType::Boolean);
        assert_eq!(encode(&p, &json!("true")).unwrap(), SqlArg::Bool(true));
        assert!(encode(&p, &json!("nope")).is_err());
        p.kind = PropertyType::Object;
        assert_eq!(encode(&p, &json!({"a": 1})).unwrap(), SqlArg::Text("{\"a\":1}".into()));
        p.kind = PropertyType::Integer;
        assert_eq!(encode(&p, &json!("42")).unwrap(), SqlArg::Int(42));
        assert_eq!(encode(&p, &Value::Null).unwrap(), SqlArg::Null);
    }
}
