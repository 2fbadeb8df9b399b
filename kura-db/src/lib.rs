//! Storage backends for schema-typed resources.
//!
//! `Db` opens transactions; every read and write goes through a
//! `Transaction`. Two implementations exist: SQLite through sqlx and a
//! whole-document YAML/JSON file used for development.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kura_filter::{Filter, FilterError};
use kura_schema::{LockPolicy, Schema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub mod cached;
pub mod file;
pub mod metrics;
pub mod pagination;
pub mod sql;
pub mod util;

pub use cached::{CacheStats, CachedTransaction};
pub use file::FileDb;
pub use pagination::{Paginator, PaginationError, SortOrder};
pub use sql::SqlDb;
pub use util::{connect_db, copy_db_resources, init_db_with_schemas, within_tx, DbKind};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
    #[error("transaction already closed")]
    Closed,
    #[error("table {0} already exists")]
    TableExists(String),
    #[error("foreign key constraint failed: {0}")]
    ForeignKey(String),
    #[error("resource {0} already exists")]
    Duplicate(String),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("file backend error: {0}")]
    File(String),
    #[error("{0}")]
    Other(String),
}

impl DbError {
    /// Lock contention worth retrying the whole transaction for.
    pub fn is_deadlock(&self) -> bool {
        let msg = self.to_string();
        msg.contains("Deadlock found") || msg.contains("database is locked")
    }
}

/// A resource row bound to its schema.
#[derive(Clone, Debug)]
pub struct Resource {
    schema: Arc<Schema>,
    data: Map<String, Value>,
}

impl Resource {
    pub fn new(schema: Arc<Schema>, data: Map<String, Value>) -> Self {
        Self { schema, data }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn id(&self) -> &str {
        self.data.get("id").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.data
    }

    pub fn into_data(self) -> Map<String, Value> {
        self.data
    }
}

/// Operational state kept alongside state-versioned resources.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    pub config_version: i64,
    pub state_version: i64,
    pub error: String,
    pub state: String,
    pub monitoring: String,
}

impl Default for ResourceState {
    fn default() -> Self {
        Self {
            config_version: 1,
            state_version: 0,
            error: String::new(),
            state: String::new(),
            monitoring: String::new(),
        }
    }
}

/// Projection and join options for reads.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ViewOptions {
    /// Restrict returned keys; `None` returns every property.
    pub fields: Option<Vec<String>>,
    pub details: bool,
    /// Nest rows referenced through `relation_property`.
    pub join: bool,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            fields: None,
            details: true,
            join: true,
        }
    }
}

impl ViewOptions {
    pub fn project(&self, mut data: Map<String, Value>) -> Map<String, Value> {
        if let Some(fields) = &self.fields {
            data.retain(|k, _| fields.iter().any(|f| f == k));
        }
        data
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    #[default]
    Serializable,
}

impl IsolationLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().replace('_', " ").as_str() {
            "READ UNCOMMITTED" => Some(Self::ReadUncommitted),
            "READ COMMITTED" => Some(Self::ReadCommitted),
            "REPEATABLE READ" => Some(Self::RepeatableRead),
            "SERIALIZABLE" => Some(Self::Serializable),
            _ => None,
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }

    pub(crate) fn code(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_code(code: u8) -> Self {
        match code {
            0 => Self::ReadUncommitted,
            1 => Self::ReadCommitted,
            2 => Self::RepeatableRead,
            _ => Self::Serializable,
        }
    }

    /// Level a pipeline action runs at unless the schema overrides it.
    pub fn for_action(schema: &Schema, action: &str) -> Self {
        schema
            .isolation_level_for(action)
            .and_then(Self::parse)
            .unwrap_or(if action == "read" {
                Self::RepeatableRead
            } else {
                Self::Serializable
            })
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation_level: IsolationLevel,
}

impl TxOptions {
    pub fn new(isolation_level: IsolationLevel) -> Self {
        Self { isolation_level }
    }
}

pub type TxHandle = Arc<dyn Transaction>;

#[async_trait]
pub trait Db: Send + Sync {
    async fn begin(&self) -> Result<TxHandle, DbError> {
        self.begin_tx(&TxOptions::default()).await
    }

    async fn begin_tx(&self, options: &TxOptions) -> Result<TxHandle, DbError>;

    async fn register_table(&self, schema: &Schema, cascade: bool, migrate: bool) -> Result<(), DbError>;

    async fn drop_table(&self, schema: &Schema) -> Result<(), DbError>;

    async fn close(&self) -> Result<(), DbError>;
}

#[async_trait]
pub trait Transaction: Send + Sync {
    async fn create(&self, resource: &Resource) -> Result<(), DbError>;

    /// Writes the resource; state-versioned rows get `config_version + 1`.
    async fn update(&self, resource: &Resource) -> Result<(), DbError>;

    /// Writes the resource without touching `config_version`, plus the
    /// state columns when `state` is given.
    async fn state_update(&self, resource: &Resource, state: Option<&ResourceState>) -> Result<(), DbError>;

    async fn delete(&self, schema: &Schema, id: &str) -> Result<(), DbError>;

    async fn list(
        &self,
        schema: &Arc<Schema>,
        filter: &Filter,
        view: Option<&ViewOptions>,
        paginator: Option<&Paginator>,
    ) -> Result<(Vec<Resource>, u64), DbError>;

    async fn lock_list(
        &self,
        schema: &Arc<Schema>,
        filter: &Filter,
        view: Option<&ViewOptions>,
        paginator: Option<&Paginator>,
        lock: LockPolicy,
    ) -> Result<(Vec<Resource>, u64), DbError>;

    async fn fetch(&self, schema: &Arc<Schema>, filter: &Filter, view: Option<&ViewOptions>) -> Result<Resource, DbError> {
        let (mut rows, _) = self.list(schema, filter, view, None).await?;
        if rows.is_empty() {
            return Err(DbError::NotFound(schema.id.clone()));
        }
        Ok(rows.swap_remove(0))
    }

    async fn lock_fetch(
        &self,
        schema: &Arc<Schema>,
        filter: &Filter,
        lock: LockPolicy,
        view: Option<&ViewOptions>,
    ) -> Result<Resource, DbError> {
        let (mut rows, _) = self.lock_list(schema, filter, view, None, lock).await?;
        if rows.is_empty() {
            return Err(DbError::NotFound(schema.id.clone()));
        }
        Ok(rows.swap_remove(0))
    }

    async fn state_fetch(&self, schema: &Schema, filter: &Filter) -> Result<ResourceState, DbError>;

    /// Runs raw SQL and decodes rows against `schema`.
    async fn query(&self, schema: &Arc<Schema>, sql: &str, args: &[Value]) -> Result<Vec<Resource>, DbError>;

    async fn set_isolation_level(&self, level: IsolationLevel) -> Result<(), DbError>;

    fn isolation_level(&self) -> IsolationLevel;

    async fn commit(&self) -> Result<(), DbError>;

    /// Rolls back unless committed. Closing twice is a no-op.
    async fn close(&self) -> Result<(), DbError>;

    fn closed(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn schema(raw: Value) -> Schema {
        Schema::from_value(&raw).unwrap()
    }

    #[test]
    fn isolation_defaults_per_action() {
        let plain = schema(json!({"id": "a", "plural": "as", "schema": {"properties": {}}}));
        assert_eq!(IsolationLevel::for_action(&plain, "read"), IsolationLevel::RepeatableRead);
        assert_eq!(IsolationLevel::for_action(&plain, "create"), IsolationLevel::Serializable);
        let tuned = schema(json!({"id": "a", "plural": "as", "isolation_level": {"read": "read committed"},
                                  "schema": {"properties": {}}}));
        assert_eq!(IsolationLevel::for_action(&tuned, "read"), IsolationLevel::ReadCommitted);
    }

    #[test]
    fn deadlock_detection_reads_message() {
        assert!(DbError::Other("database is locked".into()).is_deadlock());
        assert!(!DbError::NotFound("x".into()).is_deadlock());
    }
}
