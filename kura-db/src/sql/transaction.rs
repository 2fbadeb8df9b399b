use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kura_filter::{compile, Filter};
use kura_schema::{LockPolicy, Manager, Schema};
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::{Row, Sqlite, SqliteConnection};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::handler::{
    arg_from_value, bind_all, decode_loose, decode_state, encode, quote, Select, SqlArg, CONFIG_VERSION, STATE,
    STATE_ERROR, STATE_MONITORING, STATE_VERSION,
};
use crate::{DbError, IsolationLevel, Paginator, Resource, ResourceState, Transaction, ViewOptions};

const NO_LIMIT: &str = "9223372036854775807";

fn map_sql_err(err: sqlx::Error) -> DbError {
    if let sqlx::Error::Database(db) = &err {
        let msg = db.message();
        if msg.contains("FOREIGN KEY constraint failed") {
            return DbError::ForeignKey(msg.to_string());
        }
        if msg.contains("UNIQUE constraint failed") {
            return DbError::Duplicate(msg.to_string());
        }
    }
    DbError::Sql(err)
}

/// One connection held for the lifetime of a transaction. Serializable
/// transactions take the write lock up front with `BEGIN IMMEDIATE`.
pub struct SqlTransaction {
    conn: Mutex<Option<PoolConnection<Sqlite>>>,
    manager: Arc<Manager>,
    level: AtomicU8,
    closed: AtomicBool,
}

fn live<'a>(guard: &'a mut MutexGuard<'_, Option<PoolConnection<Sqlite>>>) -> Result<&'a mut SqliteConnection, DbError> {
    match &mut **guard {
        Some(conn) => Ok(&mut **conn),
        None => Err(DbError::Closed),
    }
}

impl SqlTransaction {
    pub(crate) async fn begin(
        mut conn: PoolConnection<Sqlite>,
        manager: Arc<Manager>,
        level: IsolationLevel,
    ) -> Result<Self, DbError> {
        let begin = if level == IsolationLevel::Serializable {
            "BEGIN IMMEDIATE"
        } else {
            "BEGIN"
        };
        sqlx::query(begin).execute(&mut *conn).await.map_err(map_sql_err)?;
        debug!(%level, "transaction started");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            manager,
            level: AtomicU8::new(level.code()),
            closed: AtomicBool::new(false),
        })
    }

    async fn execute(&self, sql: &str, args: Vec<SqlArg>) -> Result<u64, DbError> {
        debug!(%sql, "exec");
        let mut guard = self.conn.lock().await;
        let conn = live(&mut guard)?;
        let done = bind_all(sqlx::query(sql), args)
            .execute(conn)
            .await
            .map_err(map_sql_err)?;
        Ok(done.rows_affected())
    }

    async fn finish(&self, statement: &str) -> Result<(), DbError> {
        let mut guard = self.conn.lock().await;
        let Some(mut conn) = guard.take() else {
            return Ok(());
        };
        self.closed.store(true, Ordering::SeqCst);
        let result = sqlx::query(statement).execute(&mut *conn).await;
        if let Err(err) = result {
            if statement == "COMMIT" {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            }
            return Err(map_sql_err(err));
        }
        Ok(())
    }

    fn assignments(resource: &Resource) -> Result<(Vec<String>, Vec<SqlArg>), DbError> {
        let mut sets = Vec::new();
        let mut args = Vec::new();
        for p in &resource.schema().properties {
            if p.id == "id" {
                continue;
            }
            if let Some(v) = resource.get(&p.id) {
                sets.push(format!("{} = ?", quote(&p.id)));
                args.push(encode(p, v)?);
            }
        }
        Ok((sets, args))
    }

    async fn write(&self, resource: &Resource, mut sets: Vec<String>, mut args: Vec<SqlArg>) -> Result<(), DbError> {
        if sets.is_empty() {
            return Ok(());
        }
        let table = resource.schema().table_name();
        args.push(SqlArg::Text(resource.id().to_string()));
        let sql = format!("UPDATE {} SET {} WHERE {} = ?", quote(table), sets.join(", "), quote("id"));
        if self.execute(&sql, args).await? == 0 {
            return Err(DbError::NotFound(format!("{table}/{}", resource.id())));
        }
        Ok(())
    }
}

impl Drop for SqlTransaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.get_mut().take() {
            warn!("transaction dropped while open, discarding connection");
            // closing the raw connection rolls back
            drop(conn.detach());
        }
    }
}

#[async_trait]
impl Transaction for SqlTransaction {
    async fn create(&self, resource: &Resource) -> Result<(), DbError> {
        let schema = resource.schema();
        let mut cols = Vec::new();
        let mut args = Vec::new();
        for p in &schema.properties {
            if let Some(v) = resource.get(&p.id) {
                cols.push(quote(&p.id));
                args.push(encode(p, v)?);
            }
        }
        let marks = vec!["?"; cols.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({marks})",
            quote(schema.table_name()),
            cols.join(", ")
        );
        self.execute(&sql, args).await.map(|_| ())
    }

    async fn update(&self, resource: &Resource) -> Result<(), DbError> {
        let (mut sets, args) = Self::assignments(resource)?;
        if resource.schema().state_versioning() {
            sets.push(format!("{0} = {0} + 1", quote(CONFIG_VERSION)));
        }
        self.write(resource, sets, args).await
    }

    async fn state_update(&self, resource: &Resource, state: Option<&ResourceState>) -> Result<(), DbError> {
        let (mut sets, mut args) = Self::assignments(resource)?;
        if let Some(state) = state {
            if !resource.schema().state_versioning() {
                return Err(DbError::Unsupported("state update on a schema without state versioning"));
            }
            for (col, arg) in [
                (STATE_VERSION, SqlArg::Int(state.state_version)),
                (STATE_ERROR, SqlArg::Text(state.error.clone())),
                (STATE, SqlArg::Text(state.state.clone())),
                (STATE_MONITORING, SqlArg::Text(state.monitoring.clone())),
            ] {
                sets.push(format!("{} = ?", quote(col)));
                args.push(arg);
            }
        }
        self.write(resource, sets, args).await
    }

    async fn delete(&self, schema: &Schema, id: &str) -> Result<(), DbError> {
        let sql = format!("DELETE FROM {} WHERE {} = ?", quote(schema.table_name()), quote("id"));
        if self.execute(&sql, vec![SqlArg::Text(id.to_string())]).await? == 0 {
            return Err(DbError::NotFound(format!("{}/{id}", schema.table_name())));
        }
        Ok(())
    }

    async fn list(
        &self,
        schema: &Arc<Schema>,
        filter: &Filter,
        view: Option<&ViewOptions>,
        paginator: Option<&Paginator>,
    ) -> Result<(Vec<Resource>, u64), DbError> {
        let default_view = ViewOptions::default();
        let view = view.unwrap_or(&default_view);
        let select = Select::new(schema, &self.manager, view.join);
        let predicate = compile(filter, &select)?;
        let filter_args: Vec<SqlArg> = predicate.args.iter().map(arg_from_value).collect();
        let where_clause = if filter.is_all() {
            String::new()
        } else {
            format!(" WHERE {}", predicate.sql)
        };

        let mut sql = format!("{}{where_clause}", select.select_sql());
        let mut args = filter_args.clone();
        if let Some(pg) = paginator {
            sql.push_str(&format!(" ORDER BY {} {}", select.column_expr(&pg.key), pg.order.as_sql()));
            if pg.limit > 0 {
                sql.push_str(" LIMIT ?");
                args.push(SqlArg::Int(pg.limit.min(i64::MAX as u64) as i64));
            } else if pg.offset > 0 {
                sql.push_str(&format!(" LIMIT {NO_LIMIT}"));
            }
            if pg.offset > 0 {
                sql.push_str(" OFFSET ?");
                args.push(SqlArg::Int(pg.offset.min(i64::MAX as u64) as i64));
            }
        }
        debug!(%sql, schema = %schema.id, "list");

        let mut guard = self.conn.lock().await;
        let conn = live(&mut guard)?;
        let rows = bind_all(sqlx::query(&sql), args)
            .fetch_all(&mut *conn)
            .await
            .map_err(map_sql_err)?;
        let mut resources = Vec::with_capacity(rows.len());
        for row in &rows {
            resources.push(Resource::new(Arc::clone(schema), view.project(select.decode(row)?)));
        }

        let total = match paginator {
            Some(pg) if pg.is_paginated() => {
                let count_sql = format!("{}{where_clause}", select.count_sql());
                let row = bind_all(sqlx::query(&count_sql), filter_args)
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(map_sql_err)?;
                row.try_get::<i64, _>(0)?.max(0) as u64
            }
            _ => resources.len() as u64,
        };
        Ok((resources, total))
    }

    async fn lock_list(
        &self,
        schema: &Arc<Schema>,
        filter: &Filter,
        view: Option<&ViewOptions>,
        paginator: Option<&Paginator>,
        lock: LockPolicy,
    ) -> Result<(Vec<Resource>, u64), DbError> {
        // SQLite locks the whole database; BEGIN IMMEDIATE already holds it
        debug!(schema = %schema.id, ?lock, level = %self.isolation_level(), "lock list");
        self.list(schema, filter, view, paginator).await
    }

    async fn state_fetch(&self, schema: &Schema, filter: &Filter) -> Result<ResourceState, DbError> {
        if !schema.state_versioning() {
            return Err(DbError::Unsupported("state fetch on a schema without state versioning"));
        }
        let select = Select::new(schema, &self.manager, false);
        let predicate = compile(filter, &select)?;
        let cols = [CONFIG_VERSION, STATE_VERSION, STATE_ERROR, STATE, STATE_MONITORING]
            .map(quote)
            .join(", ");
        let mut sql = format!("SELECT {cols} FROM {}", quote(schema.table_name()));
        if !filter.is_all() {
            sql.push_str(&format!(" WHERE {}", predicate.sql));
        }
        sql.push_str(" LIMIT 1");
        let args = predicate.args.iter().map(arg_from_value).collect();

        let mut guard = self.conn.lock().await;
        let conn = live(&mut guard)?;
        let row = bind_all(sqlx::query(&sql), args)
            .fetch_optional(conn)
            .await
            .map_err(map_sql_err)?
            .ok_or_else(|| DbError::NotFound(schema.id.clone()))?;
        decode_state(&row)
    }

    async fn query(&self, schema: &Arc<Schema>, sql: &str, args: &[Value]) -> Result<Vec<Resource>, DbError> {
        debug!(%sql, "raw query");
        let mut guard = self.conn.lock().await;
        let conn = live(&mut guard)?;
        let rows = bind_all(sqlx::query(sql), args.iter().map(arg_from_value).collect())
            .fetch_all(conn)
            .await
            .map_err(map_sql_err)?;
        rows.iter()
            .map(|row| Ok(Resource::new(Arc::clone(schema), decode_loose(row, schema)?)))
            .collect()
    }

    async fn set_isolation_level(&self, level: IsolationLevel) -> Result<(), DbError> {
        // SQLite transactions are always serializable; the level is kept for callers
        self.level.store(level.code(), Ordering::SeqCst);
        Ok(())
    }

    fn isolation_level(&self) -> IsolationLevel {
        IsolationLevel::from_code(self.level.load(Ordering::SeqCst))
    }

    async fn commit(&self) -> Result<(), DbError> {
        if self.closed() {
            return Err(DbError::Closed);
        }
        self.finish("COMMIT").await
    }

    async fn close(&self) -> Result<(), DbError> {
        self.finish("ROLLBACK").await
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
