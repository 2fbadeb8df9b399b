//! SQLite backend built on sqlx.

mod handler;
mod transaction;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kura_schema::{Manager, Schema};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::{Db, DbError, TxHandle, TxOptions};
use handler::{create_table_sql, migrate_sql, quote};
pub use transaction::SqlTransaction;

pub const CONNECT_ATTEMPTS: u32 = 50;
pub const CONNECT_INTERVAL: Duration = Duration::from_secs(10);

pub struct SqlDb {
    pool: SqlitePool,
    manager: Arc<Manager>,
}

fn connect_options(connection: &str) -> Result<SqliteConnectOptions, DbError> {
    let options = if connection == ":memory:" {
        SqliteConnectOptions::from_str("sqlite::memory:")?
    } else if connection.starts_with("sqlite:") {
        SqliteConnectOptions::from_str(connection)?.journal_mode(SqliteJournalMode::Wal)
    } else {
        SqliteConnectOptions::new()
            .filename(connection)
            .journal_mode(SqliteJournalMode::Wal)
    };
    Ok(options
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5)))
}

impl SqlDb {
    pub async fn connect(manager: Arc<Manager>, connection: &str, max_open_conn: u32) -> Result<Self, DbError> {
        Self::connect_with_retry(manager, connection, max_open_conn, CONNECT_ATTEMPTS, CONNECT_INTERVAL).await
    }

    pub async fn connect_with_retry(
        manager: Arc<Manager>,
        connection: &str,
        max_open_conn: u32,
        attempts: u32,
        interval: Duration,
    ) -> Result<Self, DbError> {
        let options = connect_options(connection)?;
        // every in-memory connection would be a separate database
        let max = if connection == ":memory:" { 1 } else { max_open_conn.max(1) };
        let mut attempt = 1;
        loop {
            match SqlitePoolOptions::new()
                .max_connections(max)
                .connect_with(options.clone())
                .await
            {
                Ok(pool) => {
                    info!(connection, max_open_conn = max, "connected to database");
                    return Ok(Self { pool, manager });
                }
                Err(err) if attempt < attempts => {
                    warn!(connection, attempt, error = %err, "database connection failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(interval).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<String>, DbError> {
        let rows = sqlx::query(&format!("PRAGMA table_info({})", quote(table)))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("name").map_err(DbError::from))
            .collect()
    }

    async fn execute_all(&self, statements: &[String]) -> Result<(), DbError> {
        for sql in statements {
            debug!(%sql, "executing DDL");
            sqlx::query(sql).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Db for SqlDb {
    async fn begin_tx(&self, options: &TxOptions) -> Result<TxHandle, DbError> {
        let conn = self.pool.acquire().await?;
        let tx = SqlTransaction::begin(conn, Arc::clone(&self.manager), options.isolation_level).await?;
        Ok(Arc::new(tx))
    }

    async fn register_table(&self, schema: &Schema, cascade: bool, migrate: bool) -> Result<(), DbError> {
        if schema.is_abstract {
            return Ok(());
        }
        let table = schema.table_name();
        let existing = self.table_columns(table).await?;
        if !existing.is_empty() {
            if !migrate {
                return Err(DbError::TableExists(table.to_string()));
            }
            let statements = migrate_sql(schema, &existing);
            info!(table, changes = statements.len(), "migrating table");
            return self.execute_all(&statements).await;
        }
        let statements = create_table_sql(schema, &self.manager, cascade)?;
        self.execute_all(&statements).await
    }

    async fn drop_table(&self, schema: &Schema) -> Result<(), DbError> {
        if schema.is_abstract {
            return Ok(());
        }
        self.execute_all(&[format!("DROP TABLE IF EXISTS {}", quote(schema.table_name()))])
            .await
    }

    async fn close(&self) -> Result<(), DbError> {
        self.pool.close().await;
        Ok(())
    }
}
