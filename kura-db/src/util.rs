use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kura_filter::Filter;
use kura_schema::Manager;
use rand::Rng;
use serde_json::json;
use tracing::{info, warn};

use crate::{Db, DbError, FileDb, SqlDb, TxHandle, TxOptions};

pub const DEADLOCK_RETRIES: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Yaml,
    Json,
}

impl DbKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sqlite" | "sqlite3" => Some(Self::Sqlite),
            "yaml" | "file" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

pub async fn connect_db(
    manager: Arc<Manager>,
    kind: &str,
    connection: &str,
    max_open_conn: u32,
) -> Result<Arc<dyn Db>, DbError> {
    match DbKind::parse(kind) {
        Some(DbKind::Sqlite) => Ok(Arc::new(SqlDb::connect(manager, connection, max_open_conn).await?)),
        Some(DbKind::Yaml) | Some(DbKind::Json) => Ok(Arc::new(FileDb::new(connection))),
        None => Err(DbError::Other(format!("unknown database type {kind}"))),
    }
}

fn is_deadlock(message: &str) -> bool {
    message.contains("Deadlock found") || message.contains("database is locked")
}

/// Runs `f` in a fresh transaction and commits. Lock contention restarts
/// the whole transaction after a short random pause.
pub async fn within_tx<T, E, F, Fut>(db: &dyn Db, options: &TxOptions, mut f: F) -> Result<T, E>
where
    E: From<DbError> + Display,
    F: FnMut(TxHandle) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let tx = db.begin_tx(options).await?;
        let outcome = match f(Arc::clone(&tx)).await {
            Ok(value) => tx.commit().await.map(|_| value).map_err(E::from),
            Err(err) => Err(err),
        };
        if !tx.closed() {
            if let Err(err) = tx.close().await {
                warn!(error = %err, "closing transaction failed");
            }
        }
        match outcome {
            Err(err) if attempt < DEADLOCK_RETRIES && is_deadlock(&err.to_string()) => {
                let pause = rand::thread_rng().gen_range(10..100) * u64::from(attempt);
                warn!(attempt, error = %err, "deadlock detected, retrying transaction");
                tokio::time::sleep(Duration::from_millis(pause)).await;
            }
            other => return other,
        }
    }
}

/// Drops (optionally) and registers every concrete schema in dependency
/// order. Tables that already exist are left alone.
pub async fn init_db_with_schemas(
    db: &dyn Db,
    manager: &Manager,
    drop_on_create: bool,
    cascade: bool,
    migrate: bool,
) -> Result<(), DbError> {
    let ordered = manager.ordered_schemas();
    if drop_on_create {
        for schema in ordered.iter().rev() {
            if let Err(err) = db.drop_table(schema).await {
                warn!(table = schema.table_name(), error = %err, "dropping table failed");
            }
        }
    }
    for schema in &ordered {
        match db.register_table(schema, cascade, migrate).await {
            Ok(()) => info!(table = schema.table_name(), "registered table"),
            Err(DbError::TableExists(table)) => warn!(%table, "table already exists"),
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Copies every resource from `source` to `target` in dependency order.
/// Existing rows are replaced only with `override_existing`.
pub async fn copy_db_resources(
    source: &dyn Db,
    target: &dyn Db,
    manager: &Manager,
    override_existing: bool,
) -> Result<u64, DbError> {
    let from = source.begin().await?;
    let to = target.begin().await?;
    let copied = copy_all(&from, &to, manager, override_existing).await;
    let _ = from.close().await;
    match copied {
        Ok(count) => {
            to.commit().await?;
            info!(count, "copied resources");
            Ok(count)
        }
        Err(err) => {
            let _ = to.close().await;
            Err(err)
        }
    }
}

async fn copy_all(from: &TxHandle, to: &TxHandle, manager: &Manager, override_existing: bool) -> Result<u64, DbError> {
    let mut count = 0;
    let no_join = crate::ViewOptions {
        join: false,
        ..Default::default()
    };
    for schema in manager.ordered_schemas() {
        let (rows, _) = from.list(&schema, &Filter::all(), Some(&no_join), None).await?;
        for row in rows {
            let by_id = Filter::eq("id", json!(row.id()));
            match to.fetch(&schema, &by_id, Some(&no_join)).await {
                Ok(_) if override_existing => to.state_update(&row, None).await?,
                Ok(_) => continue,
                Err(DbError::NotFound(_)) => to.create(&row).await?,
                Err(err) => return Err(err),
            }
            count += 1;
        }
    }
    Ok(count)
}
