//! Development backend keeping every table in one YAML or JSON document.
//! Transactions are serialized; each one reads the whole file on begin and
//! rewrites it on commit.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kura_filter::{matches, Filter};
use kura_schema::{LockPolicy, Schema};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::{
    Db, DbError, IsolationLevel, Paginator, Resource, ResourceState, SortOrder, Transaction, TxHandle, TxOptions,
    ViewOptions,
};

type Tables = BTreeMap<String, Vec<Map<String, Value>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Format {
    Yaml,
    Json,
}

#[derive(Clone, Debug)]
struct Store {
    path: PathBuf,
    format: Format,
}

impl Store {
    async fn load(&self) -> Result<Tables, DbError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Tables::new()),
            Err(e) => return Err(DbError::File(format!("{}: {e}", self.path.display()))),
        };
        if text.trim().is_empty() {
            return Ok(Tables::new());
        }
        let parsed = match self.format {
            Format::Yaml => serde_yaml::from_str(&text).map_err(|e| e.to_string()),
            Format::Json => serde_json::from_str(&text).map_err(|e| e.to_string()),
        };
        parsed.map_err(|e| DbError::File(format!("{}: {e}", self.path.display())))
    }

    async fn save(&self, tables: &Tables) -> Result<(), DbError> {
        let text = match self.format {
            Format::Yaml => serde_yaml::to_string(tables).map_err(|e| e.to_string()),
            Format::Json => serde_json::to_string_pretty(tables).map_err(|e| e.to_string()),
        }
        .map_err(DbError::File)?;
        tokio::fs::write(&self.path, text)
            .await
            .map_err(|e| DbError::File(format!("{}: {e}", self.path.display())))
    }
}

pub struct FileDb {
    store: Store,
    lock: Arc<Mutex<()>>,
}

impl FileDb {
    /// `.json` files are written as JSON, anything else as YAML.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let format = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Format::Json,
            _ => Format::Yaml,
        };
        Self {
            store: Store { path, format },
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.store.path
    }

    async fn modify(&self, f: impl FnOnce(&mut Tables)) -> Result<(), DbError> {
        let _guard = self.lock.lock().await;
        let mut tables = self.store.load().await?;
        f(&mut tables);
        self.store.save(&tables).await
    }
}

#[async_trait]
impl Db for FileDb {
    async fn begin_tx(&self, options: &TxOptions) -> Result<TxHandle, DbError> {
        let guard = Arc::clone(&self.lock).lock_owned().await;
        let tables = self.store.load().await?;
        Ok(Arc::new(FileTransaction {
            store: self.store.clone(),
            tables: Mutex::new(tables),
            guard: Mutex::new(Some(guard)),
            level: AtomicU8::new(options.isolation_level.code()),
            closed: AtomicBool::new(false),
        }))
    }

    async fn register_table(&self, schema: &Schema, _cascade: bool, migrate: bool) -> Result<(), DbError> {
        if schema.is_abstract {
            return Ok(());
        }
        let table = schema.table_name().to_string();
        let _guard = self.lock.lock().await;
        let mut tables = self.store.load().await?;
        if tables.contains_key(&table) {
            if migrate {
                return Ok(());
            }
            return Err(DbError::TableExists(table));
        }
        tables.insert(table, Vec::new());
        self.store.save(&tables).await
    }

    async fn drop_table(&self, schema: &Schema) -> Result<(), DbError> {
        let table = schema.table_name().to_string();
        self.modify(move |tables| {
            tables.remove(&table);
        })
        .await
    }

    async fn close(&self) -> Result<(), DbError> {
        Ok(())
    }
}

pub struct FileTransaction {
    store: Store,
    tables: Mutex<Tables>,
    guard: Mutex<Option<OwnedMutexGuard<()>>>,
    level: AtomicU8,
    closed: AtomicBool,
}

impl FileTransaction {
    fn check_open(&self) -> Result<(), DbError> {
        if self.closed() {
            Err(DbError::Closed)
        } else {
            Ok(())
        }
    }

    async fn release(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.guard.lock().await.take();
    }

    /// Merges the resource's keys into the stored row.
    async fn write(&self, resource: &Resource) -> Result<(), DbError> {
        self.check_open()?;
        let table = resource.schema().table_name();
        let mut tables = self.tables.lock().await;
        let row = tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|r| r.get("id").and_then(Value::as_str) == Some(resource.id())))
            .ok_or_else(|| DbError::NotFound(format!("{table}/{}", resource.id())))?;
        for (k, v) in resource.data() {
            if resource.schema().has_property(k) {
                row.insert(k.clone(), v.clone());
            }
        }
        Ok(())
    }
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .unwrap_or_default()
            .partial_cmp(&y.as_f64().unwrap_or_default())
            .unwrap_or(CmpOrdering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (None | Some(Value::Null), None | Some(Value::Null)) => CmpOrdering::Equal,
        (None | Some(Value::Null), _) => CmpOrdering::Less,
        (_, None | Some(Value::Null)) => CmpOrdering::Greater,
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

#[async_trait]
impl Transaction for FileTransaction {
    async fn create(&self, resource: &Resource) -> Result<(), DbError> {
        self.check_open()?;
        let mut tables = self.tables.lock().await;
        let rows = tables.entry(resource.schema().table_name().to_string()).or_default();
        if rows.iter().any(|r| r.get("id").and_then(Value::as_str) == Some(resource.id())) {
            return Err(DbError::Duplicate(resource.id().to_string()));
        }
        let row: Map<String, Value> = resource
            .data()
            .iter()
            .filter(|(k, _)| resource.schema().has_property(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        rows.push(row);
        Ok(())
    }

    async fn update(&self, resource: &Resource) -> Result<(), DbError> {
        self.write(resource).await
    }

    async fn state_update(&self, resource: &Resource, state: Option<&ResourceState>) -> Result<(), DbError> {
        if state.is_some() {
            return Err(DbError::Unsupported("state update"));
        }
        self.write(resource).await
    }

    async fn delete(&self, schema: &Schema, id: &str) -> Result<(), DbError> {
        self.check_open()?;
        let mut tables = self.tables.lock().await;
        let rows = tables
            .get_mut(schema.table_name())
            .ok_or_else(|| DbError::NotFound(format!("{}/{id}", schema.table_name())))?;
        let before = rows.len();
        rows.retain(|r| r.get("id").and_then(Value::as_str) != Some(id));
        if rows.len() == before {
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
        self.check_open()?;
        filter.validate_properties(|p| schema.has_property(p))?;
        let tables = self.tables.lock().await;
        let mut rows: Vec<Map<String, Value>> = tables
            .get(schema.table_name())
            .map(|rows| rows.iter().filter(|r| matches(filter, r)).cloned().collect())
            .unwrap_or_default();
        drop(tables);

        let total = rows.len() as u64;
        if let Some(pg) = paginator {
            rows.sort_by(|a, b| {
                let ord = compare(a.get(&pg.key), b.get(&pg.key));
                if pg.order == SortOrder::Desc {
                    ord.reverse()
                } else {
                    ord
                }
            });
            let offset = usize::try_from(pg.offset).unwrap_or(usize::MAX);
            rows = rows.into_iter().skip(offset).collect();
            if pg.limit > 0 {
                rows.truncate(usize::try_from(pg.limit).unwrap_or(usize::MAX));
            }
        }
        debug!(schema = %schema.id, total, "file list");
        let resources = rows
            .into_iter()
            .map(|row| {
                let row = match view {
                    Some(v) => v.project(row),
                    None => row,
                };
                Resource::new(Arc::clone(schema), row)
            })
            .collect();
        Ok((resources, total))
    }

    async fn lock_list(
        &self,
        schema: &Arc<Schema>,
        filter: &Filter,
        view: Option<&ViewOptions>,
        paginator: Option<&Paginator>,
        _lock: LockPolicy,
    ) -> Result<(Vec<Resource>, u64), DbError> {
        self.list(schema, filter, view, paginator).await
    }

    async fn state_fetch(&self, _schema: &Schema, _filter: &Filter) -> Result<ResourceState, DbError> {
        Err(DbError::Unsupported("state fetch"))
    }

    async fn query(&self, _schema: &Arc<Schema>, _sql: &str, _args: &[Value]) -> Result<Vec<Resource>, DbError> {
        Err(DbError::Unsupported("raw query"))
    }

    async fn set_isolation_level(&self, level: IsolationLevel) -> Result<(), DbError> {
        self.level.store(level.code(), Ordering::SeqCst);
        Ok(())
    }

    fn isolation_level(&self) -> IsolationLevel {
        IsolationLevel::from_code(self.level.load(Ordering::SeqCst))
    }

    async fn commit(&self) -> Result<(), DbError> {
        self.check_open()?;
        let tables = self.tables.lock().await;
        let saved = self.store.save(&tables).await;
        drop(tables);
        self.release().await;
        saved
    }

    async fn close(&self) -> Result<(), DbError> {
        self.release().await;
        Ok(())
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::from_value(&json!({
                "id": "net", "plural": "nets",
                "schema": {"properties": {"name": {"type": "string"}, "size": {"type": "integer"}}}
            }))
            .unwrap(),
        )
    }

    fn resource(schema: &Arc<Schema>, id: &str, name: &str, size: i64) -> Resource {
        Resource::new(
            Arc::clone(schema),
            json!({"id": id, "name": name, "size": size}).as_object().cloned().unwrap(),
        )
    }

    #[tokio::test]
    async fn commit_persists_and_close_discards() {
        let dir = tempfile::tempdir().unwrap();
        let db = FileDb::new(dir.path().join("db.yaml"));
        let s = schema();
        db.register_table(&s, false, false).await.unwrap();

        let tx = db.begin().await.unwrap();
        tx.create(&resource(&s, "a", "alpha", 2)).await.unwrap();
        tx.commit().await.unwrap();

        let tx = db.begin().await.unwrap();
        tx.create(&resource(&s, "b", "beta", 1)).await.unwrap();
        tx.close().await.unwrap();

        let tx = db.begin().await.unwrap();
        let (rows, total) = tx.list(&s, &Filter::all(), None, None).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].id(), "a");
        assert!(matches!(tx.state_fetch(&s, &Filter::all()).await, Err(DbError::Unsupported(_))));
        assert!(matches!(tx.query(&s, "select 1", &[]).await, Err(DbError::Unsupported(_))));
        tx.close().await.unwrap();
    }

    #[tokio::test]
    async fn pagination_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let db = FileDb::new(dir.path().join("db.json"));
        let s = schema();
        let tx = db.begin().await.unwrap();
        for (id, size) in [("a", 3), ("b", 1), ("c", 2)] {
            tx.create(&resource(&s, id, id, size)).await.unwrap();
        }
        let pg = Paginator::new(&s, "size", "desc", 2, 0).unwrap();
        let (rows, total) = tx.list(&s, &Filter::all(), None, Some(&pg)).await.unwrap();
        assert_eq!(total, 3);
        let ids: Vec<&str> = rows.iter().map(Resource::id).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let far = Paginator::new(&s, "id", "asc", 0, 10).unwrap();
        assert!(tx.list(&s, &Filter::all(), None, Some(&far)).await.unwrap().0.is_empty());

        let (rows, _) = tx.list(&s, &Filter::eq("name", json!("b")), None, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(tx.list(&s, &Filter::eq("bogus", json!(1)), None, None).await.is_err());
        tx.commit().await.unwrap();
        assert!(dir.path().join("db.json").exists());
    }
}
