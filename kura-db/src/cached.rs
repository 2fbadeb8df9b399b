//! Per-transaction read cache for `list` and `lock_list`. Any write
//! through the wrapper drops every cached entry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kura_filter::Filter;
use kura_schema::{LockPolicy, Schema};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use crate::metrics::observe_cache;
use crate::{DbError, IsolationLevel, Paginator, Resource, ResourceState, Transaction, TxHandle, ViewOptions};

/// Lookup outcomes seen by one cached transaction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hit: u64,
    pub miss: u64,
    pub hit_lock: u64,
    pub miss_lock: u64,
    /// An unlocked entry existed but a lock was requested.
    pub not_locked: u64,
}

#[derive(Clone)]
struct Entry {
    resources: Vec<Resource>,
    total: u64,
    locked: bool,
}

pub struct CachedTransaction {
    inner: TxHandle,
    cache: Mutex<HashMap<String, Entry>>,
    stats: Mutex<CacheStats>,
}

fn cache_key(schema: &Schema, filter: &Filter, view: Option<&ViewOptions>, paginator: Option<&Paginator>) -> String {
    let join = view.map_or(true, |v| v.join);
    let digest = hex::encode(Sha256::digest(filter.to_value().to_string().as_bytes()));
    let view = view.map(|v| format!("{v:?}")).unwrap_or_default();
    let pg = paginator.map(|p| p.to_string()).unwrap_or_default();
    format!("{}|{join}|{digest}|{view}|{pg}", schema.id)
}

impl CachedTransaction {
    pub fn new(inner: TxHandle) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Wraps only the levels where repeated reads are stable.
    pub fn wrap(inner: TxHandle) -> TxHandle {
        match inner.isolation_level() {
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => Arc::new(Self::new(inner)),
            _ => inner,
        }
    }

    pub fn inner(&self) -> &TxHandle {
        &self.inner
    }

    pub async fn stats(&self) -> CacheStats {
        *self.stats.lock().await
    }

    async fn record(&self, schema: &str, outcome: &str) {
        observe_cache(schema, outcome);
        let mut stats = self.stats.lock().await;
        match outcome {
            "hit" => stats.hit += 1,
            "miss" => stats.miss += 1,
            "hit_lock" => stats.hit_lock += 1,
            "miss_lock" => stats.miss_lock += 1,
            _ => stats.not_locked += 1,
        }
    }

    async fn invalidate(&self) {
        let mut cache = self.cache.lock().await;
        if !cache.is_empty() {
            debug!(entries = cache.len(), "dropping transaction cache");
            cache.clear();
        }
    }
}

#[async_trait]
impl Transaction for CachedTransaction {
    async fn create(&self, resource: &Resource) -> Result<(), DbError> {
        self.invalidate().await;
        self.inner.create(resource).await
    }

    async fn update(&self, resource: &Resource) -> Result<(), DbError> {
        self.invalidate().await;
        self.inner.update(resource).await
    }

    async fn state_update(&self, resource: &Resource, state: Option<&ResourceState>) -> Result<(), DbError> {
        self.invalidate().await;
        self.inner.state_update(resource, state).await
    }

    async fn delete(&self, schema: &Schema, id: &str) -> Result<(), DbError> {
        self.invalidate().await;
        self.inner.delete(schema, id).await
    }

    async fn list(
        &self,
        schema: &Arc<Schema>,
        filter: &Filter,
        view: Option<&ViewOptions>,
        paginator: Option<&Paginator>,
    ) -> Result<(Vec<Resource>, u64), DbError> {
        let key = cache_key(schema, filter, view, paginator);
        if let Some(entry) = self.cache.lock().await.get(&key).cloned() {
            self.record(&schema.id, "hit").await;
            return Ok((entry.resources, entry.total));
        }
        self.record(&schema.id, "miss").await;
        let (resources, total) = self.inner.list(schema, filter, view, paginator).await?;
        self.cache.lock().await.insert(
            key,
            Entry {
                resources: resources.clone(),
                total,
                locked: false,
            },
        );
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
        let key = cache_key(schema, filter, view, paginator);
        match self.cache.lock().await.get(&key).cloned() {
            // a locked entry satisfies any lock policy
            Some(entry) if entry.locked => {
                self.record(&schema.id, "hit_lock").await;
                return Ok((entry.resources, entry.total));
            }
            Some(_) => self.record(&schema.id, "not_locked").await,
            None => self.record(&schema.id, "miss_lock").await,
        }
        let (resources, total) = self.inner.lock_list(schema, filter, view, paginator, lock).await?;
        self.cache.lock().await.insert(
            key,
            Entry {
                resources: resources.clone(),
                total,
                locked: true,
            },
        );
        Ok((resources, total))
    }

    async fn state_fetch(&self, schema: &Schema, filter: &Filter) -> Result<ResourceState, DbError> {
        self.inner.state_fetch(schema, filter).await
    }

    async fn query(&self, schema: &Arc<Schema>, sql: &str, args: &[Value]) -> Result<Vec<Resource>, DbError> {
        self.invalidate().await;
        self.inner.query(schema, sql, args).await
    }

    async fn set_isolation_level(&self, level: IsolationLevel) -> Result<(), DbError> {
        self.inner.set_isolation_level(level).await
    }

    fn isolation_level(&self) -> IsolationLevel {
        self.inner.isolation_level()
    }

    async fn commit(&self) -> Result<(), DbError> {
        self.inner.commit().await
    }

    async fn close(&self) -> Result<(), DbError> {
        self.invalidate().await;
        self.inner.close().await
    }

    fn closed(&self) -> bool {
        self.inner.closed()
    }
}
