//! Hierarchical key/value store with revisioned change events, consumed by
//! extensions through the `sync_*` builtins.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("sync error: {0}")]
    Backend(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub key: String,
    pub value: String,
    pub revision: i64,
    pub children: Vec<Node>,
}

impl Node {
    pub fn to_value(&self) -> Value {
        json!({
            "key": self.key,
            "value": self.value,
            "revision": self.revision,
            "children": self.children.iter().map(Node::to_value).collect::<Vec<_>>(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// `set` or `delete`.
    pub action: String,
    pub key: String,
    pub value: String,
    pub revision: i64,
}

impl Event {
    /// JSON values are decoded; anything else is passed through as a string.
    pub fn to_value(&self) -> Value {
        let data = serde_json::from_str(&self.value).unwrap_or_else(|_| Value::String(self.value.clone()));
        json!({
            "action": self.action,
            "key": self.key,
            "data": data,
            "revision": self.revision,
        })
    }
}

#[async_trait]
pub trait SyncClient: Send + Sync {
    async fn update(&self, key: &str, value: &str) -> Result<i64, SyncError>;

    /// Removes `key` and, with `prefix`, everything below it.
    async fn delete(&self, key: &str, prefix: bool) -> Result<(), SyncError>;

    async fn fetch(&self, key: &str) -> Result<Node, SyncError>;

    /// Next event under `key` with revision >= `revision` (any new event when
    /// `revision` is 0), or `None` once `timeout` elapses.
    async fn watch(&self, key: &str, timeout: Duration, revision: i64) -> Result<Option<Event>, SyncError>;
}

#[derive(Default)]
struct State {
    revision: i64,
    values: BTreeMap<String, (String, i64)>,
    history: Vec<Event>,
}

/// Single-process implementation backed by an ordered map.
#[derive(Default)]
pub struct MemorySync {
    state: Mutex<State>,
    changed: Notify,
}

fn under(key: &str, prefix: &str) -> bool {
    key == prefix || prefix == "/" || key.starts_with(&format!("{}/", prefix.trim_end_matches('/')))
}

impl MemorySync {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(state: &mut State, action: &str, key: &str, value: &str) -> i64 {
        state.revision += 1;
        let revision = state.revision;
        state.history.push(Event {
            action: action.into(),
            key: key.into(),
            value: value.into(),
            revision,
        });
        revision
    }
}

#[async_trait]
impl SyncClient for MemorySync {
    async fn update(&self, key: &str, value: &str) -> Result<i64, SyncError> {
        let mut state = self.state.lock().await;
        let revision = Self::record(&mut state, "set", key, value);
        state.values.insert(key.to_string(), (value.to_string(), revision));
        drop(state);
        self.changed.notify_waiters();
        debug!(key, revision, "sync update");
        Ok(revision)
    }

    async fn delete(&self, key: &str, prefix: bool) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        let doomed: Vec<String> = state
            .values
            .keys()
            .filter(|k| if prefix { under(k, key) } else { k.as_str() == key })
            .cloned()
            .collect();
        if doomed.is_empty() {
            return Err(SyncError::NotFound(key.to_string()));
        }
        for k in doomed {
            state.values.remove(&k);
            Self::record(&mut state, "delete", &k, "");
        }
        drop(state);
        self.changed.notify_waiters();
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Node, SyncError> {
        let state = self.state.lock().await;
        let children: Vec<Node> = state
            .values
            .iter()
            .filter(|(k, _)| k.as_str() != key && under(k, key))
            .map(|(k, (v, rev))| Node {
                key: k.clone(),
                value: v.clone(),
                revision: *rev,
                children: Vec::new(),
            })
            .collect();
        match state.values.get(key) {
            Some((value, revision)) => Ok(Node {
                key: key.to_string(),
                value: value.clone(),
                revision: *revision,
                children,
            }),
            None if !children.is_empty() => Ok(Node {
                key: key.to_string(),
                value: String::new(),
                revision: children.iter().map(|c| c.revision).max().unwrap_or_default(),
                children,
            }),
            None => Err(SyncError::NotFound(key.to_string())),
        }
    }

    async fn watch(&self, key: &str, timeout: Duration, revision: i64) -> Result<Option<Event>, SyncError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut from = revision;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.lock().await;
                if from <= 0 {
                    from = state.revision + 1;
                }
                if let Some(ev) = state.history.iter().find(|e| e.revision >= from && under(&e.key, key)) {
                    return Ok(Some(ev.clone()));
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn fetch_returns_children() {
        let sync = MemorySync::new();
        sync.update("/config/a", "1").await.unwrap();
        sync.update("/config/b", "{\"x\":1}").await.unwrap();
        sync.update("/other", "z").await.unwrap();
        let node = sync.fetch("/config").await.unwrap();
        assert_eq!(node.children.len(), 2);
        assert_eq!(sync.fetch("/config/a").await.unwrap().value, "1");
        assert_eq!(sync.fetch("/nope").await, Err(SyncError::NotFound("/nope".into())));

        sync.delete("/config", true).await.unwrap();
        assert!(sync.fetch("/config").await.is_err());
        assert!(sync.fetch("/other").await.is_ok());
    }

    #[tokio::test]
    async fn watch_replays_from_revision_and_times_out() {
        let sync = MemorySync::new();
        let first = sync.update("/w/a", "1").await.unwrap();
        sync.update("/x", "2").await.unwrap();
        let ev = sync.watch("/w", Duration::from_millis(10), first).await.unwrap().unwrap();
        assert_eq!(ev.key, "/w/a");
        assert_eq!(ev.to_value()["data"], json!(1));

        let none = sync.watch("/w", Duration::from_millis(20), 0).await.unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn watch_wakes_on_new_event() {
        let sync = Arc::new(MemorySync::new());
        let writer = Arc::clone(&sync);
        let waiter = tokio::spawn(async move { sync.watch("/w", Duration::from_secs(5), 0).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.update("/w/k", "v").await.unwrap();
        let ev = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(ev.action, "set");
        assert_eq!(ev.value, "v");
    }
}
