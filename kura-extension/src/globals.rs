use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rhai::{Dynamic, ImmutableString};

/// A named map shared by every holder of the same handle.
#[derive(Clone, Default)]
pub struct GlobalMap {
    inner: Arc<Mutex<rhai::Map>>,
}

impl GlobalMap {
    pub fn get(&self, key: &str) -> Dynamic {
        match self.inner.lock() {
            Ok(map) => map.get(key).cloned().unwrap_or(Dynamic::UNIT),
            Err(_) => Dynamic::UNIT,
        }
    }

    pub fn set(&self, key: &str, value: Dynamic) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(key.into(), value.flatten());
        }
    }

    pub fn remove(&self, key: &str) -> Dynamic {
        match self.inner.lock() {
            Ok(mut map) => map.remove(key).unwrap_or(Dynamic::UNIT),
            Err(_) => Dynamic::UNIT,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().map(|map| map.contains_key(key)).unwrap_or(false)
    }

    pub fn keys(&self) -> rhai::Array {
        match self.inner.lock() {
            Ok(map) => map.keys().map(|k| Dynamic::from(ImmutableString::from(k.as_str()))).collect(),
            Err(_) => rhai::Array::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registry of named global maps.
///
/// One store lives for the whole process; another is created per environment
/// and handed to every clone of it.
#[derive(Default)]
pub struct GlobalStore {
    maps: Mutex<HashMap<String, GlobalMap>>,
}

impl GlobalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the map called `name`, creating it on first use.
    pub fn map(&self, name: &str) -> GlobalMap {
        match self.maps.lock() {
            Ok(mut maps) => maps.entry(name.to_string()).or_default().clone(),
            Err(poisoned) => poisoned.into_inner().entry(name.to_string()).or_default().clone(),
        }
    }
}
