//! Key/value configuration store with typed access
//!
//! Values are kept as JSON so plugins can store arbitrary serde types. Plugin
//! settings are namespaced `"<plugin id>.<key>"`.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Default)]
pub struct ConfigStore {
    values: RwLock<BTreeMap<String, Value>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the namespaced key for a plugin setting
    pub fn plugin_key(plugin_id: &str, key: &str) -> String {
        format!("{plugin_id}.{key}")
    }

    /// Typed read; `Ok(None)` when the key is absent
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let guard = self.values.read();
        match guard.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    /// Typed read falling back to `default` when absent
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    pub fn set<T: Serialize>(&self, key: &str, value: T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.values.write().insert(key.to_string(), value);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.write().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.read().contains_key(key)
    }

    /// Entries under `prefix.`, with the prefix stripped from the keys
    pub fn entries_with_prefix(&self, prefix: &str) -> BTreeMap<String, Value> {
        let namespace = format!("{prefix}.");
        self.values
            .read()
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(&namespace)
                    .map(|stripped| (stripped.to_string(), v.clone()))
            })
            .collect()
    }

    /// Drop every entry under `prefix.`
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let namespace = format!("{prefix}.");
        let mut guard = self.values.write();
        let before = guard.len();
        guard.retain(|k, _| !k.starts_with(&namespace));
        before - guard.len()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    /// Persist the store as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = self.values.read().clone();
        let contents = serde_json::to_string_pretty(&snapshot)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Replace the store contents with the file at `path`
    pub fn load(&self, path: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(path)?;
        let parsed: BTreeMap<String, Value> = serde_json::from_str(&contents)
            .map_err(|e| Error::ConfigError(format!("Invalid store file {}: {e}", path.display())))?;
        *self.values.write() = parsed;
        Ok(())
    }
}
