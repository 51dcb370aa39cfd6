//! In-process store backend. Backs `STORE_BACKEND=memory` dry runs and the
//! engine tests. A write notifies subscribers immediately, so the controller
//! sees its own writes echoed back exactly as it does from the broker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Result};
use serde_json::Value;

#[cfg(test)]
use std::collections::HashSet;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use super::{Registry, StateStore, Subscription};

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    values: Mutex<HashMap<String, Value>>,
    registry: Arc<Registry>,
    #[cfg(test)]
    writes: Mutex<Vec<(String, Value)>>,
    #[cfg(test)]
    unavailable: AtomicBool,
    #[cfg(test)]
    failing_writes: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field as an outside party would (the device, another client).
    /// Subscribers are notified; the write is not logged as the controller's.
    pub fn put(&self, key: &str, value: Value) {
        let mut values = self.lock_values();
        values.insert(key.to_string(), value.clone());
        self.inner.registry.notify(key, &value);
    }

    /// Peek at a field without going through the async contract.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock_values().get(key).cloned()
    }

    fn lock_values(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        self.inner.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Every successful `write` in order.
    pub fn writes(&self) -> Vec<(String, Value)> {
        self.inner
            .writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Successful writes to a single key, in order.
    pub fn writes_to(&self, key: &str) -> Vec<Value> {
        self.writes()
            .into_iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v)
            .collect()
    }

    pub fn clear_writes(&self) {
        self.inner
            .writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Make every read fail, as a lost transport would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make writes to `key` fail.
    pub fn fail_writes_to(&self, key: &str) {
        self.inner
            .failing_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());
    }

    pub(crate) fn watcher_count(&self, key: &str) -> usize {
        self.inner.registry.watcher_count(key)
    }
}

impl StateStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<Value>> {
        #[cfg(test)]
        {
            if self.inner.unavailable.load(Ordering::SeqCst) {
                bail!("memory store unavailable");
            }
        }
        Ok(self.get(key))
    }

    async fn write(&self, key: &str, value: Value) -> Result<()> {
        if key.is_empty() {
            bail!("empty key");
        }
        #[cfg(test)]
        {
            let failing = self
                .inner
                .failing_writes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(key);
            if failing {
                bail!("write to '{key}' rejected");
            }
            self.inner
                .writes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((key.to_string(), value.clone()));
        }
        self.put(key, value);
        Ok(())
    }

    fn subscribe(&self, key: &str) -> Subscription {
        // Hold the value lock while registering so no write slips between
        // reading the current value and joining the watcher list.
        let values = self.lock_values();
        let current = values.get(key).cloned();
        let sub = self.inner.registry.register(key, current);
        drop(values);
        sub
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn read_missing_key_is_none() {
        let store = MemoryStore::new();
        assert_eq!(store.read("Temp").await.unwrap(), None);
    }

    #[tokio::test]
    async fn write_then_read() {
        let store = MemoryStore::new();
        store.write("timer", json!(3600)).await.unwrap();
        assert_eq!(store.read("timer").await.unwrap(), Some(json!(3600)));
        assert_eq!(store.writes(), vec![("timer".to_string(), json!(3600))]);
    }

    #[tokio::test]
    async fn put_is_not_logged_as_a_write() {
        let store = MemoryStore::new();
        store.put("Plant_1", json!(42.0));
        assert_eq!(store.get("Plant_1"), Some(json!(42.0)));
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn subscribe_sees_current_value_then_changes() {
        let store = MemoryStore::new();
        store.put("operation_mode", json!("Auto"));

        let mut sub = store.subscribe("operation_mode");
        store.write("operation_mode", json!("Timer")).await.unwrap();

        assert_eq!(sub.recv().await, Some(json!("Auto")));
        assert_eq!(sub.recv().await, Some(json!("Timer")));
    }

    #[tokio::test]
    async fn unavailable_store_fails_reads() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(store.read("Temp").await.is_err());
    }

    #[tokio::test]
    async fn failing_key_rejects_write_and_keeps_value() {
        let store = MemoryStore::new();
        store.put("motor_1", json!(false));
        store.fail_writes_to("motor_1");

        assert!(store.write("motor_1", json!(true)).await.is_err());
        assert_eq!(store.get("motor_1"), Some(json!(false)));
        assert!(store.writes().is_empty());
    }

    #[test]
    fn dropped_subscription_is_unregistered() {
        let store = MemoryStore::new();
        let sub = store.subscribe("motor_1");
        assert_eq!(store.watcher_count("motor_1"), 1);
        drop(sub);
        assert_eq!(store.watcher_count("motor_1"), 0);
    }
}
