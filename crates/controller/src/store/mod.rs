//! Shared key-value state store: the contract every controller component is
//! handed, plus the MQTT and in-memory backends.
//!
//! The store holds named scalar fields (sensor readings, actuator states,
//! mode, timer fields, the connectivity mailbox flag) as JSON values.
//! Components never reach a global handle; they receive a `StateStore`
//! implementation explicitly.

pub mod memory;
pub mod mqtt;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use serde_json::Value;
use tokio::sync::mpsc;

pub use memory::MemoryStore;
pub use mqtt::{MqttSettings, MqttStore};

/// Field names in the remote store.
pub mod keys {
    pub const TEMP: &str = "Temp";
    pub const HUMIDITY: &str = "Humidity";
    pub const PLANTS: [&str; 4] = ["Plant_1", "Plant_2", "Plant_3", "Plant_4"];
    pub const IS_CONNECTED: &str = "isConnected";
    pub const OPERATION_MODE: &str = "operation_mode";
    pub const MOTORS: [&str; 4] = ["motor_1", "motor_2", "motor_3", "motor_4"];
    pub const TIMER: &str = "timer";
    pub const IS_COUNTING: &str = "isCounting";
    pub const TIMER_HOURS: &str = "timer_hours";
    pub const LOW_MOISTURE_ALERT: &str = "low_moisture_alert";
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Point reads, point writes and per-key change subscriptions.
pub trait StateStore: Clone + Send + Sync + 'static {
    /// Read the current value of `key`; `None` when the field is absent.
    fn read(&self, key: &str) -> impl Future<Output = Result<Option<Value>>> + Send;

    /// Overwrite `key` with `value`.
    fn write(&self, key: &str, value: Value) -> impl Future<Output = Result<()>> + Send;

    /// Watch `key`. The current value (if any) is delivered first, then every
    /// later change. Dropping the returned handle unregisters it.
    fn subscribe(&self, key: &str) -> Subscription;
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// A live registration for change notifications on one key.
pub struct Subscription {
    key: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<Value>,
    registry: Arc<Registry>,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait for the next value. Returns `None` once the backend is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unregister(&self.key, self.id);
    }
}

struct Watcher {
    id: u64,
    tx: mpsc::UnboundedSender<Value>,
}

/// Per-key fan-out of value changes, shared by both backends.
#[derive(Default)]
pub(crate) struct Registry {
    next_id: AtomicU64,
    watchers: Mutex<HashMap<String, Vec<Watcher>>>,
}

impl Registry {
    /// Register a watcher for `key`, seeding it with `current` if known.
    pub(crate) fn register(self: &Arc<Self>, key: &str, current: Option<Value>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(value) = current {
            // The receiver is still in hand, so this cannot fail.
            let _ = tx.send(value);
        }

        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .push(Watcher { id, tx });

        Subscription {
            key: key.to_string(),
            id,
            rx,
            registry: Arc::clone(self),
        }
    }

    /// Deliver `value` to every watcher of `key`, pruning closed ones.
    pub(crate) fn notify(&self, key: &str, value: &Value) {
        let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = watchers.get_mut(key) {
            list.retain(|w| w.tx.send(value.clone()).is_ok());
        }
    }

    fn unregister(&self, key: &str, id: u64) {
        let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = watchers.get_mut(key) {
            list.retain(|w| w.id != id);
            if list.is_empty() {
                watchers.remove(key);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn watcher_count(&self, key: &str) -> usize {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, Vec::len)
    }
}

// ---------------------------------------------------------------------------
// Value coercion
// ---------------------------------------------------------------------------

/// Interpret a stored value as a boolean. Accepts `true`/`false` and `0`/`1`.
pub fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_u64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        _ => None,
    }
}

/// Interpret a stored value as a finite float.
pub fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64().filter(|v| v.is_finite())
}

/// Interpret a stored value as a non-negative integer. Integral floats
/// (`3600.0`) are accepted.
pub fn as_u64(value: &Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    value
        .as_f64()
        .filter(|v| v.is_finite() && *v >= 0.0 && v.fract() == 0.0 && *v <= u64::MAX as f64)
        .map(|v| v as u64)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -- Registry -------------------------------------------------------------

    #[tokio::test]
    async fn register_delivers_current_value_first() {
        let registry = Arc::new(Registry::default());
        let mut sub = registry.register("timer", Some(json!(42)));
        registry.notify("timer", &json!(41));

        assert_eq!(sub.recv().await, Some(json!(42)));
        assert_eq!(sub.recv().await, Some(json!(41)));
    }

    #[tokio::test]
    async fn notify_only_reaches_matching_key() {
        let registry = Arc::new(Registry::default());
        let mut sub = registry.register("motor_1", None);
        registry.notify("motor_2", &json!(true));
        registry.notify("motor_1", &json!(false));

        assert_eq!(sub.recv().await, Some(json!(false)));
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let registry = Arc::new(Registry::default());
        let a = registry.register("timer", None);
        let b = registry.register("timer", None);
        assert_eq!(registry.watcher_count("timer"), 2);

        drop(a);
        assert_eq!(registry.watcher_count("timer"), 1);
        drop(b);
        assert_eq!(registry.watcher_count("timer"), 0);
    }

    // -- Coercion -------------------------------------------------------------

    #[test]
    fn as_bool_accepts_bools_and_binary_numbers() {
        assert_eq!(as_bool(&json!(true)), Some(true));
        assert_eq!(as_bool(&json!(false)), Some(false));
        assert_eq!(as_bool(&json!(1)), Some(true));
        assert_eq!(as_bool(&json!(0)), Some(false));
    }

    #[test]
    fn as_bool_rejects_other_values() {
        assert_eq!(as_bool(&json!(2)), None);
        assert_eq!(as_bool(&json!("true")), None);
        assert_eq!(as_bool(&Value::Null), None);
    }

    #[test]
    fn as_f64_reads_integers_and_floats() {
        assert_eq!(as_f64(&json!(42)), Some(42.0));
        assert_eq!(as_f64(&json!(17.5)), Some(17.5));
        assert_eq!(as_f64(&json!("17.5")), None);
    }

    #[test]
    fn as_u64_accepts_integral_floats_only() {
        assert_eq!(as_u64(&json!(3600)), Some(3600));
        assert_eq!(as_u64(&json!(3600.0)), Some(3600));
        assert_eq!(as_u64(&json!(3600.5)), None);
        assert_eq!(as_u64(&json!(-1)), None);
        assert_eq!(as_u64(&json!(true)), None);
    }
}
