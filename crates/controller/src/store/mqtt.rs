//! MQTT-backed store. Every field is a retained topic `<prefix>/<key>` whose
//! payload is the JSON-encoded value, so the broker holds the authoritative
//! copy and a fresh subscriber receives the latest value of every field.
//!
//! Point reads are served from a cache fed by a `<prefix>/#` subscription;
//! they fail while the broker connection is down. Clearing a field (empty
//! retained payload) is pushed to subscribers as `null`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::{Registry, StateStore, Subscription};

/// Connection settings for the broker.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub prefix: String,
    pub keep_alive: Duration,
}

#[derive(Clone)]
pub struct MqttStore {
    client: AsyncClient,
    prefix: String,
    shared: Arc<Shared>,
}

struct Shared {
    cache: Mutex<HashMap<String, Value>>,
    registry: Arc<Registry>,
    connected: AtomicBool,
}

impl MqttStore {
    /// Create the client and spawn the task driving its event loop. The task
    /// reconnects on its own; abort the handle to tear it down.
    pub fn connect(settings: &MqttSettings) -> (Self, JoinHandle<()>) {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(settings.keep_alive);

        let (client, eventloop) = AsyncClient::new(options, 64);
        let store = Self {
            client,
            prefix: settings.prefix.trim_end_matches('/').to_string(),
            shared: Arc::new(Shared {
                cache: Mutex::new(HashMap::new()),
                registry: Arc::new(Registry::default()),
                connected: AtomicBool::new(false),
            }),
        };

        info!(
            host = %settings.host,
            port = settings.port,
            prefix = %store.prefix,
            "connecting to state store"
        );

        let handle = tokio::spawn(store.clone().drive(eventloop));
        (store, handle)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Ask the event loop to send everything already queued, then close the
    /// connection. The driver task ends once the disconnect goes out.
    pub async fn disconnect(&self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .context("failed to queue disconnect")
    }

    async fn drive(self, mut eventloop: EventLoop) {
        let filter = format!("{}/#", self.prefix);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("state store connected");
                    self.shared.connected.store(true, Ordering::SeqCst);
                    // try_* never waits on the request queue this task drains.
                    if let Err(e) = self.client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                        error!("state store: subscribe to {filter} failed: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    let Some(key) = key_from_topic(&self.prefix, &p.topic) else {
                        debug!(topic = %p.topic, "state store: ignoring topic");
                        continue;
                    };
                    self.apply(key, decode_payload(&p.payload));
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("state store connection closed");
                    self.shared.connected.store(false, Ordering::SeqCst);
                    break;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("state store disconnected");
                    self.shared.connected.store(false, Ordering::SeqCst);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("state store error: {e}. reconnecting...");
                    self.shared.connected.store(false, Ordering::SeqCst);
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    fn apply(&self, key: &str, value: Option<Value>) {
        let mut cache = self.lock_cache();
        match value {
            Some(value) => {
                cache.insert(key.to_string(), value.clone());
                self.shared.registry.notify(key, &value);
            }
            // An empty retained payload clears the field; watchers see null.
            None => {
                if cache.remove(key).is_some() {
                    self.shared.registry.notify(key, &Value::Null);
                }
            }
        }
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        self.shared.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StateStore for MqttStore {
    async fn read(&self, key: &str) -> Result<Option<Value>> {
        if !self.is_connected() {
            bail!("state store not connected");
        }
        Ok(self.lock_cache().get(key).cloned())
    }

    async fn write(&self, key: &str, value: Value) -> Result<()> {
        if !self.is_connected() {
            bail!("state store not connected");
        }
        let topic = topic_for(&self.prefix, key);
        let payload = serde_json::to_vec(&value).context("failed to encode value")?;

        self.client
            .publish(topic.as_str(), QoS::AtLeastOnce, true, payload)
            .await
            .with_context(|| format!("failed to publish {topic}"))?;

        // Read-your-writes until the broker echoes the retained message back.
        self.lock_cache().insert(key.to_string(), value);
        Ok(())
    }

    fn subscribe(&self, key: &str) -> Subscription {
        let cache = self.lock_cache();
        let current = cache.get(key).cloned();
        let sub = self.shared.registry.register(key, current);
        drop(cache);
        sub
    }
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Topic holding `key` under `prefix`.
pub(crate) fn topic_for(prefix: &str, key: &str) -> String {
    format!("{prefix}/{key}")
}

/// Extract the field key from "<prefix>/<key>". Nested topics are not fields.
pub(crate) fn key_from_topic<'a>(prefix: &str, topic: &'a str) -> Option<&'a str> {
    let key = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    if key.is_empty() || key.contains('/') {
        None
    } else {
        Some(key)
    }
}

/// Decode a retained payload. JSON scalars are taken as-is; anything else is
/// kept as a trimmed string (so a bare `Auto` reads as `"Auto"`). Empty
/// payloads mean the field was cleared.
pub(crate) fn decode_payload(payload: &[u8]) -> Option<Value> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(serde_json::from_slice(payload).unwrap_or_else(|_| {
        Value::String(String::from_utf8_lossy(payload).trim().to_string())
    }))
}

// ===========================================================================
// Tests
// ===========================================================================
