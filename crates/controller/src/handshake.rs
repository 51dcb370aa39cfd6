//! Connectivity handshake. The device raises `isConnected` on every
//! heartbeat; we consume the flag by clearing it, so each `true` is reported
//! as Connected exactly once.

use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::controller::Event;
use crate::store::{as_bool, keys, StateStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ConnectivityReport {
    Connected,
    NotConnected,
    Error(String),
}

impl ConnectivityReport {
    pub fn message(&self) -> String {
        match self {
            Self::Connected => "Device Connected".to_string(),
            Self::NotConnected => "Device Not Connected".to_string(),
            Self::Error(e) => format!("Error checking connection status: {e}"),
        }
    }
}

/// One drain-and-acknowledge round.
pub async fn check<S: StateStore>(store: &S) -> ConnectivityReport {
    let flag = match store.read(keys::IS_CONNECTED).await {
        Ok(v) => v.as_ref().and_then(as_bool).unwrap_or(false),
        Err(e) => return ConnectivityReport::Error(format!("{e:#}")),
    };
    if !flag {
        return ConnectivityReport::NotConnected;
    }

    match store
        .write(keys::IS_CONNECTED, Value::Bool(false))
        .await
        .context("acknowledging connectivity flag")
    {
        Ok(()) => ConnectivityReport::Connected,
        Err(e) => ConnectivityReport::Error(format!("{e:#}")),
    }
}

/// Check eagerly, then every `every`.
pub async fn run<S: StateStore>(store: S, every: Duration, events: mpsc::Sender<Event>) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let report = check(&store).await;
        if events.send(Event::Connectivity(report)).await.is_err() {
            break;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn raised_flag_is_cleared_and_reported_once() {
        let store = MemoryStore::new();
        store.put("isConnected", json!(true));

        assert_eq!(check(&store).await, ConnectivityReport::Connected);
        assert_eq!(store.get("isConnected"), Some(json!(false)));
        assert_eq!(check(&store).await, ConnectivityReport::NotConnected);
    }

    #[tokio::test]
    async fn lowered_flag_is_left_alone() {
        let store = MemoryStore::new();
        store.put("isConnected", json!(false));

        for _ in 0..3 {
            assert_eq!(check(&store).await, ConnectivityReport::NotConnected);
        }
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn absent_flag_is_not_connected() {
        let store = MemoryStore::new();
        assert_eq!(check(&store).await, ConnectivityReport::NotConnected);
    }

    #[tokio::test]
    async fn read_failure_is_an_error_report() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        let report = check(&store).await;
        assert!(matches!(report, ConnectivityReport::Error(_)));
        assert!(report.message().starts_with("Error checking connection status: "));
    }

    #[tokio::test]
    async fn failed_ack_is_an_error_report() {
        let store = MemoryStore::new();
        store.put("isConnected", json!(1));
        store.fail_writes_to("isConnected");

        let report = check(&store).await;
        assert!(matches!(report, ConnectivityReport::Error(ref e) if e.contains("acknowledging")));
    }

    #[test]
    fn messages() {
        assert_eq!(ConnectivityReport::Connected.message(), "Device Connected");
        assert_eq!(ConnectivityReport::NotConnected.message(), "Device Not Connected");
    }
}
