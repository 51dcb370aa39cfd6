//! Sensor snapshot cache: the latest temperature, humidity and moisture
//! readings, refreshed by polling the store.

use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::actuator::ACTUATORS;
use crate::controller::Event;
use crate::store::{as_f64, keys, StateStore};

/// Readings from one refresh. Any field may be unset until it is first read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SensorSnapshot {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    /// Soil moisture percent, plant 1 first.
    pub moisture: [Option<f64>; ACTUATORS],
}

impl SensorSnapshot {
    /// Plant numbers (1-based) whose moisture is below `low`.
    pub fn low_plants(&self, low: f64) -> Vec<usize> {
        self.moisture
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_some_and(|m| m < low))
            .map(|(i, _)| i + 1)
            .collect()
    }
}

const FIELDS: [&str; 6] = [
    keys::TEMP,
    keys::HUMIDITY,
    keys::PLANTS[0],
    keys::PLANTS[1],
    keys::PLANTS[2],
    keys::PLANTS[3],
];

/// Read every sensor field in parallel and build a fresh snapshot.
///
/// Fields that fail, are absent, or are not numeric come back unset. Only
/// when every read fails is the refresh itself an error.
pub async fn refresh<S: StateStore>(store: &S) -> Result<SensorSnapshot> {
    let (temp, humidity, p1, p2, p3, p4) = tokio::join!(
        store.read(FIELDS[0]),
        store.read(FIELDS[1]),
        store.read(FIELDS[2]),
        store.read(FIELDS[3]),
        store.read(FIELDS[4]),
        store.read(FIELDS[5]),
    );
    let results = [temp, humidity, p1, p2, p3, p4];

    if results.iter().all(Result::is_err) {
        let err = results
            .into_iter()
            .find_map(Result::err)
            .unwrap_or_else(|| anyhow!("no sensor fields"));
        return Err(err.context("all sensor reads failed"));
    }

    let mut values = FIELDS.into_iter().zip(results).map(|(key, result)| match result {
        Ok(Some(value)) => numeric(key, &value),
        Ok(None) => None,
        Err(e) => {
            debug!(key, "sensor read failed: {e:#}");
            None
        }
    });
    let mut next = || values.next().flatten();

    Ok(SensorSnapshot {
        temperature: next(),
        humidity: next(),
        moisture: [next(), next(), next(), next()],
    })
}

fn numeric(key: &str, value: &Value) -> Option<f64> {
    let v = as_f64(value);
    if v.is_none() {
        debug!(key, %value, "non-numeric sensor value");
    }
    v
}

/// Refresh eagerly, then every `every`, handing each result to the
/// controller. Ends when the controller goes away.
pub async fn run<S: StateStore>(store: S, every: Duration, events: mpsc::Sender<Event>) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let result = refresh(&store).await;
        if events.send(Event::Snapshot(result)).await.is_err() {
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
    async fn refresh_reads_every_field() {
        let store = MemoryStore::new();
        store.put("Temp", json!(24.5));
        store.put("Humidity", json!(61));
        for (i, key) in keys::PLANTS.iter().enumerate() {
            store.put(key, json!(10.0 * (i + 1) as f64));
        }

        let snap = refresh(&store).await.unwrap();
        assert_eq!(snap.temperature, Some(24.5));
        assert_eq!(snap.humidity, Some(61.0));
        assert_eq!(snap.moisture, [Some(10.0), Some(20.0), Some(30.0), Some(40.0)]);
    }

    #[tokio::test]
    async fn absent_and_non_numeric_fields_are_unset() {
        let store = MemoryStore::new();
        store.put("Temp", json!("warm"));
        store.put("Plant_2", json!(55.0));

        let snap = refresh(&store).await.unwrap();
        assert_eq!(snap.temperature, None);
        assert_eq!(snap.humidity, None);
        assert_eq!(snap.moisture, [None, Some(55.0), None, None]);
    }

    #[tokio::test]
    async fn refresh_fails_when_every_read_fails() {
        let store = MemoryStore::new();
        store.put("Temp", json!(20.0));
        store.set_unavailable(true);

        let err = refresh(&store).await.unwrap_err();
        assert!(format!("{err:#}").contains("all sensor reads failed"));
    }

    #[test]
    fn low_plants_are_one_based() {
        let snap = SensorSnapshot {
            moisture: [Some(5.0), Some(50.0), Some(19.9), None],
            ..SensorSnapshot::default()
        };
        assert_eq!(snap.low_plants(20.0), vec![1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_refreshes_eagerly_and_periodically() {
        let store = MemoryStore::new();
        store.put("Plant_1", json!(42.0));
        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn(run(store.clone(), Duration::from_secs(5), tx));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Event::Snapshot(Ok(s)) if s.moisture[0] == Some(42.0)));

        store.put("Plant_1", json!(12.0));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, Event::Snapshot(Ok(s)) if s.moisture[0] == Some(12.0)));

        task.abort();
    }
}
