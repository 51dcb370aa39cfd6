//! Low-moisture alerts, rate limited so a dry plant does not page someone
//! every five seconds.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::snapshot::SensorSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LowMoistureAlert {
    /// 1-based plant numbers.
    pub plants: Vec<usize>,
    pub message: String,
}

pub fn format_low_moisture_alert(plants: &[usize]) -> String {
    let noun = if plants.len() == 1 { "Plant" } else { "Plants" };
    let list = plants
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!("Low moisture levels detected in {noun} {list}! Please check your irrigation system.")
}

pub struct AlertNotifier {
    enabled: bool,
    cooldown: Duration,
    last_sent: Option<Instant>,
}

impl AlertNotifier {
    pub fn new(enabled: bool, cooldown: Duration) -> Self {
        Self {
            enabled,
            cooldown,
            last_sent: None,
        }
    }

    /// Decide whether `snapshot` warrants an alert at `now`. A returned alert
    /// counts as sent and starts the cooldown.
    pub fn evaluate(
        &mut self,
        snapshot: &SensorSnapshot,
        low: f64,
        now: Instant,
    ) -> Option<LowMoistureAlert> {
        if !self.enabled {
            return None;
        }
        let plants = snapshot.low_plants(low);
        if plants.is_empty() {
            return None;
        }
        if let Some(last) = self.last_sent {
            if now.saturating_duration_since(last) < self.cooldown {
                return None;
            }
        }

        self.last_sent = Some(now);
        let message = format_low_moisture_alert(&plants);
        Some(LowMoistureAlert { plants, message })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
