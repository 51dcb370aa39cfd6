//! TOML tuning file: thresholds, tick rates, store timeouts and alerting.
//! Deployment knobs (broker address, ports, backend) come from the
//! environment instead; see `main.rs`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::control::{Thresholds, HIGH_THRESHOLD, LOW_THRESHOLD};
use crate::scheduler::{MAX_HOURS, MIN_HOURS};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub control: ControlConfig,
    pub timer: TimerConfig,
    pub sensors: SensorsConfig,
    pub handshake: HandshakeConfig,
    pub store: StoreConfig,
    pub alerts: AlertsConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlConfig {
    pub low_threshold: f64,
    pub high_threshold: f64,
    pub tick_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimerConfig {
    pub default_hours: u8,
    pub tick_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SensorsConfig {
    pub refresh_sec: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HandshakeConfig {
    pub interval_sec: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub client_id: String,
    pub keep_alive_sec: u64,
    pub write_timeout_ms: u64,
    /// How long start-up waits for the first `operation_mode` value.
    pub initial_wait_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlertsConfig {
    pub enabled: bool,
    pub cooldown_sec: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            low_threshold: LOW_THRESHOLD,
            high_threshold: HIGH_THRESHOLD,
            tick_ms: 1000,
        }
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            default_hours: 1,
            tick_ms: 1000,
        }
    }
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self { refresh_sec: 5 }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self { interval_sec: 6 }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            client_id: "irrigation-controller".to_string(),
            keep_alive_sec: 30,
            write_timeout_ms: 2000,
            initial_wait_ms: 3000,
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_sec: 3600,
        }
    }
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl Config {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            low: self.control.low_threshold,
            high: self.control.high_threshold,
        }
    }

    pub fn control_tick(&self) -> Duration {
        Duration::from_millis(self.control.tick_ms)
    }

    pub fn countdown_tick(&self) -> Duration {
        Duration::from_millis(self.timer.tick_ms)
    }

    pub fn sensor_refresh(&self) -> Duration {
        Duration::from_secs(self.sensors.refresh_sec)
    }

    pub fn handshake_interval(&self) -> Duration {
        Duration::from_secs(self.handshake.interval_sec)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.store.keep_alive_sec)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.store.write_timeout_ms)
    }

    pub fn initial_wait(&self) -> Duration {
        Duration::from_millis(self.store.initial_wait_ms)
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_secs(self.alerts.cooldown_sec)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_control(&mut errors);
        self.validate_intervals(&mut errors);

        let hours = self.timer.default_hours;
        if !(MIN_HOURS..=MAX_HOURS).contains(&hours) {
            errors.push(format!(
                "timer.default_hours {hours} out of range [{MIN_HOURS}, {MAX_HOURS}]"
            ));
        }

        if self.store.client_id.trim().is_empty() {
            errors.push("store.client_id is empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_control(&self, errors: &mut Vec<String>) {
        let c = &self.control;
        for (name, value) in [
            ("low_threshold", c.low_threshold),
            ("high_threshold", c.high_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                errors.push(format!(
                    "control.{name} {value} out of range [0.0, 100.0]"
                ));
            }
        }
        if c.low_threshold >= c.high_threshold {
            errors.push(format!(
                "control.high_threshold ({}) must be greater than low_threshold ({})",
                c.high_threshold, c.low_threshold
            ));
        }
    }

    fn validate_intervals(&self, errors: &mut Vec<String>) {
        let intervals = [
            ("control.tick_ms", self.control.tick_ms),
            ("timer.tick_ms", self.timer.tick_ms),
            ("sensors.refresh_sec", self.sensors.refresh_sec),
            ("handshake.interval_sec", self.handshake.interval_sec),
            ("store.keep_alive_sec", self.store.keep_alive_sec),
            ("store.write_timeout_ms", self.store.write_timeout_ms),
            ("store.initial_wait_ms", self.store.initial_wait_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                errors.push(format!("{name} must be positive, got 0"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Like [`load`], but a missing file yields the defaults.
pub fn load_or_default(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        tracing::info!(path, "no config file; using defaults");
        return Ok(Config::default());
    }
    let config = load(path)?;
    tracing::info!(
        path,
        low = config.control.low_threshold,
        high = config.control.high_threshold,
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
