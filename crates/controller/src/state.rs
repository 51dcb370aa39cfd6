use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::actuator::ACTUATORS;
use crate::control::Thresholds;
use crate::handshake::ConnectivityReport;
use crate::mode::Mode;
use crate::notify::LowMoistureAlert;
use crate::scheduler::TimerState;
use crate::snapshot::SensorSnapshot;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

/// Read-mostly view of the controller, written by the controller task and
/// read by the HTTP surface.
pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub backend: &'static str,
    /// True until the first `operation_mode` value has been awaited.
    pub loading: bool,
    pub mode: Mode,
    pub rejected_mode: Option<String>,
    pub thresholds: Thresholds,
    pub motors: [MotorState; ACTUATORS],
    pub timer: TimerState,
    pub sensors: SensorSnapshot,
    pub sensors_updated: Option<OffsetDateTime>,
    pub refresh_error: Option<String>,
    pub connectivity: Option<ConnectivityReport>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Copy, Default, Serialize)]
pub struct MotorState {
    pub on: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_changed: Option<OffsetDateTime>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Mode,
    Motor,
    Timer,
    Connectivity,
    Alert,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub backend: &'static str,
    pub loading: bool,
    pub mode: Mode,
    pub rejected_mode: Option<String>,
    pub thresholds: Thresholds,
    pub motors: [MotorState; ACTUATORS],
    pub timer: TimerView,
    pub sensors: SensorSnapshot,
    #[serde(with = "time::serde::rfc3339::option")]
    pub sensors_updated: Option<OffsetDateTime>,
    pub refresh_error: Option<String>,
    pub connectivity: Option<ConnectivityView>,
    pub events: Vec<SystemEvent>,
}

#[derive(Serialize)]
pub struct TimerView {
    pub countdown: u32,
    pub counting: bool,
    pub period_hours: u8,
    /// `H:MM:SS`
    pub remaining: String,
}

#[derive(Serialize)]
pub struct ConnectivityView {
    pub report: ConnectivityReport,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(backend: &'static str, thresholds: Thresholds, timer: TimerState) -> Self {
        Self {
            started_at: Instant::now(),
            backend,
            loading: true,
            mode: Mode::default(),
            rejected_mode: None,
            thresholds,
            motors: [MotorState::default(); ACTUATORS],
            timer,
            sensors: SensorSnapshot::default(),
            sensors_updated: None,
            refresh_error: None,
            connectivity: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record a mode transition. `origin` says who asked for it.
    pub fn record_mode(&mut self, from: Mode, to: Mode, origin: &str) {
        self.mode = to;
        self.rejected_mode = None;
        self.push_event(EventKind::Mode, format!("{from} -> {to} ({origin})"));
    }

    /// Record an external mode value that was not accepted.
    pub fn record_rejected_mode(&mut self, raw: String) {
        self.push_event(
            EventKind::Error,
            format!("rejected operation_mode {raw}; staying in {}", self.mode),
        );
        self.rejected_mode = Some(raw);
    }

    /// Record an actuator state change. `index` is 0-based.
    pub fn record_motor(&mut self, index: usize, on: bool) {
        let Some(motor) = self.motors.get_mut(index) else {
            return;
        };
        motor.on = on;
        motor.last_changed = Some(OffsetDateTime::now_utc());

        let state_str = if on { "ON" } else { "OFF" };
        self.push_event(EventKind::Motor, format!("motor {} set {state_str}", index + 1));
    }

    pub fn record_timer(&mut self, detail: String) {
        self.push_event(EventKind::Timer, detail);
    }

    /// Take a refresh result. A failure keeps the last snapshot; only the
    /// first of a run of failures becomes an event.
    pub fn record_snapshot(&mut self, result: &anyhow::Result<SensorSnapshot>) {
        match result {
            Ok(snapshot) => {
                self.sensors = *snapshot;
                self.sensors_updated = Some(OffsetDateTime::now_utc());
                if self.refresh_error.take().is_some() {
                    self.push_event(EventKind::System, "sensor refresh recovered".to_string());
                }
            }
            Err(e) => {
                let msg = format!("{e:#}");
                if self.refresh_error.is_none() {
                    self.push_event(EventKind::Error, format!("sensor refresh failed: {msg}"));
                }
                self.refresh_error = Some(msg);
            }
        }
    }

    /// Keep the latest handshake report; only changes become events.
    pub fn record_connectivity(&mut self, report: ConnectivityReport) {
        if self.connectivity.as_ref() != Some(&report) {
            self.push_event(EventKind::Connectivity, report.message());
        }
        self.connectivity = Some(report);
    }

    pub fn record_alert(&mut self, alert: &LowMoistureAlert) {
        self.push_event(EventKind::Alert, alert.message.clone());
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            backend: self.backend,
            loading: self.loading,
            mode: self.mode,
            rejected_mode: self.rejected_mode.clone(),
            thresholds: self.thresholds,
            motors: self.motors,
            timer: TimerView {
                countdown: self.timer.countdown,
                counting: self.timer.counting,
                period_hours: self.timer.period_hours,
                remaining: self.timer.remaining_hms(),
            },
            sensors: self.sensors,
            sensors_updated: self.sensors_updated,
            refresh_error: self.refresh_error.clone(),
            connectivity: self.connectivity.clone().map(|report| ConnectivityView {
                message: report.message(),
                report,
            }),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
