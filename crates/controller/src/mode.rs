//! Operating modes and the local mirror of the remote `operation_mode` field.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum Mode {
    /// Actuators change only on explicit user toggles.
    #[default]
    Manual,
    /// The hysteresis loop owns the actuators.
    Auto,
    /// The countdown scheduler pulses the actuators on expiry.
    Timer,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Manual, Mode::Auto, Mode::Timer];

    /// Canonical spelling, as written to the store.
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Manual => "Manual",
            Mode::Auto => "Auto",
            Mode::Timer => "Timer",
        }
    }

    /// Parse a value pushed from the store. Only strings naming a mode pass.
    pub fn from_value(value: &Value) -> Result<Self, UnknownMode> {
        match value {
            Value::String(s) => s.parse(),
            other => Err(UnknownMode(other.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = UnknownMode;

    /// Case-insensitive, surrounding whitespace ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Mode::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownMode(s.to_string()))
    }
}

impl From<Mode> for Value {
    fn from(mode: Mode) -> Self {
        Value::String(mode.as_str().to_string())
    }
}

/// A mode value outside {Manual, Auto, Timer}.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMode(pub String);

impl fmt::Display for UnknownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown operation mode '{}' (expected Manual, Auto or Timer)", self.0)
    }
}

impl std::error::Error for UnknownMode {}

// ---------------------------------------------------------------------------
// Mode machine
// ---------------------------------------------------------------------------

/// What an external notification did to the local mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    Changed { from: Mode, to: Mode },
    Unchanged,
    Rejected(UnknownMode),
}

/// Local copy of the authoritative mode. A notification from the store
/// always wins over the local value; a local request is applied
/// optimistically before the remote write lands.
#[derive(Debug)]
pub struct ModeMachine {
    current: Mode,
}

impl ModeMachine {
    pub fn new(initial: Mode) -> Self {
        Self { current: initial }
    }

    pub fn current(&self) -> Mode {
        self.current
    }

    /// Switch locally. Returns the previous mode.
    pub fn request(&mut self, mode: Mode) -> Mode {
        std::mem::replace(&mut self.current, mode)
    }

    /// Apply a pushed `operation_mode` value. Unknown values leave the
    /// current mode in place.
    pub fn observe(&mut self, value: &Value) -> Observed {
        match Mode::from_value(value) {
            Ok(mode) => {
                let from = std::mem::replace(&mut self.current, mode);
                if from == mode {
                    Observed::Unchanged
                } else {
                    Observed::Changed { from, to: mode }
                }
            }
            Err(e) => Observed::Rejected(e),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
