//! Auto-mode hysteresis: each actuator turns on when its plant's moisture
//! drops below the low threshold and stays on until moisture reaches the
//! high threshold.
//!
//! ```text
//!        m < low                       m >= high
//!  OFF ───────────────▶ ON ───────────────────────▶ OFF
//!   ▲                    │
//!   └── low <= m ────────┘ (no change while low <= m < high)
//! ```

use serde::Serialize;

use crate::actuator::ACTUATORS;

/// Moisture (percent) below which an actuator turns on.
pub const LOW_THRESHOLD: f64 = 20.0;

/// Moisture (percent) at or above which a running actuator turns off.
pub const HIGH_THRESHOLD: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    pub low: f64,
    pub high: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            low: LOW_THRESHOLD,
            high: HIGH_THRESHOLD,
        }
    }
}

/// Next state of a single actuator.
pub fn next_state(moisture: f64, previous: bool, t: Thresholds) -> bool {
    moisture < t.low || (previous && moisture < t.high)
}

/// Next state of every actuator, all computed from the same readings.
/// A missing or non-finite reading leaves that actuator unchanged.
pub fn decide(
    moisture: &[Option<f64>; ACTUATORS],
    previous: [bool; ACTUATORS],
    t: Thresholds,
) -> [bool; ACTUATORS] {
    std::array::from_fn(|i| match moisture[i] {
        Some(m) if m.is_finite() => next_state(m, previous[i], t),
        _ => previous[i],
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const T: Thresholds = Thresholds {
        low: LOW_THRESHOLD,
        high: HIGH_THRESHOLD,
    };

    #[test]
    fn off_actuator_turns_on_only_below_low() {
        let mut m = 0.0;
        while m <= 100.0 {
            assert_eq!(next_state(m, false, T), m < 20.0, "m={m}");
            m += 0.5;
        }
    }

    #[test]
    fn on_actuator_stays_on_until_high() {
        let mut m = 0.0;
        while m <= 100.0 {
            assert_eq!(next_state(m, true, T), m < 80.0, "m={m}");
            m += 0.5;
        }
    }

    #[test]
    fn thresholds_are_exclusive() {
        assert!(!next_state(20.0, false, T));
        assert!(next_state(19.99, false, T));
        assert!(!next_state(80.0, true, T));
        assert!(next_state(79.99, true, T));
    }

    #[test]
    fn mixed_readings_scenario() {
        let moisture = [Some(15.0), Some(25.0), Some(85.0), None];
        let previous = [false, true, true, false];
        assert_eq!(decide(&moisture, previous, T), [true, true, false, false]);
    }

    #[test]
    fn missing_reading_keeps_previous_state() {
        let moisture = [None, None, Some(f64::NAN), Some(f64::INFINITY)];
        let previous = [true, false, true, false];
        assert_eq!(decide(&moisture, previous, T), previous);
    }

    #[test]
    fn custom_thresholds_apply() {
        let t = Thresholds {
            low: 30.0,
            high: 60.0,
        };
        assert!(next_state(29.0, false, t));
        assert!(!next_state(30.0, false, t));
        assert!(next_state(59.0, true, t));
        assert!(!next_state(60.0, true, t));
    }

    #[test]
    fn no_chatter_between_thresholds() {
        // Moisture oscillating inside the band never flips the state.
        let readings = [45.0, 55.0, 21.0, 79.0, 50.0];
        let mut on = true;
        for m in readings {
            on = next_state(m, on, T);
            assert!(on);
        }
        let mut off = false;
        for m in readings {
            off = next_state(m, off, T);
            assert!(!off);
        }
    }
}
