//! Timer-mode countdown scheduler.
//!
//! The countdown is persisted in the store (`timer`, `isCounting`,
//! `timer_hours`) so a restarted controller, or a second client, resumes the
//! same cycle instead of starting over. Each tick is a pure transition of
//! [`TimerState`]; the controller persists whatever the tick reports.
//!
//! ```text
//!  counting, n > 1 ──tick──▶ n - 1                 (persist n - 1)
//!  counting, n <= 1 ─tick──▶ period * 3600 + pulse (persist reset)
//!  stopped ─────────tick──▶ unchanged
//! ```

use serde::Serialize;

pub const SECONDS_PER_HOUR: u32 = 3600;
pub const MIN_HOURS: u8 = 1;
pub const MAX_HOURS: u8 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimerState {
    /// Seconds until the next activation pulse.
    pub countdown: u32,
    pub counting: bool,
    /// Cycle length, `MIN_HOURS..=MAX_HOURS`.
    pub period_hours: u8,
}

/// What a tick did, and therefore what must be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    Counted { remaining: u32 },
    Expired { reset_to: u32 },
}

/// Validate a period selection.
pub fn period_hours(hours: u64) -> Option<u8> {
    u8::try_from(hours)
        .ok()
        .filter(|h| (MIN_HOURS..=MAX_HOURS).contains(h))
}

/// Advance the countdown by one second.
pub fn tick(state: TimerState) -> (TimerState, TickOutcome) {
    if !state.counting {
        return (state, TickOutcome::Idle);
    }

    let remaining = state.countdown.saturating_sub(1);
    if remaining > 0 {
        let next = TimerState {
            countdown: remaining,
            ..state
        };
        return (next, TickOutcome::Counted { remaining });
    }

    let reset_to = state.full_period();
    let next = TimerState {
        countdown: reset_to,
        ..state
    };
    (next, TickOutcome::Expired { reset_to })
}

impl TimerState {
    pub fn new(period_hours: u8) -> Self {
        Self {
            countdown: 0,
            counting: false,
            period_hours: period_hours.clamp(MIN_HOURS, MAX_HOURS),
        }
    }

    pub fn full_period(&self) -> u32 {
        u32::from(self.period_hours) * SECONDS_PER_HOUR
    }

    /// Stopped and zeroed, as after a mode switch.
    pub fn stopped(self) -> Self {
        Self {
            countdown: 0,
            counting: false,
            ..self
        }
    }

    /// A new `hours` cycle running from its full duration.
    pub fn restarted(self, hours: u8) -> Self {
        let period_hours = hours.clamp(MIN_HOURS, MAX_HOURS);
        Self {
            countdown: u32::from(period_hours) * SECONDS_PER_HOUR,
            counting: true,
            period_hours,
        }
    }

    /// Mirror a countdown read from the store. A value longer than the
    /// current period stretches the period to fit (up to `MAX_HOURS`).
    pub fn with_countdown(self, seconds: u64) -> Self {
        let max = u64::from(MAX_HOURS) * u64::from(SECONDS_PER_HOUR);
        let countdown = seconds.min(max) as u32;
        let needed = countdown.div_ceil(SECONDS_PER_HOUR) as u8;
        Self {
            countdown,
            period_hours: self.period_hours.max(needed),
            ..self
        }
    }

    pub fn with_counting(self, counting: bool) -> Self {
        Self { counting, ..self }
    }

    /// Mirror a period read from the store; the countdown is clamped to it.
    pub fn with_period(self, hours: u8) -> Self {
        let period_hours = hours.clamp(MIN_HOURS, MAX_HOURS);
        let full = u32::from(period_hours) * SECONDS_PER_HOUR;
        Self {
            period_hours,
            countdown: self.countdown.min(full),
            ..self
        }
    }

    /// Remaining time as `H:MM:SS`.
    pub fn remaining_hms(&self) -> String {
        let hrs = self.countdown / 3600;
        let mins = (self.countdown % 3600) / 60;
        let secs = self.countdown % 60;
        format!("{hrs}:{mins:02}:{secs:02}")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
