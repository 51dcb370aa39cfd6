//! Pump relays via GPIO. The `gpio` feature gates the real rppal driver;
//! without it, a mock implementation logs state changes.

use anyhow::{bail, Result};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// BCM pins for motor 1..4 when `RELAY_PINS` is unset.
pub const DEFAULT_PINS: [u8; 4] = [17, 27, 22, 23];

/// Parse a comma-separated BCM pin list such as `"17,27,22,23"`.
pub fn parse_pins(s: &str) -> Result<Vec<u8>> {
    let mut pins = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let pin: u8 = match part.parse() {
            Ok(pin) => pin,
            Err(_) => bail!("invalid GPIO pin '{part}'"),
        };
        // GPIO 0-1 are reserved for the ID EEPROM; 28+ are not on the header.
        if !(2..=27).contains(&pin) {
            bail!("GPIO pin {pin} is not a usable BCM pin (allowed: 2-27)");
        }
        if pins.contains(&pin) {
            bail!("GPIO pin {pin} listed twice");
        }
        pins.push(pin);
    }
    if pins.is_empty() {
        bail!("no relay pins given");
    }
    Ok(pins)
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct RelayBoard {
    pins: Vec<OutputPin>, // motor index -> GPIO pin
    active_low: bool,     // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl RelayBoard {
    pub(crate) fn new(pins: &[u8], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut out = Vec::with_capacity(pins.len());

        for &pin_num in pins {
            let mut pin = gpio.get(pin_num)?.into_output();

            // Fail-safe: ensure "OFF" at startup
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }
            out.push(pin);
        }

        Ok(Self {
            pins: out,
            active_low,
        })
    }

    pub(crate) fn set(&mut self, index: usize, on: bool) {
        let Some(pin) = self.pins.get_mut(index) else {
            tracing::warn!(motor = index + 1, "no relay wired for motor");
            return;
        };
        // active-low relay: LOW = ON, HIGH = OFF
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        tracing::info!(motor = index + 1, on, "relay switched");
    }

    pub(crate) fn all_off(&mut self) {
        for index in 0..self.pins.len() {
            self.set(index, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct RelayBoard {
    pub(super) states: Vec<bool>, // motor index -> on/off
}

#[cfg(not(feature = "gpio"))]
impl RelayBoard {
    pub(crate) fn new(pins: &[u8], _active_low: bool) -> Result<Self> {
        for (i, pin_num) in pins.iter().enumerate() {
            tracing::info!(motor = i + 1, gpio = pin_num, "[mock-gpio] relay registered (not wired)");
        }
        Ok(Self {
            states: vec![false; pins.len()],
        })
    }

    pub(crate) fn set(&mut self, index: usize, on: bool) {
        if let Some(state) = self.states.get_mut(index) {
            *state = on;
            tracing::info!(motor = index + 1, on, "[mock-gpio] relay switched");
        } else {
            tracing::warn!(motor = index + 1, "[mock-gpio] no relay wired for motor");
        }
    }

    pub(crate) fn all_off(&mut self) {
        for index in 0..self.states.len() {
            self.set(index, false);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
