//! Stateful rig simulator for local development: four soil-moisture probes
//! (percent), plus air temperature and humidity.
//!
//! Models plausible probe behaviour:
//! - Temporal coherence via random walk with mean reversion
//! - Gradual drying drift (evaporation)
//! - Per-reading electronic noise
//! - Occasional spikes (sensor flakiness)
//! - Diurnal (day/night) cycle, shared with temperature and humidity
//! - Per-probe calibration offsets
//! - Closed-loop watering response per plant (moisture rises while its
//!   pump runs)

use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range and dries past the low threshold. Moderate noise,
    /// ~3% spike rate. Exercises Auto mode and low-moisture alerts.
    Drying,
    /// Hovers near the centre. Low noise, rare spikes.
    Stable,
    /// High noise, ~10% spike rate, larger spikes.
    Flaky,
    /// Starts near saturation and dries very slowly; the controller should
    /// leave every pump off.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-plant state
// ---------------------------------------------------------------------------

struct PlantState {
    /// Current "true" soil moisture in percent. Evolves each tick.
    base: f64,
    /// Permanent calibration offset (percentage points).
    offset: f64,
    noise_sigma: f64,
    watering: bool,
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

pub struct RigSim {
    plants: Vec<PlantState>,

    // Random walk parameters
    drift_per_sample: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    center: f64,

    // Spike parameters
    spike_prob: f32,
    spike_sigma: f64,

    // Diurnal cycle
    diurnal_amplitude: f64,
    diurnal_period_s: f64,

    /// Percentage points gained per sample while a plant's pump runs.
    wet_rate: f64,
}

impl RigSim {
    /// Create a simulator for `plant_count` probes.
    ///
    /// `diurnal_period_s` controls the day/night cycle length. Use 600
    /// (10 min) for fast dev iteration or 86400 for real-time.
    pub fn new(scenario: Scenario, plant_count: usize, diurnal_period_s: f64) -> Self {
        let (drift, walk_sigma, mean_rev, noise_sigma, spike_prob, spike_sigma, start) =
            match scenario {
                // drift is negative: evaporation makes soil drier
                Scenario::Drying => (-0.8, 0.4, 0.02, 0.3, 0.03_f32, 6.0, 50.0),
                Scenario::Stable => (-0.05, 0.15, 0.05, 0.15, 0.005, 3.0, 50.0),
                Scenario::Flaky => (-0.25, 0.7, 0.02, 1.2, 0.10, 10.0, 50.0),
                Scenario::Wet => (-0.1, 0.2, 0.02, 0.2, 0.02, 4.0, 80.0),
            };

        let plants = (0..plant_count)
            .map(|_| {
                let jitter = gaussian(0.0, 3.0);
                let offset = gaussian(0.0, 2.0);
                let sensor_noise = noise_sigma * (1.0 + 0.2 * approx_std_normal()).max(0.3);
                PlantState {
                    base: (start + jitter).clamp(0.0, 100.0),
                    offset,
                    noise_sigma: sensor_noise,
                    watering: false,
                }
            })
            .collect();

        Self {
            plants,
            drift_per_sample: drift,
            walk_sigma,
            mean_reversion: mean_rev,
            center: 50.0,
            spike_prob,
            spike_sigma,
            diurnal_amplitude: 3.0,
            diurnal_period_s,
            wet_rate: 2.0,
        }
    }

    /// Inform the simulator whether plant `index`'s pump is running.
    pub fn set_watering(&mut self, index: usize, active: bool) {
        if let Some(plant) = self.plants.get_mut(index) {
            plant.watering = active;
        }
    }

    pub fn stop_all_watering(&mut self) {
        for plant in &mut self.plants {
            plant.watering = false;
        }
    }

    /// Produce the next moisture reading (percent, one decimal) for plant
    /// `index`.
    ///
    /// Call this once per plant per sampling tick. The internal base value
    /// evolves with each call, so the order and frequency of calls matters.
    pub fn sample(&mut self, index: usize) -> f64 {
        let phase = self.diurnal_phase();
        let Some(plant) = self.plants.get_mut(index) else {
            return 0.0;
        };

        // -- Evolve the base value ----------------------------------------

        let pull = self.mean_reversion * (self.center - plant.base);
        let walk = gaussian(0.0, self.walk_sigma);
        let wet = if plant.watering { self.wet_rate } else { 0.0 };

        plant.base = (plant.base + self.drift_per_sample + pull + walk + wet).clamp(0.0, 100.0);

        // -- Build the instantaneous reading ------------------------------

        // Soil reads a little drier in the afternoon heat.
        let diurnal = -self.diurnal_amplitude * phase.sin();
        let noise = gaussian(0.0, plant.noise_sigma);
        let spike = if fastrand::f32() < self.spike_prob {
            gaussian(0.0, self.spike_sigma)
        } else {
            0.0
        };

        let reading = plant.base + plant.offset + diurnal + noise + spike;
        round1(reading.clamp(0.0, 100.0))
    }

    /// Air temperature in °C.
    pub fn temperature(&self) -> f64 {
        round1(gaussian(24.0 + 4.0 * self.diurnal_phase().sin(), 0.3))
    }

    /// Relative humidity in percent; lowest when it is warmest.
    pub fn humidity(&self) -> f64 {
        round1(gaussian(55.0 - 10.0 * self.diurnal_phase().sin(), 1.0).clamp(0.0, 100.0))
    }

    /// Number of simulated plants.
    pub fn plant_count(&self) -> usize {
        self.plants.len()
    }

    /// Day/night phase in radians; peaks at "afternoon" (period/4).
    fn diurnal_phase(&self) -> f64 {
        let now_s = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        2.0 * std::f64::consts::PI * now_s / self.diurnal_period_s
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ===========================================================================
// Tests
// ===========================================================================
