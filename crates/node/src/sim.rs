//! Stateful soil moisture simulator for running the controller without a
//! sensor.
//!
//! Models a single capacitive probe in percent:
//! - random walk with mean reversion
//! - steady drying drift
//! - per-reading noise and occasional spikes
//! - closed-loop response: moisture climbs while the pump runs
//!
//! A matching raw ADC value is derived from the percent reading so the hub
//! receives the same payload shape a real probe would produce.

use std::fmt;

/// ADC endpoints for a typical capacitive probe on a 16-bit converter.
const RAW_DRY: f64 = 26000.0;
const RAW_WET: f64 = 12000.0;

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

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-band and dries steadily, so auto mode cycles the pump.
    Drying,
    /// Hovers mid-band with little noise. Auto mode should stay idle.
    Stable,
    /// Heavy noise and frequent spikes around a drying trend.
    Flaky,
    /// Starts saturated and dries very slowly.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying,
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
// Simulator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimReading {
    /// Percent, 0 (bone dry) to 100 (saturated).
    pub moisture: f64,
    pub raw: i64,
}

pub struct MoistureSim {
    scenario: Scenario,
    /// Current "true" soil moisture in percent. Evolves each sample.
    base: f64,

    drift_per_sample: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    center: f64,
    noise_sigma: f64,

    spike_prob: f32,
    spike_sigma: f64,

    watering: bool,
    wet_rate: f64,
}

impl MoistureSim {
    pub fn new(scenario: Scenario) -> Self {
        // (drift, walk, reversion, center, noise, spike prob, spike sigma, start)
        let (drift, walk_sigma, mean_rev, center, noise, spike_prob, spike_sigma, start) =
            match scenario {
                Scenario::Drying => (-0.15, 0.3, 0.002, 30.0, 0.5, 0.03_f32, 12.0, 50.0),
                Scenario::Stable => (0.0, 0.1, 0.05, 50.0, 0.2, 0.005, 6.0, 50.0),
                Scenario::Flaky => (-0.1, 0.6, 0.002, 30.0, 2.0, 0.10, 20.0, 50.0),
                Scenario::Wet => (-0.02, 0.2, 0.01, 75.0, 0.4, 0.02, 8.0, 85.0),
            };

        Self {
            scenario,
            base: (start + gaussian(0.0, 2.0)).clamp(0.0, 100.0),
            drift_per_sample: drift,
            walk_sigma,
            mean_reversion: mean_rev,
            center,
            noise_sigma: noise,
            spike_prob,
            spike_sigma,
            watering: false,
            wet_rate: 1.5,
        }
    }

    pub fn scenario(&self) -> Scenario {
        self.scenario
    }

    /// Tell the simulator whether the pump is currently running.
    pub fn set_watering(&mut self, active: bool) {
        self.watering = active;
    }

    /// Advances the model one step and returns the next reading.
    pub fn sample(&mut self) -> SimReading {
        let pull = self.mean_reversion * (self.center - self.base);
        let walk = gaussian(0.0, self.walk_sigma);
        let wet = if self.watering { self.wet_rate } else { 0.0 };

        self.base = (self.base + self.drift_per_sample + pull + walk + wet).clamp(0.0, 100.0);

        let noise = gaussian(0.0, self.noise_sigma);
        let spike = if fastrand::f32() < self.spike_prob {
            gaussian(0.0, self.spike_sigma)
        } else {
            0.0
        };

        let moisture = ((self.base + noise + spike) * 10.0).round() / 10.0;
        let moisture = moisture.clamp(0.0, 100.0);
        SimReading {
            moisture,
            raw: to_raw(moisture),
        }
    }
}

/// Inverse of the hub-side calibration: 0 % maps to `RAW_DRY`.
fn to_raw(moisture: f64) -> i64 {
    (RAW_DRY - moisture / 100.0 * (RAW_DRY - RAW_WET)).round() as i64
}

// ===========================================================================
// Tests
// ===========================================================================
