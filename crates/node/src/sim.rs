//! Stateful greenhouse simulator for local development.
//!
//! Models plausible sensor behaviour:
//! - Temporal coherence via random walk with mean reversion
//! - Slow drift (soil drying, tank consumption)
//! - Per-reading electronic noise
//! - Occasional spikes and failed reads (flaky scenario)
//! - Closed-loop response to the node's own outputs (heater warms, pump
//!   fills, and so on)

use std::fmt;

use crate::device::{Device, SharedRegistry};
use crate::sensor::{SensorSample, SensorSource};

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

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Everything hovers near comfortable values. Low noise.
    Stable,
    /// Ambient temperature sits well below the default heating target, so
    /// the hub's heater control and low-temperature alert both engage.
    Cold,
    /// Soil and air dry out steadily; watering and humidifier get work.
    Dry,
    /// High noise, frequent spikes, and ~5% of reads fail outright.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "cold" => Self::Cold,
            "dry" => Self::Dry,
            "flaky" => Self::Flaky,
            _ => Self::Stable, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Cold => write!(f, "cold"),
            Self::Dry => write!(f, "dry"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-quantity state
// ---------------------------------------------------------------------------

/// One simulated physical quantity.
struct Quantity {
    /// Current "true" value. Evolves each sample.
    value: f64,
    /// Value the quantity relaxes toward with no outputs running.
    ambient: f64,
    /// Constant per-sample drift (negative = drying / draining).
    drift: f64,
    walk_sigma: f64,
    noise_sigma: f64,
    lo: f64,
    hi: f64,
}

impl Quantity {
    fn new(start: f64, ambient: f64, walk_sigma: f64, noise_sigma: f64, lo: f64, hi: f64) -> Self {
        Self {
            value: start,
            ambient,
            drift: 0.0,
            walk_sigma,
            noise_sigma,
            lo,
            hi,
        }
    }

    fn with_drift(mut self, drift: f64) -> Self {
        self.drift = drift;
        self
    }

    /// Advance one sample. `push` is the effect of any running output.
    fn step(&mut self, mean_reversion: f64, push: f64) {
        let pull = mean_reversion * (self.ambient - self.value);
        let walk = gaussian(0.0, self.walk_sigma);
        self.value = (self.value + pull + walk + self.drift + push).clamp(self.lo, self.hi);
    }

    /// Instantaneous reading: true value plus noise and an optional spike.
    fn observe(&self, spike: f64) -> f64 {
        (self.value + gaussian(0.0, self.noise_sigma) + spike).clamp(self.lo, self.hi)
    }
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

/// Per-sample effect of each output while it is on.
const HEATING_RATE: f64 = 0.6; // °C
const WATERING_RATE: f64 = 2.0; // soil %
const HUMIDIFIER_RATE: f64 = 1.5; // RH %
const PUMP_RATE: f64 = 2.5; // tank %
const LIGHT_RATE: f64 = 6.0; // light %

pub struct EnvironmentSim {
    scenario: Scenario,
    registry: SharedRegistry,

    temperature: Quantity,
    soil_moisture: Quantity,
    humidity: Quantity,
    water_level: Quantity,
    ph: Quantity,
    light: Quantity,

    mean_reversion: f64,
    spike_prob: f32,
    spike_sigma: f64,
    fail_prob: f32,
}

impl EnvironmentSim {
    pub fn new(scenario: Scenario, registry: SharedRegistry) -> Self {
        let (ambient_temp, soil_drift, humidity_ambient, noise_scale) = match scenario {
            Scenario::Stable => (22.0, -0.05, 62.0, 1.0),
            Scenario::Cold => (8.0, -0.05, 62.0, 1.0),
            Scenario::Dry => (26.0, -0.6, 35.0, 1.0),
            Scenario::Flaky => (20.0, -0.1, 60.0, 4.0),
        };
        let (spike_prob, spike_sigma, fail_prob) = match scenario {
            Scenario::Flaky => (0.10_f32, 8.0, 0.05_f32),
            _ => (0.005, 3.0, 0.0),
        };

        Self {
            scenario,
            registry,
            temperature: Quantity::new(
                ambient_temp + 3.0,
                ambient_temp,
                0.15,
                0.1 * noise_scale,
                -10.0,
                50.0,
            ),
            soil_moisture: Quantity::new(70.0, 55.0, 0.3, 0.4 * noise_scale, 0.0, 100.0)
                .with_drift(soil_drift),
            humidity: Quantity::new(65.0, humidity_ambient, 0.4, 0.5 * noise_scale, 0.0, 100.0),
            water_level: Quantity::new(60.0, 60.0, 0.1, 0.3 * noise_scale, 0.0, 100.0)
                .with_drift(-0.15),
            ph: Quantity::new(6.25, 6.25, 0.01, 0.02 * noise_scale, 0.0, 14.0),
            light: Quantity::new(50.0, 50.0, 0.8, 0.8 * noise_scale, 0.0, 100.0),
            mean_reversion: 0.03,
            spike_prob,
            spike_sigma,
            fail_prob,
        }
    }

    pub fn scenario(&self) -> Scenario {
        self.scenario
    }

    fn outputs(&self) -> impl Fn(Device) -> f64 {
        let snapshot = match self.registry.lock() {
            Ok(reg) => reg.snapshot(),
            Err(poisoned) => poisoned.into_inner().snapshot(),
        };
        move |device| {
            if snapshot.get(&device).copied().unwrap_or(false) {
                1.0
            } else {
                0.0
            }
        }
    }

    fn spike(&self) -> f64 {
        if fastrand::f32() < self.spike_prob {
            gaussian(0.0, self.spike_sigma)
        } else {
            0.0
        }
    }

    /// Advance every quantity by one sample.
    fn step(&mut self) {
        let on = self.outputs();
        let r = self.mean_reversion;

        self.temperature.step(r, HEATING_RATE * on(Device::Heating));
        self.soil_moisture.step(r, WATERING_RATE * on(Device::Watering));
        self.humidity.step(r, HUMIDIFIER_RATE * on(Device::Humidifier));
        self.water_level.step(r, PUMP_RATE * on(Device::WaterPump));
        self.ph.step(r, 0.0);
        self.light.step(r, LIGHT_RATE * on(Device::Lightning));
    }
}

impl SensorSource for EnvironmentSim {
    fn read(&mut self) -> anyhow::Result<SensorSample> {
        self.step();

        if fastrand::f32() < self.fail_prob {
            anyhow::bail!("simulated bus error");
        }

        Ok(SensorSample {
            temperature: self.temperature.observe(self.spike()),
            soil_moisture: self.soil_moisture.observe(self.spike()),
            humidity: self.humidity.observe(self.spike()),
            water_level: Some(self.water_level.observe(0.0)),
            ph: Some(self.ph.observe(0.0)),
            light: Some(self.light.observe(self.spike())),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
