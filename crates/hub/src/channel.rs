//! Environmental channels: identity, per-channel constants, and the mutable
//! state the control loop and the operator share.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use crate::hysteresis::Hysteresis;

/// Number of samples kept per channel for charting.
pub const HISTORY_LEN: usize = 24;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Temperature,
    Humidity,
    SoilMoisture,
    WaterLevel,
    Ph,
    Light,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 6] = [
        ChannelKind::Temperature,
        ChannelKind::Humidity,
        ChannelKind::SoilMoisture,
        ChannelKind::WaterLevel,
        ChannelKind::Ph,
        ChannelKind::Light,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::SoilMoisture => "soil_moisture",
            Self::WaterLevel => "water_level",
            Self::Ph => "ph",
            Self::Light => "light",
        }
    }

    /// Static constants for this channel.
    pub fn profile(self) -> &'static ChannelProfile {
        match self {
            Self::Temperature => &TEMPERATURE,
            Self::Humidity => &HUMIDITY,
            Self::SoilMoisture => &SOIL_MOISTURE,
            Self::WaterLevel => &WATER_LEVEL,
            Self::Ph => &PH,
            Self::Light => &LIGHT,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChannelKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown channel '{s}'"))
    }
}

/// Output devices on the actuator node. Serialises to the wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Device {
    Heating,
    Watering,
    Humidifier,
    WaterPump,
    Lightning,
}

impl Device {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heating => "HEATING",
            Self::Watering => "WATERING",
            Self::Humidifier => "HUMIDIFIER",
            Self::WaterPump => "WATER_PUMP",
            Self::Lightning => "LIGHTNING",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Channel table
// ---------------------------------------------------------------------------

/// Constants that distinguish one channel from another.
#[derive(Debug)]
pub struct ChannelProfile {
    pub kind: ChannelKind,
    /// `None` for observe-only channels (no actuator, no controller).
    pub device: Option<Device>,
    pub deadband: f64,
    pub default_target: f64,
    pub min_target: f64,
    pub max_target: f64,
    /// Value used to fill the history before the first reading arrives.
    pub seed: f64,
    pub presets: &'static [(&'static str, f64)],
}

static TEMPERATURE: ChannelProfile = ChannelProfile {
    kind: ChannelKind::Temperature,
    device: Some(Device::Heating),
    deadband: 2.0,
    default_target: 15.0,
    min_target: 10.0,
    max_target: 40.0,
    seed: 25.0,
    presets: &[],
};

static HUMIDITY: ChannelProfile = ChannelProfile {
    kind: ChannelKind::Humidity,
    device: Some(Device::Humidifier),
    deadband: 5.0,
    default_target: 60.0,
    min_target: 30.0,
    max_target: 90.0,
    seed: 65.0,
    presets: &[("dry", 40.0), ("normal", 60.0), ("humid", 80.0)],
};

static SOIL_MOISTURE: ChannelProfile = ChannelProfile {
    kind: ChannelKind::SoilMoisture,
    device: Some(Device::Watering),
    deadband: 5.0,
    default_target: 60.0,
    min_target: 30.0,
    max_target: 90.0,
    seed: 77.5,
    presets: &[("dry", 40.0), ("optimal", 60.0), ("wet", 80.0)],
};

static WATER_LEVEL: ChannelProfile = ChannelProfile {
    kind: ChannelKind::WaterLevel,
    device: Some(Device::WaterPump),
    deadband: 5.0,
    default_target: 60.0,
    min_target: 30.0,
    max_target: 90.0,
    seed: 55.0,
    presets: &[("low", 40.0), ("medium", 60.0), ("high", 80.0)],
};

static PH: ChannelProfile = ChannelProfile {
    kind: ChannelKind::Ph,
    device: None,
    deadband: 0.0,
    default_target: 6.0,
    min_target: 4.0,
    max_target: 9.0,
    seed: 6.25,
    presets: &[],
};

static LIGHT: ChannelProfile = ChannelProfile {
    kind: ChannelKind::Light,
    device: Some(Device::Lightning),
    deadband: 10.0,
    default_target: 60.0,
    min_target: 10.0,
    max_target: 100.0,
    seed: 80.0,
    presets: &[("low", 30.0), ("medium", 60.0), ("high", 90.0)],
};

impl ChannelProfile {
    pub fn preset(&self, name: &str) -> Option<f64> {
        self.presets
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Fixed-capacity FIFO of samples, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct History {
    samples: VecDeque<f64>,
    #[serde(skip)]
    capacity: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// A full history where every slot holds `value`.
    pub fn seeded(capacity: usize, value: f64) -> Self {
        let mut h = Self::new(capacity);
        for _ in 0..capacity {
            h.push(value);
        }
        h
    }

    pub fn push(&mut self, value: f64) {
        if self.capacity == 0 {
            return;
        }
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn latest(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.samples.iter().copied().collect()
    }
}

// ---------------------------------------------------------------------------
// Mutable channel state
// ---------------------------------------------------------------------------

/// Who last wrote `actuator_on`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteSource {
    Controller,
    Operator,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelState {
    pub kind: ChannelKind,
    pub device: Option<Device>,
    pub current: f64,
    pub target: f64,
    pub deadband: f64,
    pub min_target: f64,
    pub max_target: f64,
    pub actuator_on: bool,
    pub auto_enabled: bool,
    pub history: History,
    pub last_write: Option<WriteSource>,
    /// Set by an operator write; the next decision phase leaves this channel
    /// alone once and then clears it.
    #[serde(skip)]
    pub operator_hold: bool,
}

impl ChannelState {
    pub fn new(profile: &ChannelProfile, history_len: usize) -> Self {
        Self {
            kind: profile.kind,
            device: profile.device,
            current: profile.seed,
            target: profile.default_target,
            deadband: profile.deadband,
            min_target: profile.min_target,
            max_target: profile.max_target,
            actuator_on: false,
            auto_enabled: false,
            history: History::seeded(history_len, profile.seed),
            last_write: None,
            operator_hold: false,
        }
    }

    pub fn controllable(&self) -> bool {
        self.device.is_some()
    }

    pub fn controller(&self) -> Hysteresis {
        Hysteresis::new(self.deadband)
    }

    /// Store a fresh sample as the current value.
    pub fn record(&mut self, value: f64) {
        self.current = value;
        self.history.push(value);
    }

    /// Clamp into the channel's operator range and store. Returns the value
    /// actually stored.
    pub fn set_target(&mut self, value: f64) -> f64 {
        let clamped = value.clamp(self.min_target, self.max_target);
        self.target = clamped;
        clamped
    }

    /// Operator override of the actuator.
    pub fn set_actuator_manual(&mut self, on: bool) {
        self.actuator_on = on;
        self.last_write = Some(WriteSource::Operator);
        self.operator_hold = true;
    }

    /// Run the hysteresis rule if this channel is under automatic control.
    /// Returns `Some(new_state)` when the actuator flipped.
    pub fn evaluate(&mut self, global_auto: bool) -> Option<bool> {
        if !self.controllable() {
            return None;
        }
        if self.operator_hold {
            self.operator_hold = false;
            return None;
        }
        if !(self.auto_enabled || global_auto) {
            return None;
        }
        let next = self
            .controller()
            .decide(self.current, self.target, self.actuator_on);
        if next == self.actuator_on {
            return None;
        }
        self.actuator_on = next;
        self.last_write = Some(WriteSource::Controller);
        Some(next)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
