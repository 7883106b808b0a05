//! Output devices and the registry that drives them. The `gpio` feature gates
//! the real rppal driver; without it, a mock board logs state changes.

use anyhow::Result;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

pub type SharedRegistry = Arc<Mutex<DeviceRegistry>>;

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Device {
    Heating,
    Watering,
    Humidifier,
    WaterPump,
    Lightning,
}

impl Device {
    pub const ALL: [Device; 5] = [
        Device::Heating,
        Device::Watering,
        Device::Humidifier,
        Device::WaterPump,
        Device::Lightning,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heating => "HEATING",
            Self::Watering => "WATERING",
            Self::Humidifier => "HUMIDIFIER",
            Self::WaterPump => "WATER_PUMP",
            Self::Lightning => "LIGHTNING",
        }
    }

    /// BCM pin number of the relay output.
    pub fn gpio_pin(self) -> u8 {
        match self {
            Self::Heating => 17,
            Self::Watering => 27,
            Self::Humidifier => 22,
            Self::WaterPump => 5,
            Self::Lightning => 6,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ApplyError {
    #[error("unknown device '{0}'")]
    UnknownDevice(String),
}

impl FromStr for Device {
    type Err = ApplyError;

    /// Device names match case-insensitively: `heating` == `HEATING`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Device::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ApplyError::UnknownDevice(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Real GPIO output board (production: requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
struct OutputBoard {
    pins: BTreeMap<Device, OutputPin>,
    active_low: bool, // some relay boards are active-low
}

#[cfg(feature = "gpio")]
impl OutputBoard {
    fn new(active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = BTreeMap::new();
        for device in Device::ALL {
            let pin = gpio.get(device.gpio_pin())?.into_output();
            pins.insert(device, pin);
        }
        tracing::info!(active_low, "gpio output board initialised");
        Ok(Self { pins, active_low })
    }

    fn write(&mut self, device: Device, on: bool) {
        if let Some(pin) = self.pins.get_mut(&device) {
            // active-low: LOW = ON; active-high: HIGH = ON
            if on != self.active_low {
                pin.set_high()
            } else {
                pin.set_low()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Mock output board (development: no hardware, logs state)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
struct OutputBoard;

#[cfg(not(feature = "gpio"))]
impl OutputBoard {
    fn new(active_low: bool) -> Result<Self> {
        for device in Device::ALL {
            tracing::debug!(%device, gpio = device.gpio_pin(), "[mock-gpio] registered (not wired)");
        }
        tracing::info!(active_low, "[mock-gpio] output board initialised (no hardware)");
        Ok(Self)
    }

    fn write(&mut self, device: Device, on: bool) {
        tracing::debug!(%device, on, "[mock-gpio] output written");
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Outcome of applying one command message.
#[derive(Debug, Default, PartialEq)]
pub struct ApplyReport {
    pub applied: Vec<(Device, bool)>,
    pub unknown: Vec<String>,
    /// Known devices whose value was not a JSON boolean.
    pub invalid: Vec<String>,
}

pub struct DeviceRegistry {
    board: OutputBoard,
    states: BTreeMap<Device, bool>,
}

impl DeviceRegistry {
    /// Claim every output and force it off.
    pub fn new(active_low: bool) -> Result<Self> {
        let mut reg = Self {
            board: OutputBoard::new(active_low)?,
            states: Device::ALL.into_iter().map(|d| (d, false)).collect(),
        };
        reg.all_off();
        Ok(reg)
    }

    pub fn shared(self) -> SharedRegistry {
        Arc::new(Mutex::new(self))
    }

    pub fn set(&mut self, device: Device, on: bool) {
        self.board.write(device, on);
        if self.states.insert(device, on) != Some(on) {
            tracing::info!(%device, on, "output switched");
        }
    }

    pub fn get(&self, device: Device) -> bool {
        self.states.get(&device).copied().unwrap_or(false)
    }

    pub fn snapshot(&self) -> BTreeMap<Device, bool> {
        self.states.clone()
    }

    pub fn all_off(&mut self) {
        for device in Device::ALL {
            self.board.write(device, false);
            self.states.insert(device, false);
        }
    }

    /// Apply every entry of a decoded command. Entries naming no known
    /// device, or carrying a non-boolean value, are skipped and reported;
    /// they never prevent the rest from being applied.
    pub fn apply(&mut self, command: &Map<String, Value>) -> ApplyReport {
        let mut report = ApplyReport::default();
        for (name, value) in command {
            let device = match name.parse::<Device>() {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring command entry");
                    report.unknown.push(name.clone());
                    continue;
                }
            };
            match value.as_bool() {
                Some(on) => {
                    self.set(device, on);
                    report.applied.push((device, on));
                }
                None => {
                    tracing::warn!(%device, %value, "ignoring non-boolean command entry");
                    report.invalid.push(name.clone());
                }
            }
        }
        report
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(false).unwrap()
    }

    fn object(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    // -- Device -------------------------------------------------------------

    #[test]
    fn device_names_parse_case_insensitively() {
        assert_eq!("heating".parse::<Device>(), Ok(Device::Heating));
        assert_eq!("Water_Pump".parse::<Device>(), Ok(Device::WaterPump));
        assert_eq!(
            "fan".parse::<Device>(),
            Err(ApplyError::UnknownDevice("fan".to_string()))
        );
    }

    #[test]
    fn gpio_map_is_fixed() {
        let pins: Vec<u8> = Device::ALL.iter().map(|d| d.gpio_pin()).collect();
        assert_eq!(pins, vec![17, 27, 22, 5, 6]);
    }

    // -- Registry -----------------------------------------------------------

    #[test]
    fn new_registry_is_all_off() {
        let reg = registry();
        assert_eq!(reg.snapshot().len(), 5);
        assert!(reg.snapshot().values().all(|on| !on));
    }

    #[test]
    fn apply_sets_known_devices() {
        let mut reg = registry();
        let report = reg.apply(&object(json!({"HEATING": true, "LIGHTNING": false})));
        assert!(reg.get(Device::Heating));
        assert!(!reg.get(Device::Lightning));
        assert_eq!(report.applied.len(), 2);
        assert!(report.unknown.is_empty());
    }

    #[test]
    fn apply_skips_unknown_devices() {
        let mut reg = registry();
        let report = reg.apply(&object(json!({"heating": true, "bogus": true})));
        assert!(reg.get(Device::Heating));
        assert_eq!(report.applied, vec![(Device::Heating, true)]);
        assert_eq!(report.unknown, vec!["bogus".to_string()]);
    }

    #[test]
    fn apply_rejects_non_boolean_values_per_entry() {
        let mut reg = registry();
        let report = reg.apply(&object(json!({"WATERING": 1, "HUMIDIFIER": true})));
        assert!(!reg.get(Device::Watering));
        assert!(reg.get(Device::Humidifier));
        assert_eq!(report.invalid, vec!["WATERING".to_string()]);
    }

    #[test]
    fn apply_same_message_twice_is_idempotent() {
        let mut reg = registry();
        let msg = object(json!({"HEATING": true, "WATERING": false}));
        reg.apply(&msg);
        let first = reg.snapshot();
        reg.apply(&msg);
        assert_eq!(reg.snapshot(), first);
    }

    #[test]
    fn empty_command_changes_nothing() {
        let mut reg = registry();
        reg.set(Device::Watering, true);
        let report = reg.apply(&Map::new());
        assert_eq!(report, ApplyReport::default());
        assert!(reg.get(Device::Watering));
    }

    #[test]
    fn all_off_resets_everything() {
        let mut reg = registry();
        reg.set(Device::Heating, true);
        reg.set(Device::WaterPump, true);
        reg.all_off();
        assert!(reg.snapshot().values().all(|on| !on));
    }
}
