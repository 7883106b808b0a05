//! TOML config file loading and validation for the hub.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::alert::Severity;
use crate::channel::{ChannelKind, ChannelState, History, HISTORY_LEN};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sensor: SensorSection,
    pub actuator: ActuatorSection,
    pub control: ControlSection,
    pub alert: AlertSection,
    pub channels: BTreeMap<ChannelKind, ChannelOverride>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorSection {
    /// Base URL of the sensor node; `/sensor` is appended.
    pub url: String,
    pub timeout_ms: u64,
    /// Consecutive failed polls before the sensor is reported unavailable.
    pub unavailable_after: u32,
}

impl Default for SensorSection {
    fn default() -> Self {
        Self {
            url: "http://192.168.16.54:5000".to_string(),
            timeout_ms: 1000,
            unavailable_after: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActuatorSection {
    /// `host:port` of the actuator node.
    pub addr: String,
    pub timeout_ms: u64,
}

impl Default for ActuatorSection {
    fn default() -> Self {
        Self {
            addr: "192.168.16.54:65432".to_string(),
            timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlSection {
    pub tick_ms: u64,
    pub history_len: usize,
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            tick_ms: 500,
            history_len: HISTORY_LEN,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertSection {
    pub cooldown_sec: u64,
    pub rules: Vec<AlertRule>,
}

impl Default for AlertSection {
    fn default() -> Self {
        Self {
            cooldown_sec: 15,
            rules: vec![AlertRule {
                channel: ChannelKind::Temperature,
                message: "Temperature is too low! Please take action.".to_string(),
                severity: Severity::Red,
            }],
        }
    }
}

/// Raise an alert when `channel` reads below its current target.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertRule {
    pub channel: ChannelKind,
    pub message: String,
    #[serde(default)]
    pub severity: Severity,
}

/// Per-channel overrides of the built-in channel table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChannelOverride {
    pub target: Option<f64>,
    pub deadband: Option<f64>,
    pub seed: Option<f64>,
    pub min_target: Option<f64>,
    pub max_target: Option<f64>,
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl Config {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.control.tick_ms)
    }

    pub fn sensor_timeout(&self) -> Duration {
        Duration::from_millis(self.sensor.timeout_ms)
    }

    pub fn actuator_timeout(&self) -> Duration {
        Duration::from_millis(self.actuator.timeout_ms)
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_secs(self.alert.cooldown_sec)
    }

    /// Build the startup state for one channel: table defaults with any
    /// configured overrides applied.
    pub fn channel_state(&self, kind: ChannelKind) -> ChannelState {
        let profile = kind.profile();
        let ov = self.channels.get(&kind).cloned().unwrap_or_default();

        let mut ch = ChannelState::new(profile, self.control.history_len);
        if let Some(seed) = ov.seed {
            ch.current = seed;
            ch.history = History::seeded(self.control.history_len, seed);
        }
        ch.deadband = ov.deadband.unwrap_or(profile.deadband);
        ch.min_target = ov.min_target.unwrap_or(profile.min_target);
        ch.max_target = ov.max_target.unwrap_or(profile.max_target);
        ch.set_target(ov.target.unwrap_or(profile.default_target));
        ch
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_endpoints(&mut errors);
        self.validate_timing(&mut errors);
        self.validate_channels(&mut errors);
        self.validate_alerts(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_endpoints(&self, errors: &mut Vec<String>) {
        if !self.sensor.url.starts_with("http://") {
            errors.push(format!(
                "sensor.url '{}' must be a plain http:// URL",
                self.sensor.url
            ));
        }
        if self.actuator.addr.rsplit_once(':').map_or(true, |(host, port)| {
            host.is_empty() || port.parse::<u16>().is_err()
        }) {
            errors.push(format!(
                "actuator.addr '{}' must be host:port",
                self.actuator.addr
            ));
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        if self.control.tick_ms == 0 {
            errors.push("control.tick_ms must be positive".to_string());
        }
        if self.control.history_len == 0 {
            errors.push("control.history_len must be positive".to_string());
        }
        if self.sensor.timeout_ms == 0 {
            errors.push("sensor.timeout_ms must be positive".to_string());
        }
        if self.actuator.timeout_ms == 0 {
            errors.push("actuator.timeout_ms must be positive".to_string());
        }
        if self.sensor.unavailable_after == 0 {
            errors.push("sensor.unavailable_after must be positive".to_string());
        }
    }

    fn validate_channels(&self, errors: &mut Vec<String>) {
        for (kind, ov) in &self.channels {
            let profile = kind.profile();
            let min = ov.min_target.unwrap_or(profile.min_target);
            let max = ov.max_target.unwrap_or(profile.max_target);

            if !min.is_finite() || !max.is_finite() {
                errors.push(format!(
                    "channel '{kind}': min_target and max_target must be finite, got [{min}, {max}]"
                ));
            } else if min >= max {
                errors.push(format!(
                    "channel '{kind}': min_target ({min}) must be below max_target ({max})"
                ));
            }
            if let Some(t) = ov.target {
                if !(min..=max).contains(&t) {
                    errors.push(format!(
                        "channel '{kind}': target {t} out of range [{min}, {max}]"
                    ));
                }
            }
            if let Some(seed) = ov.seed {
                if !seed.is_finite() {
                    errors.push(format!("channel '{kind}': seed must be finite, got {seed}"));
                }
            }
            if let Some(d) = ov.deadband {
                if !d.is_finite() || d < 0.0 {
                    errors.push(format!(
                        "channel '{kind}': deadband must be a non-negative number, got {d}"
                    ));
                }
                if profile.device.is_none() {
                    errors.push(format!(
                        "channel '{kind}': deadband set on an observe-only channel"
                    ));
                }
            }
        }
    }

    fn validate_alerts(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<ChannelKind> = HashSet::new();
        for (i, rule) in self.alert.rules.iter().enumerate() {
            if rule.message.trim().is_empty() {
                errors.push(format!("alert.rules[{i}]: message is empty"));
            }
            if !seen.insert(rule.channel) {
                errors.push(format!(
                    "alert.rules[{i}]: duplicate rule for channel '{}'",
                    rule.channel
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse and validate config text.
pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

/// Read, parse, and validate a TOML config file. A missing file yields the
/// built-in defaults.
pub fn load(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        tracing::warn!(path, "config file not found, using defaults");
        return Ok(Config::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config = parse(&contents).with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        path,
        overrides = config.channels.len(),
        alert_rules = config.alert.rules.len(),
        "config loaded"
    );

    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
