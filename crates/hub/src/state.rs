use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::actuator::DeviceStates;
use crate::alert::{AlertThrottle, Severity};
use crate::channel::{ChannelKind, ChannelState, HISTORY_LEN};
use crate::config::{AlertRule, Config};
use crate::telemetry::Reading;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub channels: BTreeMap<ChannelKind, ChannelState>,
    pub global_auto: bool,
    pub alert: AlertThrottle,
    pub active_alert: Option<ActiveAlert>,
    pub sensor: SensorHealth,
    pub tick_seq: u64,
    pub send_failures: u64,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SensorHealth {
    pub available: bool,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_ok: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveAlert {
    pub channel: ChannelKind,
    pub message: String,
    pub severity: Severity,
    #[serde(with = "time::serde::rfc3339")]
    pub raised_at: OffsetDateTime,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Actuator,
    Alert,
    Operator,
    Error,
    System,
}

/// Notifications pushed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    Tick { seq: u64 },
    Alert {
        channel: ChannelKind,
        message: String,
        severity: Severity,
    },
    SensorUnavailable { consecutive_failures: u32 },
    SensorRestored,
}

#[derive(Debug, Error, PartialEq)]
pub enum OperatorError {
    #[error("channel '{0}' has no actuator")]
    NotControllable(ChannelKind),
    #[error("channel '{channel}' has no preset '{name}'")]
    UnknownPreset { channel: ChannelKind, name: String },
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub tick_seq: u64,
    pub global_auto: bool,
    pub sensor: SensorHealth,
    pub send_failures: u64,
    pub alert_open: bool,
    pub active_alert: Option<ActiveAlert>,
    pub channels: BTreeMap<ChannelKind, ChannelState>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(config: &Config) -> Self {
        let channels = ChannelKind::ALL
            .into_iter()
            .map(|k| (k, config.channel_state(k)))
            .collect();

        Self {
            started_at: Instant::now(),
            channels,
            global_auto: false,
            alert: AlertThrottle::new(),
            active_alert: None,
            sensor: SensorHealth {
                available: true,
                ..SensorHealth::default()
            },
            tick_seq: 0,
            send_failures: 0,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn channel(&self, kind: ChannelKind) -> &ChannelState {
        // Every kind is inserted at construction and never removed.
        &self.channels[&kind]
    }

    fn channel_mut(&mut self, kind: ChannelKind) -> &mut ChannelState {
        self.channels
            .entry(kind)
            .or_insert_with(|| ChannelState::new(kind.profile(), HISTORY_LEN))
    }
}

// ---------------------------------------------------------------------------
// Control-loop mutation
// ---------------------------------------------------------------------------

impl SystemState {
    /// Start a new tick and return its sequence number.
    pub fn begin_tick(&mut self) -> u64 {
        self.tick_seq += 1;
        self.tick_seq
    }

    /// Store every present field of `reading`. Absent fields leave the
    /// channel untouched. Returns the channels that received a value.
    pub fn apply_reading(&mut self, reading: &Reading) -> Vec<ChannelKind> {
        let fields = [
            (ChannelKind::Temperature, reading.temperature),
            (ChannelKind::SoilMoisture, reading.soil_moisture),
            (ChannelKind::Humidity, reading.humidity),
            (ChannelKind::WaterLevel, reading.water_level),
            (ChannelKind::Ph, reading.ph),
            (ChannelKind::Light, reading.light),
        ];

        let mut updated = Vec::new();
        let mut parts = Vec::new();
        for (kind, value) in fields {
            if let Some(v) = value.filter(|v| v.is_finite()) {
                self.channel_mut(kind).record(v);
                updated.push(kind);
                parts.push(format!("{kind}={v}"));
            }
        }

        if !parts.is_empty() {
            self.push_event(EventKind::Reading, parts.join(", "));
        }
        updated
    }

    /// A poll succeeded. Returns `SensorRestored` if the sensor had been
    /// reported unavailable.
    pub fn record_poll_ok(&mut self) -> Option<ControlEvent> {
        self.sensor.consecutive_failures = 0;
        self.sensor.last_ok = Some(OffsetDateTime::now_utc());
        if self.sensor.available {
            return None;
        }
        self.sensor.available = true;
        self.push_event(EventKind::System, "sensor node reachable again".to_string());
        Some(ControlEvent::SensorRestored)
    }

    /// A poll failed. Returns `SensorUnavailable` exactly once, on the
    /// failure that reaches `unavailable_after`.
    pub fn record_poll_failure(&mut self, detail: String, unavailable_after: u32) -> Option<ControlEvent> {
        self.sensor.consecutive_failures = self.sensor.consecutive_failures.saturating_add(1);
        self.sensor.total_failures += 1;
        self.push_event(EventKind::Error, format!("telemetry: {detail}"));

        if self.sensor.available && self.sensor.consecutive_failures >= unavailable_after {
            self.sensor.available = false;
            self.push_event(
                EventKind::Alert,
                format!(
                    "sensor unavailable after {} failed polls",
                    self.sensor.consecutive_failures
                ),
            );
            return Some(ControlEvent::SensorUnavailable {
                consecutive_failures: self.sensor.consecutive_failures,
            });
        }
        None
    }

    /// Run every channel's controller. Returns the channels whose actuator
    /// flipped, with the new state.
    pub fn run_controllers(&mut self) -> Vec<(ChannelKind, bool)> {
        let global_auto = self.global_auto;
        let flips: Vec<(ChannelKind, bool)> = self
            .channels
            .iter_mut()
            .filter_map(|(kind, ch)| ch.evaluate(global_auto).map(|on| (*kind, on)))
            .collect();

        for (kind, on) in &flips {
            let ch = self.channel(*kind);
            let detail = format!(
                "{kind}: auto {} {} (current {:.1}, target {:.1})",
                ch.device.map(|d| d.as_str()).unwrap_or("-"),
                on_off(*on),
                ch.current,
                ch.target
            );
            self.push_event(EventKind::Actuator, detail);
        }
        flips
    }

    /// Desired state of every device, from the channels that own one.
    pub fn device_states(&self) -> DeviceStates {
        self.channels
            .values()
            .filter_map(|ch| ch.device.map(|d| (d, ch.actuator_on)))
            .collect()
    }

    pub fn record_send_failure(&mut self, detail: String) {
        self.send_failures += 1;
        self.push_event(EventKind::Error, format!("actuator send: {detail}"));
    }

    /// Check alert rules against the channels that got a fresh value this
    /// tick. At most one alert is raised system-wide.
    pub fn evaluate_alerts(
        &mut self,
        rules: &[AlertRule],
        fresh: &[ChannelKind],
        cooldown: Duration,
        now: Instant,
    ) -> Option<ControlEvent> {
        for rule in rules.iter().filter(|r| fresh.contains(&r.channel)) {
            let ch = self.channel(rule.channel);
            let (value, threshold) = (ch.current, ch.target);
            if self.alert.try_fire(value, threshold, cooldown, now) {
                self.active_alert = Some(ActiveAlert {
                    channel: rule.channel,
                    message: rule.message.clone(),
                    severity: rule.severity,
                    raised_at: OffsetDateTime::now_utc(),
                });
                self.push_event(
                    EventKind::Alert,
                    format!("{}: {} ({value:.1} < {threshold:.1})", rule.channel, rule.message),
                );
                return Some(ControlEvent::Alert {
                    channel: rule.channel,
                    message: rule.message.clone(),
                    severity: rule.severity,
                });
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Operator actions
// ---------------------------------------------------------------------------

impl SystemState {
    /// Returns the stored (clamped) target.
    pub fn set_target(&mut self, kind: ChannelKind, value: f64) -> f64 {
        let stored = self.channel_mut(kind).set_target(value);
        self.push_event(EventKind::Operator, format!("{kind}: target set to {stored:.1}"));
        stored
    }

    pub fn apply_preset(&mut self, kind: ChannelKind, name: &str) -> Result<f64, OperatorError> {
        if !self.channel(kind).controllable() {
            return Err(OperatorError::NotControllable(kind));
        }
        let value = kind
            .profile()
            .preset(name)
            .ok_or_else(|| OperatorError::UnknownPreset {
                channel: kind,
                name: name.to_string(),
            })?;
        Ok(self.set_target(kind, value))
    }

    pub fn set_actuator(&mut self, kind: ChannelKind, on: bool) -> Result<(), OperatorError> {
        let ch = self.channel_mut(kind);
        if !ch.controllable() {
            return Err(OperatorError::NotControllable(kind));
        }
        ch.set_actuator_manual(on);
        self.push_event(EventKind::Operator, format!("{kind}: manual {}", on_off(on)));
        Ok(())
    }

    /// Flip the actuator once. Returns the new state.
    pub fn toggle_actuator(&mut self, kind: ChannelKind) -> Result<bool, OperatorError> {
        let next = !self.channel(kind).actuator_on;
        self.set_actuator(kind, next)?;
        Ok(next)
    }

    pub fn set_auto(&mut self, kind: ChannelKind, enabled: bool) -> Result<(), OperatorError> {
        let ch = self.channel_mut(kind);
        if !ch.controllable() {
            return Err(OperatorError::NotControllable(kind));
        }
        ch.auto_enabled = enabled;
        self.push_event(EventKind::Operator, format!("{kind}: auto {}", on_off(enabled)));
        Ok(())
    }

    pub fn set_global_auto(&mut self, enabled: bool) {
        self.global_auto = enabled;
        self.push_event(EventKind::Operator, format!("global auto {}", on_off(enabled)));
    }

    pub fn dismiss_alert(&mut self) {
        if self.alert.is_open() {
            self.push_event(EventKind::Operator, "alert dismissed".to_string());
        }
        self.alert.dismiss();
        self.active_alert = None;
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            tick_seq: self.tick_seq,
            global_auto: self.global_auto,
            sensor: self.sensor.clone(),
            send_failures: self.send_failures,
            alert_open: self.alert.is_open(),
            active_alert: self.active_alert.clone(),
            channels: self.channels.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

// ===========================================================================
// Tests
// ===========================================================================
