//! The periodic control loop and the operator handle onto its state.
//!
//! One tick is: poll telemetry, store the reading, run every channel's
//! controller, push the full device map to the actuator node, then check the
//! alert rules. Ticks never overlap; the next one starts only after the
//! previous send has completed or timed out.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::actuator::Actuators;
use crate::channel::{ChannelKind, ChannelState};
use crate::config::{AlertRule, Config};
use crate::state::{ControlEvent, OperatorError, SharedState, StatusResponse, SystemState};
use crate::telemetry::{Reading, Telemetry};

/// Buffered presentation events per subscriber before the oldest are lost.
const EVENT_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Control loop
// ---------------------------------------------------------------------------

pub struct ControlLoop<T, A> {
    telemetry: T,
    actuators: A,
    state: SharedState,
    events: broadcast::Sender<ControlEvent>,
    stopped: watch::Sender<bool>,
    period: Duration,
    rules: Vec<AlertRule>,
    cooldown: Duration,
    unavailable_after: u32,
}

impl<T: Telemetry, A: Actuators> ControlLoop<T, A> {
    pub fn new(config: &Config, telemetry: T, actuators: A) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (stopped, _) = watch::channel(false);
        Self {
            telemetry,
            actuators,
            state: Arc::new(RwLock::new(SystemState::new(config))),
            events,
            stopped,
            period: config.tick(),
            rules: config.alert.rules.clone(),
            cooldown: config.alert_cooldown(),
            unavailable_after: config.sensor.unavailable_after,
        }
    }

    /// Operator-side view onto this loop's state.
    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            state: Arc::clone(&self.state),
            events: self.events.clone(),
            stopped: self.stopped.subscribe(),
        }
    }

    /// Run one full tick. Returns its sequence number.
    pub async fn tick(&self) -> u64 {
        let polled = self.telemetry.poll().await;
        let mut pending: Vec<ControlEvent> = Vec::new();

        let (seq, fresh, devices) = {
            let mut st = self.state.write().await;
            let seq = st.begin_tick();

            let reading = match polled {
                Ok(r) => {
                    pending.extend(st.record_poll_ok());
                    r
                }
                Err(e) => {
                    warn!(tick = seq, error = %e, "telemetry poll failed");
                    pending.extend(st.record_poll_failure(e.to_string(), self.unavailable_after));
                    Reading::unavailable()
                }
            };

            let fresh = st.apply_reading(&reading);
            for (kind, on) in st.run_controllers() {
                info!(tick = seq, channel = %kind, on, "actuator switched by controller");
            }
            (seq, fresh, st.device_states())
        };

        debug!(tick = seq, ?devices, "sending device states");
        if let Err(e) = self.actuators.send(&devices).await {
            warn!(tick = seq, error = %e, "actuator send failed");
            self.state.write().await.record_send_failure(e.to_string());
        }

        {
            let mut st = self.state.write().await;
            if let Some(ev) = st.evaluate_alerts(&self.rules, &fresh, self.cooldown, Instant::now()) {
                warn!(tick = seq, ?ev, "alert raised");
                pending.push(ev);
            }
        }

        pending.push(ControlEvent::Tick { seq });
        for ev in pending {
            match &ev {
                ControlEvent::SensorUnavailable { consecutive_failures } => {
                    warn!(consecutive_failures, "sensor node unavailable");
                }
                ControlEvent::SensorRestored => info!("sensor node restored"),
                _ => {}
            }
            // No subscribers is fine.
            let _ = self.events.send(ev);
        }
        seq
    }

    /// Tick until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(tick_ms = self.period.as_millis() as u64, "control loop started");
        self.state
            .write()
            .await
            .record_system("control loop started".to_string());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.stopped.send_replace(true);
        info!("control loop stopped");
    }
}

// ---------------------------------------------------------------------------
// Operator handle
// ---------------------------------------------------------------------------

/// Narrow read/write interface the presentation layer works through.
#[derive(Clone)]
pub struct ControlHandle {
    state: SharedState,
    events: broadcast::Sender<ControlEvent>,
    stopped: watch::Receiver<bool>,
}

impl ControlHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    /// Resolves once the control loop has stopped or been dropped.
    pub async fn stopped(&self) {
        let mut rx = self.stopped.clone();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    pub async fn status(&self) -> StatusResponse {
        self.state.read().await.to_status()
    }

    pub async fn channel(&self, kind: ChannelKind) -> ChannelState {
        self.state.read().await.channel(kind).clone()
    }

    pub async fn current(&self, kind: ChannelKind) -> f64 {
        self.state.read().await.channel(kind).current
    }

    pub async fn target(&self, kind: ChannelKind) -> f64 {
        self.state.read().await.channel(kind).target
    }

    pub async fn history(&self, kind: ChannelKind) -> Vec<f64> {
        self.state.read().await.channel(kind).history.to_vec()
    }

    pub async fn actuator_on(&self, kind: ChannelKind) -> bool {
        self.state.read().await.channel(kind).actuator_on
    }

    pub async fn auto_enabled(&self, kind: ChannelKind) -> bool {
        self.state.read().await.channel(kind).auto_enabled
    }

    pub async fn global_auto(&self) -> bool {
        self.state.read().await.global_auto
    }

    /// Returns the stored target after clamping.
    pub async fn set_target(&self, kind: ChannelKind, value: f64) -> f64 {
        let stored = self.state.write().await.set_target(kind, value);
        info!(channel = %kind, requested = value, stored, "target set");
        stored
    }

    pub async fn apply_preset(&self, kind: ChannelKind, name: &str) -> Result<f64, OperatorError> {
        let value = self.state.write().await.apply_preset(kind, name)?;
        info!(channel = %kind, preset = name, value, "preset applied");
        Ok(value)
    }

    pub async fn set_actuator_on(&self, kind: ChannelKind, on: bool) -> Result<(), OperatorError> {
        self.state.write().await.set_actuator(kind, on)?;
        info!(channel = %kind, on, "actuator set by operator");
        Ok(())
    }

    pub async fn toggle_actuator(&self, kind: ChannelKind) -> Result<bool, OperatorError> {
        let on = self.state.write().await.toggle_actuator(kind)?;
        info!(channel = %kind, on, "actuator toggled by operator");
        Ok(on)
    }

    pub async fn set_auto_enabled(&self, kind: ChannelKind, enabled: bool) -> Result<(), OperatorError> {
        self.state.write().await.set_auto(kind, enabled)?;
        info!(channel = %kind, enabled, "channel auto flag set");
        Ok(())
    }

    pub async fn set_global_auto(&self, enabled: bool) {
        self.state.write().await.set_global_auto(enabled);
        info!(enabled, "global auto flag set");
    }

    pub async fn dismiss_alert(&self) {
        self.state.write().await.dismiss_alert();
        info!("alert dismissed");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
