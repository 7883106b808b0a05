//! Single-flight, rate-limited operator alerts.
//!
//! Only one alert may be open at a time across the whole system. An open
//! alert stays open until the operator dismisses it; after that, the next
//! alert may fire once `cooldown` has passed since the last one *fired*
//! (dismissal does not restart the cooldown).

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Colour the presentation layer uses for the warning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Yellow,
    #[default]
    Red,
}

#[derive(Debug, Default)]
pub struct AlertThrottle {
    open: bool,
    last_fired_at: Option<Instant>,
}

impl AlertThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether an alert for `value` may be shown at `now`. On `true`
    /// the alert is marked open and the firing time recorded.
    pub fn try_fire(&mut self, value: f64, threshold: f64, cooldown: Duration, now: Instant) -> bool {
        if !(value < threshold) || self.open {
            return false;
        }
        if let Some(last) = self.last_fired_at {
            if now.saturating_duration_since(last) < cooldown {
                return false;
            }
        }
        self.open = true;
        self.last_fired_at = Some(now);
        true
    }

    /// The operator closed the alert.
    pub fn dismiss(&mut self) {
        self.open = false;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn last_fired_at(&self) -> Option<Instant> {
        self.last_fired_at
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(15);

    fn at(t0: Instant, secs: u64) -> Instant {
        t0 + Duration::from_secs(secs)
    }

    #[test]
    fn fires_when_below_threshold() {
        let t0 = Instant::now();
        let mut a = AlertThrottle::new();
        assert!(a.try_fire(10.0, 15.0, COOLDOWN, t0));
        assert!(a.is_open());
        assert_eq!(a.last_fired_at(), Some(t0));
    }

    #[test]
    fn does_not_fire_at_or_above_threshold() {
        let t0 = Instant::now();
        let mut a = AlertThrottle::new();
        assert!(!a.try_fire(15.0, 15.0, COOLDOWN, t0));
        assert!(!a.try_fire(20.0, 15.0, COOLDOWN, t0));
        assert!(!a.is_open());
    }

    #[test]
    fn nan_reading_never_fires() {
        let mut a = AlertThrottle::new();
        assert!(!a.try_fire(f64::NAN, 15.0, COOLDOWN, Instant::now()));
    }

    #[test]
    fn open_alert_blocks_further_alerts() {
        let t0 = Instant::now();
        let mut a = AlertThrottle::new();
        assert!(a.try_fire(10.0, 15.0, COOLDOWN, t0));
        assert!(!a.try_fire(10.0, 15.0, COOLDOWN, at(t0, 5)));
        // Still open long after the cooldown: one alert until dismissed.
        assert!(!a.try_fire(10.0, 15.0, COOLDOWN, at(t0, 600)));
    }

    #[test]
    fn cooldown_measured_from_last_fire_not_dismissal() {
        let t0 = Instant::now();
        let mut a = AlertThrottle::new();
        assert!(a.try_fire(10.0, 15.0, COOLDOWN, t0));
        assert!(!a.try_fire(10.0, 15.0, COOLDOWN, at(t0, 5)));

        a.dismiss(); // t = 6
        assert!(!a.is_open());

        // 14 s after the fire: still cooling down.
        assert!(!a.try_fire(10.0, 15.0, COOLDOWN, at(t0, 14)));
        // 20 s after the fire (14 s after dismissal): allowed.
        assert!(a.try_fire(10.0, 15.0, COOLDOWN, at(t0, 20)));
        assert_eq!(a.last_fired_at(), Some(at(t0, 20)));
    }

    #[test]
    fn dismiss_without_alert_is_harmless() {
        let mut a = AlertThrottle::new();
        a.dismiss();
        assert!(a.try_fire(1.0, 15.0, COOLDOWN, Instant::now()));
    }

    #[test]
    fn severity_parses_lowercase() {
        let s: Severity = serde_json::from_str("\"yellow\"").unwrap();
        assert_eq!(s, Severity::Yellow);
        assert_eq!(Severity::default(), Severity::Red);
    }
}
