//! Bang-bang control with a deadband.
//!
//! An actuator is switched on only once the measured value falls below
//! `target - deadband`, and switched off only once it rises above
//! `target + deadband`. Inside the band the current state is kept.

/// Decide the next actuator state for one channel.
///
/// Pure and side-effect free; each channel calls it with its own deadband.
pub fn decide(current: f64, target: f64, deadband: f64, actuator_on: bool) -> bool {
    if current < target - deadband && !actuator_on {
        true
    } else if current > target + deadband && actuator_on {
        false
    } else {
        actuator_on
    }
}

/// Per-channel controller: a deadband bound to the shared decision rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hysteresis {
    pub deadband: f64,
}

impl Hysteresis {
    pub fn new(deadband: f64) -> Self {
        Self { deadband }
    }

    pub fn decide(&self, current: f64, target: f64, actuator_on: bool) -> bool {
        decide(current, target, self.deadband, actuator_on)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
