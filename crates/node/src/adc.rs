//! PCF8591 8-bit ADC over I2C.
//!
//! The chip returns the result of the *previous* conversion on every read,
//! so each channel read is: write the control byte, discard one byte, then
//! read the fresh value. Values are reported as raw 0..=255 counts.

use anyhow::Context;
use rppal::i2c::I2c;

use crate::sensor::{SensorSample, SensorSource};

/// Default bus address with A0..A2 tied low.
pub const DEFAULT_ADDR: u16 = 0x48;

// ── Control byte ────────────────────────────────────────────────────────────
//
// Layout (MSB first):
//   [7]   0
//   [6]   analog output enable
//   [5:4] input programming (00 = four single-ended inputs)
//   [3]   0
//   [2]   auto-increment
//   [1:0] channel number

/// Analog output enabled, single-ended inputs, no auto-increment.
const CONTROL_BASE: u8 = 0x40;

const MAX_CHANNEL: u8 = 3;

// ── Channel assignment ──────────────────────────────────────────────────────

const CH_TEMPERATURE: u8 = 0;
const CH_SOIL_MOISTURE: u8 = 1;
const CH_HUMIDITY: u8 = 2;

fn control_byte(channel: u8) -> u8 {
    CONTROL_BASE | (channel & MAX_CHANNEL)
}

// ── Driver ──────────────────────────────────────────────────────────────────

pub struct Pcf8591 {
    i2c: I2c,
}

impl Pcf8591 {
    /// Open I2C bus 1 and address the chip at `addr`.
    pub fn new(addr: u16) -> anyhow::Result<Self> {
        let mut i2c = I2c::new().context("failed to open i2c bus")?;
        i2c.set_slave_address(addr)
            .with_context(|| format!("failed to address pcf8591 at 0x{addr:02x}"))?;

        tracing::info!(addr = format_args!("0x{addr:02x}"), "pcf8591 initialised");
        Ok(Self { i2c })
    }

    fn read_channel(&mut self, channel: u8) -> anyhow::Result<u8> {
        anyhow::ensure!(
            channel <= MAX_CHANNEL,
            "pcf8591 channel {channel} out of range (0–{MAX_CHANNEL})"
        );
        self.i2c.smbus_send_byte(control_byte(channel))?;
        // Stale result from the previous conversion.
        self.i2c.smbus_receive_byte()?;
        Ok(self.i2c.smbus_receive_byte()?)
    }
}

impl SensorSource for Pcf8591 {
    fn read(&mut self) -> anyhow::Result<SensorSample> {
        let temperature = self
            .read_channel(CH_TEMPERATURE)
            .context("temperature (AIN0)")?;
        let soil_moisture = self
            .read_channel(CH_SOIL_MOISTURE)
            .context("soil moisture (AIN1)")?;
        let humidity = self.read_channel(CH_HUMIDITY).context("humidity (AIN2)")?;

        Ok(SensorSample {
            temperature: f64::from(temperature),
            soil_moisture: f64::from(soil_moisture),
            humidity: f64::from(humidity),
            ..SensorSample::default()
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_byte_selects_channel() {
        assert_eq!(control_byte(0), 0x40);
        assert_eq!(control_byte(1), 0x41);
        assert_eq!(control_byte(2), 0x42);
        assert_eq!(control_byte(3), 0x43);
    }

    #[test]
    fn control_byte_enables_analog_output_only() {
        // Bit 6 set, auto-increment (bit 2) and input mode (bits 5:4) clear.
        assert_eq!(CONTROL_BASE & 0b0100_0000, 0b0100_0000);
        assert_eq!(CONTROL_BASE & 0b0011_0100, 0);
    }

    #[test]
    fn channel_assignment_matches_wiring() {
        assert_eq!(CH_TEMPERATURE, 0);
        assert_eq!(CH_SOIL_MOISTURE, 1);
        assert_eq!(CH_HUMIDITY, 2);
    }
}
