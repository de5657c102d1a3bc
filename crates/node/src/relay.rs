//! Pump relay output. The `gpio` feature gates the real rppal driver;
//! without it, a mock keeps the state in memory and logs changes.

use anyhow::Result;
use tracing::info;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Real GPIO relay (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct Relay {
    pin: OutputPin,
    active_low: bool, // many relay boards are active-low
    on: bool,
}

#[cfg(feature = "gpio")]
impl Relay {
    /// Claims the pin and drives it to "off" before returning.
    pub fn new(gpio_pin: u8, active_low: bool) -> Result<Self> {
        let pin = Gpio::new()?.get(gpio_pin)?.into_output();
        let mut relay = Self {
            pin,
            active_low,
            on: true,
        };
        relay.set(false);
        Ok(relay)
    }

    pub fn set(&mut self, on: bool) {
        // active-low: LOW = ON, HIGH = OFF
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        if on != self.on {
            info!(gpio = self.pin.pin(), on, "relay switched");
        }
        self.on = on;
    }

    pub fn is_on(&self) -> bool {
        self.on
    }
}

// ---------------------------------------------------------------------------
// Mock relay (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct Relay {
    gpio_pin: u8,
    on: bool,
}

#[cfg(not(feature = "gpio"))]
impl Relay {
    pub fn new(gpio_pin: u8, _active_low: bool) -> Result<Self> {
        info!(gpio = gpio_pin, "[mock-gpio] relay initialised (no hardware)");
        Ok(Self { gpio_pin, on: false })
    }

    pub fn set(&mut self, on: bool) {
        if on != self.on {
            info!(gpio = self.gpio_pin, on, "[mock-gpio] relay switched");
        }
        self.on = on;
    }

    pub fn is_on(&self) -> bool {
        self.on
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;

    #[test]
    fn starts_off() {
        let relay = Relay::new(17, true).unwrap();
        assert!(!relay.is_on());
    }

    #[test]
    fn set_on_then_off() {
        let mut relay = Relay::new(17, true).unwrap();
        relay.set(true);
        assert!(relay.is_on());
        relay.set(false);
        assert!(!relay.is_on());
    }

    #[test]
    fn repeated_set_is_idempotent() {
        let mut relay = Relay::new(17, false).unwrap();
        relay.set(true);
        relay.set(true);
        assert!(relay.is_on());
    }
}
