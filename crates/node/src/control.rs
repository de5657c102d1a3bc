//! Relay decision logic. Pure: no I/O, time is passed in.

use std::time::{Duration, Instant};

use crate::settings::{PumpMode, Settings};

#[derive(Debug)]
pub struct Controller {
    relay_on: bool,
    last_changed_at: Instant,
    min_on: Duration,
}

impl Controller {
    /// Starts with the relay off, as forced at boot.
    pub fn new(min_on: Duration, now: Instant) -> Self {
        Self {
            relay_on: false,
            last_changed_at: now,
            min_on,
        }
    }

    pub fn relay_on(&self) -> bool {
        self.relay_on
    }

    /// Runs one control cycle. Returns the new relay state when it changed.
    ///
    /// Manual mode follows the override immediately. Auto mode is a
    /// hysteresis band with a minimum on-time: once on, the relay stays on
    /// until `min_on` has elapsed, even if the soil is already wet enough.
    /// A missing moisture reading holds the current state in auto mode.
    pub fn step(&mut self, settings: &Settings, moisture: Option<f64>, now: Instant) -> Option<bool> {
        let target = match settings.pump_mode {
            PumpMode::Manual => settings.override_pump_on,
            PumpMode::Auto => match moisture {
                Some(m) if !self.relay_on && m < settings.pump_on_below => true,
                Some(m)
                    if self.relay_on
                        && now.duration_since(self.last_changed_at) >= self.min_on
                        && m > settings.pump_off_above =>
                {
                    false
                }
                _ => self.relay_on,
            },
        };

        if target == self.relay_on {
            return None;
        }
        self.relay_on = target;
        self.last_changed_at = now;
        Some(target)
    }
}
