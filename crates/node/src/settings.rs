//! Last-known-good copy of the hub's desired state.
//!
//! Responses are merged field by field: a field replaces the cached value
//! only when it is present, well-typed and in range. Anything else keeps
//! the previous value, so a truncated or partially garbled response can
//! never leave the controller without a usable configuration.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use tracing::warn;

pub const DEFAULT_ON_BELOW: f64 = 35.0;
pub const DEFAULT_OFF_ABOVE: f64 = 45.0;

const MIN_SEND_INTERVAL_SEC: u64 = 5;
const MAX_SEND_INTERVAL_SEC: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpMode {
    Auto,
    Manual,
}

impl PumpMode {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

impl fmt::Display for PumpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub pump_mode: PumpMode,
    pub override_pump_on: bool,
    pub pump_on_below: f64,
    pub pump_off_above: f64,
    pub send_interval_sec: u64,
}

impl Settings {
    pub fn with_defaults(send_interval_sec: u64) -> Self {
        Self {
            pump_mode: PumpMode::Auto,
            override_pump_on: false,
            pump_on_below: DEFAULT_ON_BELOW,
            pump_off_above: DEFAULT_OFF_ABOVE,
            send_interval_sec: send_interval_sec
                .clamp(MIN_SEND_INTERVAL_SEC, MAX_SEND_INTERVAL_SEC),
        }
    }

    /// Merges a settings response into the cache. Returns true when the
    /// effective configuration changed.
    pub fn merge(&mut self, body: &Value) -> bool {
        let before = self.clone();

        if let Some(mode) = body.get("pumpMode").and_then(Value::as_str) {
            match PumpMode::parse(mode) {
                Some(m) => self.pump_mode = m,
                None => warn!(mode, "ignoring unknown pumpMode"),
            }
        }

        if let Some(on) = body.get("overridePumpOn").and_then(Value::as_bool) {
            self.override_pump_on = on;
        }

        let on_below = percent(body, "pumpOnBelow").unwrap_or(self.pump_on_below);
        let off_above = percent(body, "pumpOffAbove").unwrap_or(self.pump_off_above);
        if on_below < off_above {
            self.pump_on_below = on_below;
            self.pump_off_above = off_above;
        } else {
            warn!(on_below, off_above, "ignoring inverted moisture band");
        }

        if let Some(secs) = body.get("sendIntervalSec").and_then(Value::as_u64) {
            if (MIN_SEND_INTERVAL_SEC..=MAX_SEND_INTERVAL_SEC).contains(&secs) {
                self.send_interval_sec = secs;
            } else {
                warn!(secs, "ignoring out-of-range sendIntervalSec");
            }
        }

        *self != before
    }
}

fn percent(body: &Value, field: &str) -> Option<f64> {
    let v = body.get(field)?.as_f64()?;
    if (0.0..=100.0).contains(&v) {
        Some(v)
    } else {
        warn!(field, value = v, "ignoring out-of-range threshold");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn defaults() -> Settings {
        Settings::with_defaults(60)
    }

    #[test]
    fn full_response_replaces_everything() {
        let mut s = defaults();
        let changed = s.merge(&json!({
            "deviceId": "esp32-001",
            "pumpMode": "manual",
            "overridePumpOn": true,
            "pumpOnBelow": 20.0,
            "pumpOffAbove": 60,
            "sendIntervalSec": 15,
            "version": 7
        }));
        assert!(changed);
        assert_eq!(
            s,
            Settings {
                pump_mode: PumpMode::Manual,
                override_pump_on: true,
                pump_on_below: 20.0,
                pump_off_above: 60.0,
                send_interval_sec: 15,
            }
        );
    }

    #[test]
    fn identical_response_is_not_a_change() {
        let mut s = defaults();
        let body = json!({
            "pumpMode": "auto",
            "overridePumpOn": false,
            "pumpOnBelow": 35.0,
            "pumpOffAbove": 45.0,
            "sendIntervalSec": 60
        });
        assert!(!s.merge(&body));
    }

    #[test]
    fn missing_fields_keep_cached_values() {
        let mut s = defaults();
        assert!(s.merge(&json!({ "overridePumpOn": true })));
        assert!(s.override_pump_on);
        assert_eq!(s.pump_mode, PumpMode::Auto);
        assert_eq!(s.pump_on_below, DEFAULT_ON_BELOW);
    }

    #[test]
    fn ill_typed_fields_are_ignored() {
        let mut s = defaults();
        let changed = s.merge(&json!({
            "pumpMode": 3,
            "overridePumpOn": "yes",
            "pumpOnBelow": "low",
            "pumpOffAbove": null,
            "sendIntervalSec": -1
        }));
        assert!(!changed);
        assert_eq!(s, defaults());
    }

    #[test]
    fn out_of_range_values_are_ignored() {
        let mut s = defaults();
        assert!(!s.merge(&json!({ "pumpOnBelow": -5, "pumpOffAbove": 140, "sendIntervalSec": 1 })));
        assert!(!s.merge(&json!({ "pumpMode": "turbo" })));
        assert_eq!(s, defaults());
    }

    #[test]
    fn inverted_band_keeps_previous_band() {
        let mut s = defaults();
        assert!(!s.merge(&json!({ "pumpOnBelow": 50.0 })));
        assert_eq!(s.pump_on_below, DEFAULT_ON_BELOW);
        assert_eq!(s.pump_off_above, DEFAULT_OFF_ABOVE);

        // Moving both edges together is fine.
        assert!(s.merge(&json!({ "pumpOnBelow": 50.0, "pumpOffAbove": 70.0 })));
        assert_eq!((s.pump_on_below, s.pump_off_above), (50.0, 70.0));
    }

    #[test]
    fn non_object_body_changes_nothing() {
        let mut s = defaults();
        assert!(!s.merge(&json!("oops")));
        assert!(!s.merge(&json!([1, 2, 3])));
        assert_eq!(s, defaults());
    }

    #[test]
    fn default_interval_is_clamped() {
        assert_eq!(Settings::with_defaults(0).send_interval_sec, 5);
        assert_eq!(Settings::with_defaults(86_400).send_interval_sec, 3600);
    }
}
