//! Online/offline classification from the age of a controller's last contact.
//!
//! Nothing here is stored or cached: the view is recomputed per request from
//! the newest ack / reading timestamp and the controller's poll interval.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessPolicy {
    /// Lower bound on the window regardless of poll interval.
    pub floor_sec: i64,
    /// Number of missed polls tolerated before going offline.
    pub multiplier: i64,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            floor_sec: 30,
            multiplier: 2,
        }
    }
}

impl LivenessPolicy {
    pub fn window_ms(&self, poll_interval_sec: i64) -> i64 {
        self.floor_sec
            .max(self.multiplier.saturating_mul(poll_interval_sec))
            .saturating_mul(1000)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessView {
    pub device_id: String,
    pub online: bool,
    pub last_seen_at: Option<i64>,
    pub age_ms: Option<i64>,
    pub window_ms: i64,
}

/// Newest of the two contact channels.
pub fn last_contact(last_ack: Option<i64>, last_reading: Option<i64>) -> Option<i64> {
    last_ack.max(last_reading)
}

pub fn evaluate(
    device_id: &str,
    last_seen_at: Option<i64>,
    poll_interval_sec: i64,
    policy: &LivenessPolicy,
    now_ms: i64,
) -> LivenessView {
    let window_ms = policy.window_ms(poll_interval_sec);
    let age_ms = last_seen_at.map(|t| now_ms - t);
    LivenessView {
        device_id: device_id.to_string(),
        online: age_ms.is_some_and(|age| age <= window_ms),
        last_seen_at,
        age_ms,
        window_ms,
    }
}
