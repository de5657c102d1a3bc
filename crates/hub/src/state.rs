use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::db::PumpMode;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// In-memory activity view for operators. Not a source of truth: the
/// database holds acks and events, this only keeps the recent tail.
pub struct SystemState {
    pub started_at: Instant,
    pub devices: HashMap<String, DeviceActivity>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceActivity {
    #[serde(with = "time::serde::rfc3339")]
    pub last_ack: OffsetDateTime,
    pub pump_on: bool,
    pub pump_mode: PumpMode,
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
    Ack,
    Watering,
    Settings,
    Auth,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub devices: HashMap<String, DeviceActivity>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            devices: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a sensor reading from a controller.
    pub fn record_reading(&mut self, device_id: &str, moisture: f64) {
        self.push_event(EventKind::Reading, format!("{device_id}: moisture={moisture:.1}"));
    }

    /// Record an applied-state report.
    pub fn record_ack(&mut self, device_id: &str, pump_on: bool, pump_mode: PumpMode, note: &str) {
        self.devices.insert(
            device_id.to_string(),
            DeviceActivity {
                last_ack: OffsetDateTime::now_utc(),
                pump_on,
                pump_mode,
            },
        );

        let state_str = if pump_on { "ON" } else { "OFF" };
        self.push_event(
            EventKind::Ack,
            format!("{device_id}: pump {state_str} ({pump_mode}) {note}"),
        );
    }

    /// Record the start or end of a derived watering session.
    pub fn record_watering(&mut self, device_id: &str, started: bool, triggered_by: PumpMode) {
        let detail = if started {
            format!("{device_id}: watering started ({triggered_by})")
        } else {
            format!("{device_id}: watering ended")
        };
        self.push_event(EventKind::Watering, detail);
    }

    /// Record an operator change to desired state.
    pub fn record_settings(&mut self, detail: String) {
        self.push_event(EventKind::Settings, detail);
    }

    /// Record a credential issue or rejection.
    pub fn record_auth(&mut self, detail: String) {
        self.push_event(EventKind::Auth, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot, newest events first.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            devices: self.devices.clone(),
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

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}
