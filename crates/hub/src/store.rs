//! Desired-state store: one row of operator intent per controller.
//!
//! Reads create the row from policy defaults when it is missing, so a
//! controller's first contact is enough to register it. Patches only touch
//! the fields they name; concurrent patches to different fields both land,
//! concurrent patches to the same field are last-writer-wins unless the
//! caller pins `expectedVersion`.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::db::{Db, DesiredState, DeviceDefaults, FieldUpdate, PumpMode};
use crate::error::HubError;

pub const MIN_SEND_INTERVAL_SEC: i64 = 5;
pub const MAX_SEND_INTERVAL_SEC: i64 = 3600;
const MAX_DEVICE_ID_LEN: usize = 64;
const CHANGE_QUEUE_DEPTH: usize = 64;

/// Partial update of named fields. Unknown JSON fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub pump_mode: Option<PumpMode>,
    pub override_pump_on: Option<bool>,
    pub pump_on_below: Option<f64>,
    pub pump_off_above: Option<f64>,
    pub send_interval_sec: Option<i64>,
    /// Reject the patch unless the stored version still equals this.
    pub expected_version: Option<i64>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        self.fields() == FieldUpdate::default()
    }

    fn fields(&self) -> FieldUpdate {
        FieldUpdate {
            pump_mode: self.pump_mode,
            override_pump_on: self.override_pump_on,
            pump_on_below: self.pump_on_below,
            pump_off_above: self.pump_off_above,
            send_interval_sec: self.send_interval_sec,
        }
    }

    fn merged_onto(&self, s: &DesiredState) -> DesiredState {
        DesiredState {
            pump_mode: self.pump_mode.unwrap_or(s.pump_mode),
            override_pump_on: self.override_pump_on.unwrap_or(s.override_pump_on),
            pump_on_below: self.pump_on_below.unwrap_or(s.pump_on_below),
            pump_off_above: self.pump_off_above.unwrap_or(s.pump_off_above),
            send_interval_sec: self.send_interval_sec.unwrap_or(s.send_interval_sec),
            ..s.clone()
        }
    }
}

fn same_settings(a: &DesiredState, b: &DesiredState) -> bool {
    a.pump_mode == b.pump_mode
        && a.override_pump_on == b.override_pump_on
        && a.pump_on_below == b.pump_on_below
        && a.pump_off_above == b.pump_off_above
        && a.send_interval_sec == b.send_interval_sec
}

/// Every rule the given settings break. An empty vec means valid.
pub fn violations(pump_on_below: f64, pump_off_above: f64, send_interval_sec: i64) -> Vec<String> {
    let mut errors = Vec::new();

    if !(0.0..=100.0).contains(&pump_on_below) {
        errors.push(format!("pumpOnBelow {pump_on_below} out of range [0, 100]"));
    }
    if !(0.0..=100.0).contains(&pump_off_above) {
        errors.push(format!("pumpOffAbove {pump_off_above} out of range [0, 100]"));
    }
    if pump_on_below >= pump_off_above {
        errors.push(format!(
            "pumpOnBelow ({pump_on_below}) must be less than pumpOffAbove ({pump_off_above})"
        ));
    }
    if !(MIN_SEND_INTERVAL_SEC..=MAX_SEND_INTERVAL_SEC).contains(&send_interval_sec) {
        errors.push(format!(
            "sendIntervalSec {send_interval_sec} out of range \
             [{MIN_SEND_INTERVAL_SEC}, {MAX_SEND_INTERVAL_SEC}]"
        ));
    }

    errors
}

/// Device ids appear in URLs and logs, so keep them to a safe alphabet.
pub fn validate_device_id(device_id: &str) -> Result<(), HubError> {
    let ok = !device_id.is_empty()
        && device_id.len() <= MAX_DEVICE_ID_LEN
        && device_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if ok {
        Ok(())
    } else {
        Err(HubError::InvalidRequest(format!("invalid device id '{device_id}'")))
    }
}

/// Result of applying one patch across every known controller.
#[derive(Debug, Default, Serialize, PartialEq)]
pub struct PolicyOutcome {
    pub updated: usize,
    pub unchanged: usize,
    pub rejected: Vec<String>,
}

/// Published after every write that bumps a controller's version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsChanged {
    pub device_id: String,
    pub version: i64,
}

#[derive(Clone)]
pub struct DesiredStateStore {
    db: Db,
    defaults: DeviceDefaults,
    changes: broadcast::Sender<SettingsChanged>,
}

impl DesiredStateStore {
    pub fn new(db: Db, defaults: DeviceDefaults) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_QUEUE_DEPTH);
        Self {
            db,
            defaults,
            changes,
        }
    }

    /// Receives every subsequent version bump, for all controllers.
    pub fn subscribe(&self) -> broadcast::Receiver<SettingsChanged> {
        self.changes.subscribe()
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Upsert-on-read.
    pub async fn get(&self, device_id: &str) -> Result<DesiredState, HubError> {
        validate_device_id(device_id)?;
        if self.db.ensure_device(device_id, &self.defaults).await? {
            info!(device = %device_id, "desired state created from policy defaults");
        }
        self.db
            .get_device(device_id)
            .await?
            .ok_or_else(|| HubError::NotFound(device_id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<DesiredState>, HubError> {
        Ok(self.db.list_devices().await?)
    }

    pub async fn patch(
        &self,
        device_id: &str,
        patch: &SettingsPatch,
    ) -> Result<DesiredState, HubError> {
        let current = self.get(device_id).await?;
        let merged = patch.merged_onto(&current);

        let errors = violations(
            merged.pump_on_below,
            merged.pump_off_above,
            merged.send_interval_sec,
        );
        if !errors.is_empty() {
            return Err(HubError::InvalidRequest(errors.join("; ")));
        }

        if same_settings(&merged, &current) {
            debug!(device = %device_id, "patch is a no-op");
            return Ok(current);
        }

        if let Some(expected) = patch.expected_version {
            if expected != current.version {
                return Err(HubError::Conflict {
                    expected,
                    current: current.version,
                });
            }
        }

        let changed = self
            .db
            .update_device(device_id, &patch.fields(), patch.expected_version)
            .await?;
        let updated = self.get(device_id).await?;

        if changed == 0 {
            // Only reachable when another writer bumped the version between
            // our read and the conditional update.
            return Err(HubError::Conflict {
                expected: patch.expected_version.unwrap_or(current.version),
                current: updated.version,
            });
        }

        info!(
            device = %device_id,
            version = updated.version,
            mode = %updated.pump_mode,
            "desired state patched"
        );
        // No subscribers is fine: controllers still poll.
        let _ = self.changes.send(SettingsChanged {
            device_id: device_id.to_string(),
            version: updated.version,
        });
        Ok(updated)
    }

    /// Creates `device_id` from the policy defaults with `patch` on top.
    /// Returns false, touching nothing, when the row already exists.
    pub async fn seed(&self, device_id: &str, patch: &SettingsPatch) -> Result<bool, HubError> {
        validate_device_id(device_id)?;
        if !self.db.ensure_device(device_id, &self.defaults).await? {
            return Ok(false);
        }
        self.patch(device_id, patch).await?;
        info!(device = %device_id, "desired state seeded from config");
        Ok(true)
    }

    /// Applies `patch` to every known controller. Controllers whose merged
    /// settings would be invalid are skipped and listed in `rejected`.
    pub async fn apply_policy(&self, patch: &SettingsPatch) -> Result<PolicyOutcome, HubError> {
        let patch = SettingsPatch {
            expected_version: None,
            ..patch.clone()
        };
        let mut outcome = PolicyOutcome::default();

        for device in self.db.list_devices().await? {
            let before = device.version;
            match self.patch(&device.device_id, &patch).await {
                Ok(after) if after.version != before => outcome.updated += 1,
                Ok(_) => outcome.unchanged += 1,
                Err(HubError::InvalidRequest(reason)) => {
                    outcome.rejected.push(format!("{}: {reason}", device.device_id));
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            updated = outcome.updated,
            unchanged = outcome.unchanged,
            rejected = outcome.rejected.len(),
            "policy applied"
        );
        Ok(outcome)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> DesiredStateStore {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        DesiredStateStore::new(
            db,
            DeviceDefaults {
                pump_mode: PumpMode::Auto,
                pump_on_below: 35.0,
                pump_off_above: 45.0,
                send_interval_sec: 60,
            },
        )
    }

    #[tokio::test]
    async fn get_creates_with_defaults() {
        let store = test_store().await;
        let s = store.get("esp32-001").await.unwrap();
        assert_eq!(s.pump_mode, PumpMode::Auto);
        assert!(!s.override_pump_on);
        assert_eq!(s.pump_on_below, 35.0);
        assert_eq!(s.pump_off_above, 45.0);
        assert_eq!(s.version, 1);

        // Second read returns the same row, not a fresh one.
        assert_eq!(store.get("esp32-001").await.unwrap(), s);
    }

    #[tokio::test]
    async fn get_rejects_bad_device_id() {
        let store = test_store().await;
        assert!(matches!(
            store.get("bad id/with slash").await,
            Err(HubError::InvalidRequest(_))
        ));
        assert!(matches!(store.get("").await, Err(HubError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn patch_leaves_unnamed_fields_alone() {
        let store = test_store().await;
        let patch: SettingsPatch =
            serde_json::from_str(r#"{"pumpMode":"manual","overridePumpOn":true,"color":"red"}"#)
                .unwrap();

        let s = store.patch("d1", &patch).await.unwrap();
        assert_eq!(s.pump_mode, PumpMode::Manual);
        assert!(s.override_pump_on);
        assert_eq!(s.pump_on_below, 35.0);
        assert_eq!(s.pump_off_above, 45.0);
        assert_eq!(s.version, 2);
    }

    #[tokio::test]
    async fn repeated_identical_patch_is_idempotent() {
        let store = test_store().await;
        let patch = SettingsPatch {
            pump_on_below: Some(20.0),
            ..Default::default()
        };

        let first = store.patch("d1", &patch).await.unwrap();
        let second = store.patch("d1", &patch).await.unwrap();
        let third = store.patch("d1", &patch).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second, third);
        assert_eq!(third.version, 2);
    }

    #[tokio::test]
    async fn inverted_band_is_rejected_and_state_kept() {
        let store = test_store().await;
        let patch = SettingsPatch {
            pump_on_below: Some(50.0),
            ..Default::default()
        };
        let err = store.patch("d1", &patch).await.unwrap_err();
        assert!(matches!(err, HubError::InvalidRequest(ref m) if m.contains("must be less than")));

        let s = store.get("d1").await.unwrap();
        assert_eq!(s.pump_on_below, 35.0);
        assert_eq!(s.version, 1);
    }

    #[tokio::test]
    async fn band_can_move_in_one_patch() {
        let store = test_store().await;
        let patch = SettingsPatch {
            pump_on_below: Some(60.0),
            pump_off_above: Some(70.0),
            ..Default::default()
        };
        let s = store.patch("d1", &patch).await.unwrap();
        assert_eq!((s.pump_on_below, s.pump_off_above), (60.0, 70.0));
    }

    #[tokio::test]
    async fn stale_expected_version_conflicts() {
        let store = test_store().await;
        store
            .patch(
                "d1",
                &SettingsPatch {
                    override_pump_on: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let stale = SettingsPatch {
            pump_mode: Some(PumpMode::Manual),
            expected_version: Some(1),
            ..Default::default()
        };
        assert!(matches!(
            store.patch("d1", &stale).await,
            Err(HubError::Conflict { expected: 1, current: 2 })
        ));

        let fresh = SettingsPatch {
            expected_version: Some(2),
            ..stale
        };
        let s = store.patch("d1", &fresh).await.unwrap();
        assert_eq!(s.pump_mode, PumpMode::Manual);
        assert_eq!(s.version, 3);
    }

    #[tokio::test]
    async fn send_interval_bounds() {
        let store = test_store().await;
        for bad in [0, 4, 3601] {
            let patch = SettingsPatch {
                send_interval_sec: Some(bad),
                ..Default::default()
            };
            assert!(store.patch("d1", &patch).await.is_err(), "{bad} accepted");
        }
    }

    #[tokio::test]
    async fn apply_policy_reports_each_device() {
        let store = test_store().await;
        store.get("a").await.unwrap();
        store.get("b").await.unwrap();
        store
            .patch(
                "b",
                &SettingsPatch {
                    pump_on_below: Some(10.0),
                    pump_off_above: Some(20.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store.get("c").await.unwrap();
        store
            .patch(
                "c",
                &SettingsPatch {
                    pump_off_above: Some(40.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // a (off 45) and c (off 40) accept 38; b (off 20) cannot.
        let outcome = store
            .apply_policy(&SettingsPatch {
                pump_on_below: Some(38.0),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome.updated, 2);
        assert_eq!(outcome.unchanged, 0);
        assert_eq!(outcome.rejected.len(), 1);
        assert!(outcome.rejected[0].starts_with("b:"));

        let again = store
            .apply_policy(&SettingsPatch {
                pump_on_below: Some(38.0),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(again.updated, 0);
        assert_eq!(again.unchanged, 2);
    }

    #[tokio::test]
    async fn seed_only_touches_new_rows() {
        let store = test_store().await;
        let seed = SettingsPatch {
            pump_on_below: Some(30.0),
            ..Default::default()
        };
        assert!(store.seed("a", &seed).await.unwrap());
        assert_eq!(store.get("a").await.unwrap().pump_on_below, 30.0);

        store.get("b").await.unwrap();
        assert!(!store.seed("b", &seed).await.unwrap());
        assert_eq!(store.get("b").await.unwrap().pump_on_below, 35.0);
        assert!(!store.seed("a", &seed).await.unwrap());
    }

    #[tokio::test]
    async fn version_bumps_are_published() {
        let store = test_store().await;
        let mut changes = store.subscribe();

        let patch = SettingsPatch {
            override_pump_on: Some(true),
            ..Default::default()
        };
        let updated = store.patch("d1", &patch).await.unwrap();
        assert_eq!(
            changes.try_recv().unwrap(),
            SettingsChanged {
                device_id: "d1".into(),
                version: updated.version,
            }
        );

        // A no-op patch publishes nothing.
        store.patch("d1", &patch).await.unwrap();
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn violations_collects_everything() {
        let errs = violations(120.0, -1.0, 1);
        assert_eq!(errs.len(), 4, "{errs:?}");
        assert!(violations(35.0, 45.0, 60).is_empty());
    }
}
