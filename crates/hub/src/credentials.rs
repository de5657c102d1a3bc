//! Per-controller shared secrets.
//!
//! The enrollment secret is injected through [`AuthConfig`] at construction
//! so tests can run with or without one.

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::HubError;
use crate::store::DesiredStateStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthConfig {
    /// When set, `issue` requires callers to present this value.
    pub enroll_secret: Option<String>,
}

#[derive(Clone)]
pub struct CredentialManager {
    store: DesiredStateStore,
    config: AuthConfig,
}

/// Compares without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn new_api_key() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

impl CredentialManager {
    pub fn new(store: DesiredStateStore, config: AuthConfig) -> Self {
        Self { store, config }
    }

    pub fn enrollment_required(&self) -> bool {
        self.config.enroll_secret.is_some()
    }

    /// Generates a fresh credential for `device_id`, replacing any previous
    /// one. Creates the desired-state row if this is the first contact.
    pub async fn issue(
        &self,
        device_id: &str,
        supplied_enroll_secret: Option<&str>,
    ) -> Result<String, HubError> {
        if let Some(expected) = &self.config.enroll_secret {
            let ok = supplied_enroll_secret
                .is_some_and(|s| constant_time_eq(s.as_bytes(), expected.as_bytes()));
            if !ok {
                warn!(device = %device_id, "rotate-key rejected: bad enrollment secret");
                return Err(HubError::Forbidden);
            }
        }

        self.store.get(device_id).await?;
        let key = new_api_key();
        self.store.db().set_api_key(device_id, &key).await?;
        info!(device = %device_id, "api key issued");
        Ok(key)
    }

    /// True only if the device has a credential and `supplied` matches it.
    pub async fn authenticate(&self, device_id: &str, supplied: &str) -> Result<bool, HubError> {
        let stored = self.store.db().api_key(device_id).await?;
        Ok(stored.is_some_and(|k| constant_time_eq(k.as_bytes(), supplied.as_bytes())))
    }

    /// `authenticate` that turns a mismatch into [`HubError::Unauthorized`].
    pub async fn require(&self, device_id: &str, supplied: Option<&str>) -> Result<(), HubError> {
        let Some(supplied) = supplied else {
            return Err(HubError::Unauthorized);
        };
        if self.authenticate(device_id, supplied).await? {
            Ok(())
        } else {
            warn!(device = %device_id, "authentication failed");
            Err(HubError::Unauthorized)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Db, DeviceDefaults, PumpMode};

    async fn manager(enroll_secret: Option<&str>) -> CredentialManager {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let store = DesiredStateStore::new(
            db,
            DeviceDefaults {
                pump_mode: PumpMode::Auto,
                pump_on_below: 35.0,
                pump_off_above: 45.0,
                send_interval_sec: 60,
            },
        );
        CredentialManager::new(
            store,
            AuthConfig {
                enroll_secret: enroll_secret.map(str::to_string),
            },
        )
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn api_keys_are_long_and_distinct() {
        let a = new_api_key();
        let b = new_api_key();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn issue_then_authenticate() {
        let m = manager(None).await;
        let key = m.issue("d1", None).await.unwrap();
        assert!(m.authenticate("d1", &key).await.unwrap());
        assert!(!m.authenticate("d1", "nope").await.unwrap());
        assert!(!m.authenticate("d2", &key).await.unwrap());
    }

    #[tokio::test]
    async fn rotation_invalidates_previous_key() {
        let m = manager(None).await;
        let old = m.issue("d1", None).await.unwrap();
        let new = m.issue("d1", None).await.unwrap();
        assert!(!m.authenticate("d1", &old).await.unwrap());
        assert!(m.authenticate("d1", &new).await.unwrap());
    }

    #[tokio::test]
    async fn device_without_key_never_authenticates() {
        let m = manager(None).await;
        m.store.get("d1").await.unwrap();
        assert!(!m.authenticate("d1", "").await.unwrap());
        assert!(matches!(m.require("d1", None).await, Err(HubError::Unauthorized)));
    }

    #[tokio::test]
    async fn enrollment_secret_gates_issue() {
        let m = manager(Some("s3cret")).await;
        assert!(m.enrollment_required());
        assert!(matches!(m.issue("d1", None).await, Err(HubError::Forbidden)));
        assert!(matches!(
            m.issue("d1", Some("wrong")).await,
            Err(HubError::Forbidden)
        ));
        let key = m.issue("d1", Some("s3cret")).await.unwrap();
        m.require("d1", Some(&key)).await.unwrap();
    }
}
