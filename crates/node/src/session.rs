//! Api key lifecycle: load from disk, provision through enrollment, and
//! re-provision when the hub stops accepting the current key.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::client::{ClientError, HubClient};

const PROVISION_RETRY: Duration = Duration::from_secs(5);

/// On-disk form of the credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCredential {
    pub device_id: String,
    pub api_key: String,
}

/// Returns the stored key for `device_id`. A file written for another
/// device id, or one that does not parse, counts as absent.
pub fn load_credential(path: &Path, device_id: &str) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<StoredCredential>(&contents) {
        Ok(c) if c.device_id == device_id && !c.api_key.is_empty() => Some(c.api_key),
        Ok(c) => {
            warn!(path = %path.display(), stored = %c.device_id, "credential belongs to another device");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), "unreadable credential file: {e}");
            None
        }
    }
}

pub fn save_credential(path: &Path, cred: &StoredCredential) -> Result<()> {
    let json = serde_json::to_string_pretty(cred)?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

pub struct Session {
    client: HubClient,
    state_path: PathBuf,
    enroll_secret: Option<String>,
    api_key: RwLock<String>,
    provisioning: Mutex<()>,
}

impl Session {
    /// Loads the stored credential or provisions a new one, retrying until
    /// the hub accepts. The relay stays off while this runs.
    pub async fn start(
        client: HubClient,
        state_path: PathBuf,
        enroll_secret: Option<String>,
    ) -> Arc<Self> {
        let stored = load_credential(&state_path, client.device_id());
        let session = Arc::new(Self {
            client,
            state_path,
            enroll_secret,
            api_key: RwLock::new(stored.clone().unwrap_or_default()),
            provisioning: Mutex::new(()),
        });

        if stored.is_some() {
            info!(device = %session.client.device_id(), "loaded stored credential");
            return session;
        }

        loop {
            match session.reprovision("").await {
                Ok(()) => return session,
                Err(e) => {
                    warn!("provisioning failed: {e}; retrying in {}s", PROVISION_RETRY.as_secs());
                    tokio::time::sleep(PROVISION_RETRY).await;
                }
            }
        }
    }

    pub fn client(&self) -> &HubClient {
        &self.client
    }

    pub async fn api_key(&self) -> String {
        self.api_key.read().await.clone()
    }

    /// Replaces `stale` with a freshly issued key. If another task already
    /// replaced it, this is a no-op, so concurrent 401s rotate only once.
    pub async fn reprovision(&self, stale: &str) -> Result<(), ClientError> {
        let _guard = self.provisioning.lock().await;
        if *self.api_key.read().await != stale {
            return Ok(());
        }

        let key = self.client.rotate_key(self.enroll_secret.as_deref()).await?;
        let cred = StoredCredential {
            device_id: self.client.device_id().to_string(),
            api_key: key.clone(),
        };
        if let Err(e) = save_credential(&self.state_path, &cred) {
            warn!("credential not persisted: {e:#}");
        }
        *self.api_key.write().await = key;

        info!(device = %self.client.device_id(), "api key provisioned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pump-node-{}-{name}.json", std::process::id()))
    }

    #[test]
    fn credential_round_trips_through_disk() {
        let path = temp_path("roundtrip");
        let cred = StoredCredential {
            device_id: "d1".into(),
            api_key: "abc123".into(),
        };
        save_credential(&path, &cred).unwrap();
        assert_eq!(load_credential(&path, "d1").as_deref(), Some("abc123"));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn credential_for_other_device_is_ignored() {
        let path = temp_path("other");
        let cred = StoredCredential {
            device_id: "d2".into(),
            api_key: "abc123".into(),
        };
        save_credential(&path, &cred).unwrap();
        assert_eq!(load_credential(&path, "d1"), None);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_or_garbled_file_is_absent() {
        assert_eq!(load_credential(&temp_path("missing"), "d1"), None);

        let path = temp_path("garbled");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_credential(&path, "d1"), None);
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn stale_reprovision_is_a_noop() {
        let path = temp_path("stale");
        save_credential(
            &path,
            &StoredCredential {
                device_id: "d1".into(),
                api_key: "current".into(),
            },
        )
        .unwrap();

        // Nothing listens here; a real rotation would fail.
        let client = HubClient::new("http://127.0.0.1:9", "d1", Duration::from_millis(200)).unwrap();
        let session = Session::start(client, path.clone(), None).await;
        assert_eq!(session.api_key().await, "current");

        session.reprovision("older").await.unwrap();
        assert_eq!(session.api_key().await, "current");
        std::fs::remove_file(&path).unwrap();
    }
}
