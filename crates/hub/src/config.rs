//! TOML config file loading, validation, and seeding of controller
//! desired state.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::credentials::AuthConfig;
use crate::db::{DeviceDefaults, PumpMode};
use crate::liveness::LivenessPolicy;
use crate::store::{self, DesiredStateStore, SettingsPatch};

/// Enrollment secrets shorter than this are rejected as guessable.
const MIN_ENROLL_SECRET_LEN: usize = 8;

/// Upper bound on `[liveness] multiplier`.
const MAX_LIVENESS_MULTIPLIER: i64 = 10;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub liveness: LivenessSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

/// Defaults for controllers seen for the first time.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PolicySection {
    pub pump_mode: PumpMode,
    pub pump_on_below: f64,
    pub pump_off_above: f64,
    pub send_interval_sec: i64,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            pump_mode: PumpMode::Auto,
            pump_on_below: 35.0,
            pump_off_above: 45.0,
            send_interval_sec: 60,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LivenessSection {
    pub floor_sec: i64,
    pub multiplier: i64,
}

impl Default for LivenessSection {
    fn default() -> Self {
        let p = LivenessPolicy::default();
        Self {
            floor_sec: p.floor_sec,
            multiplier: p.multiplier,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AuthSection {
    pub enroll_secret: Option<String>,
}

/// Pre-seeded controller. Omitted fields fall back to the policy.
#[derive(Debug, Deserialize)]
pub struct DeviceEntry {
    pub device_id: String,
    pub pump_mode: Option<PumpMode>,
    pub override_pump_on: Option<bool>,
    pub pump_on_below: Option<f64>,
    pub pump_off_above: Option<f64>,
    pub send_interval_sec: Option<i64>,
}

impl DeviceEntry {
    fn patch(&self) -> SettingsPatch {
        SettingsPatch {
            pump_mode: self.pump_mode,
            override_pump_on: self.override_pump_on,
            pump_on_below: self.pump_on_below,
            pump_off_above: self.pump_off_above,
            send_interval_sec: self.send_interval_sec,
            expected_version: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Derived runtime settings
// ---------------------------------------------------------------------------

impl Config {
    pub fn device_defaults(&self) -> DeviceDefaults {
        DeviceDefaults {
            pump_mode: self.policy.pump_mode,
            pump_on_below: self.policy.pump_on_below,
            pump_off_above: self.policy.pump_off_above,
            send_interval_sec: self.policy.send_interval_sec,
        }
    }

    pub fn liveness_policy(&self) -> LivenessPolicy {
        LivenessPolicy {
            floor_sec: self.liveness.floor_sec,
            multiplier: self.liveness.multiplier,
        }
    }

    /// `env_secret` (from `ENROLL_SECRET`) wins over the file value.
    pub fn auth_config(&self, env_secret: Option<String>) -> AuthConfig {
        AuthConfig {
            enroll_secret: env_secret
                .filter(|s| !s.is_empty())
                .or_else(|| self.auth.enroll_secret.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_policy(&mut errors);
        self.validate_liveness(&mut errors);
        self.validate_auth(&mut errors);
        self.validate_devices(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_policy(&self, errors: &mut Vec<String>) {
        let p = &self.policy;
        for e in store::violations(p.pump_on_below, p.pump_off_above, p.send_interval_sec) {
            errors.push(format!("policy: {e}"));
        }
    }

    fn validate_liveness(&self, errors: &mut Vec<String>) {
        if self.liveness.floor_sec <= 0 {
            errors.push(format!(
                "liveness: floor_sec must be positive, got {}",
                self.liveness.floor_sec
            ));
        }
        if !(1..=MAX_LIVENESS_MULTIPLIER).contains(&self.liveness.multiplier) {
            errors.push(format!(
                "liveness: multiplier must be in [1, {MAX_LIVENESS_MULTIPLIER}], got {}",
                self.liveness.multiplier
            ));
        }
    }

    fn validate_auth(&self, errors: &mut Vec<String>) {
        if let Some(secret) = &self.auth.enroll_secret {
            if secret.trim().len() < MIN_ENROLL_SECRET_LEN {
                errors.push(format!(
                    "auth: enroll_secret must be at least {MIN_ENROLL_SECRET_LEN} characters"
                ));
            }
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = || {
                if d.device_id.is_empty() {
                    format!("devices[{i}]")
                } else {
                    format!("device '{}'", d.device_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if let Err(e) = store::validate_device_id(&d.device_id) {
                errors.push(format!("{}: {e}", ctx()));
            } else if !seen_ids.insert(&d.device_id) {
                errors.push(format!("{}: duplicate device_id", ctx()));
            }

            // ── Settings, merged onto the policy ────────────────
            let on = d.pump_on_below.unwrap_or(self.policy.pump_on_below);
            let off = d.pump_off_above.unwrap_or(self.policy.pump_off_above);
            let interval = d.send_interval_sec.unwrap_or(self.policy.send_interval_sec);
            for e in store::violations(on, off, interval) {
                errors.push(format!("{}: {e}", ctx()));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Like [`load`], but a missing file yields the built-in defaults.
pub fn load_or_default(path: &str) -> Result<Config> {
    if Path::new(path).exists() {
        load(path)
    } else {
        tracing::warn!(path, "config file not found, using defaults");
        Ok(Config::default())
    }
}

/// Creates every pre-seeded controller that does not exist yet. Rows that
/// already exist are left as the operator last set them.
pub async fn apply(config: &Config, store: &DesiredStateStore) -> Result<()> {
    let mut created = 0;
    for d in &config.devices {
        if store
            .seed(&d.device_id, &d.patch())
            .await
            .with_context(|| format!("failed to seed device '{}'", d.device_id))?
        {
            created += 1;
        }
    }

    tracing::info!(
        devices = config.devices.len(),
        created,
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
