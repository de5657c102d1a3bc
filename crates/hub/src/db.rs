use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpMode {
    Auto,
    Manual,
}

impl PumpMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for PumpMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown pump mode '{other}'")),
        }
    }
}

impl fmt::Display for PumpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator intent for one controller. The credential lives in the same
/// row but is never part of this view.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredState {
    pub device_id: String,
    pub pump_mode: PumpMode,
    pub override_pump_on: bool,
    pub pump_on_below: f64,
    pub pump_off_above: f64,
    pub send_interval_sec: i64,
    pub version: i64,
    pub updated_at: i64,
}

/// Values a controller row is created with on first contact.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDefaults {
    pub pump_mode: PumpMode,
    pub pump_on_below: f64,
    pub pump_off_above: f64,
    pub send_interval_sec: i64,
}

/// Column-level update. `None` leaves the stored column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldUpdate {
    pub pump_mode: Option<PumpMode>,
    pub override_pump_on: Option<bool>,
    pub pump_on_below: Option<f64>,
    pub pump_off_above: Option<f64>,
    pub send_interval_sec: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckRecord {
    pub id: i64,
    pub device_id: String,
    pub pump_on: bool,
    pub pump_mode: PumpMode,
    pub note: String,
    pub reported_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WateringEvent {
    pub id: i64,
    pub device_id: String,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub triggered_by: PumpMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewReading<'a> {
    pub device_id: &'a str,
    pub ts: i64,
    pub moisture: f64,
    pub raw: Option<i64>,
    pub pump_on: Option<bool>,
    pub note: Option<&'a str>,
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct DeviceRow {
    device_id: String,
    pump_mode: String,
    override_pump_on: bool,
    pump_on_below: f64,
    pump_off_above: f64,
    send_interval_sec: i64,
    version: i64,
    updated_at: i64,
}

impl TryFrom<DeviceRow> for DesiredState {
    type Error = anyhow::Error;

    fn try_from(r: DeviceRow) -> Result<Self> {
        Ok(Self {
            pump_mode: r.pump_mode.parse().map_err(|e: String| anyhow!(e))?,
            device_id: r.device_id,
            override_pump_on: r.override_pump_on,
            pump_on_below: r.pump_on_below,
            pump_off_above: r.pump_off_above,
            send_interval_sec: r.send_interval_sec,
            version: r.version,
            updated_at: r.updated_at,
        })
    }
}

#[derive(FromRow)]
struct AckRow {
    id: i64,
    device_id: String,
    pump_on: bool,
    pump_mode: String,
    note: String,
    reported_at: i64,
}

impl TryFrom<AckRow> for AckRecord {
    type Error = anyhow::Error;

    fn try_from(r: AckRow) -> Result<Self> {
        Ok(Self {
            pump_mode: r.pump_mode.parse().map_err(|e: String| anyhow!(e))?,
            id: r.id,
            device_id: r.device_id,
            pump_on: r.pump_on,
            note: r.note,
            reported_at: r.reported_at,
        })
    }
}

#[derive(FromRow)]
struct EventRow {
    id: i64,
    device_id: String,
    started_at: i64,
    ended_at: Option<i64>,
    triggered_by: String,
}

impl TryFrom<EventRow> for WateringEvent {
    type Error = anyhow::Error;

    fn try_from(r: EventRow) -> Result<Self> {
        Ok(Self {
            triggered_by: r.triggered_by.parse().map_err(|e: String| anyhow!(e))?,
            id: r.id,
            device_id: r.device_id,
            started_at: r.started_at,
            ended_at: r.ended_at,
        })
    }
}

const DEVICE_COLUMNS: &str = "device_id, pump_mode, override_pump_on, pump_on_below, \
     pump_off_above, send_interval_sec, version, updated_at";

/// Current wall-clock time as unix milliseconds.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/pump-hub/hub.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Desired state
    // ----------------------------

    /// Creates the device row with `defaults` unless it already exists.
    /// Returns true when a row was created.
    pub async fn ensure_device(&self, device_id: &str, defaults: &DeviceDefaults) -> Result<bool> {
        let now = now_ms();
        let res = sqlx::query(
            r#"
            INSERT INTO devices (
              device_id, pump_mode, override_pump_on,
              pump_on_below, pump_off_above, send_interval_sec,
              version, created_at, updated_at
            ) VALUES (?, ?, 0, ?, ?, ?, 1, ?, ?)
            ON CONFLICT(device_id) DO NOTHING
            "#,
        )
        .bind(device_id)
        .bind(defaults.pump_mode.as_str())
        .bind(defaults.pump_on_below)
        .bind(defaults.pump_off_above)
        .bind(defaults.send_interval_sec)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("ensure_device failed")?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Option<DesiredState>> {
        let row: Option<DeviceRow> = sqlx::query_as(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE device_id = ?"
        ))
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_device failed")?;

        row.map(DesiredState::try_from).transpose()
    }

    pub async fn list_devices(&self) -> Result<Vec<DesiredState>> {
        let rows: Vec<DeviceRow> = sqlx::query_as(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices ORDER BY device_id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("list_devices failed")?;

        rows.into_iter().map(DesiredState::try_from).collect()
    }

    /// Writes only the supplied columns and bumps `version`. With
    /// `expected_version` the write only happens if the stored version
    /// still matches. Returns the number of rows changed (0 or 1).
    pub async fn update_device(
        &self,
        device_id: &str,
        u: &FieldUpdate,
        expected_version: Option<i64>,
    ) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE devices SET
              pump_mode = COALESCE(?, pump_mode),
              override_pump_on = COALESCE(?, override_pump_on),
              pump_on_below = COALESCE(?, pump_on_below),
              pump_off_above = COALESCE(?, pump_off_above),
              send_interval_sec = COALESCE(?, send_interval_sec),
              version = version + 1,
              updated_at = ?
            WHERE device_id = ? AND (? IS NULL OR version = ?)
            "#,
        )
        .bind(u.pump_mode.map(PumpMode::as_str))
        .bind(u.override_pump_on)
        .bind(u.pump_on_below)
        .bind(u.pump_off_above)
        .bind(u.send_interval_sec)
        .bind(now_ms())
        .bind(device_id)
        .bind(expected_version)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .context("update_device failed")?;
        Ok(res.rows_affected())
    }

    // ----------------------------
    // Credentials
    // ----------------------------

    pub async fn set_api_key(&self, device_id: &str, api_key: &str) -> Result<()> {
        sqlx::query("UPDATE devices SET api_key = ?, updated_at = ? WHERE device_id = ?")
            .bind(api_key)
            .bind(now_ms())
            .bind(device_id)
            .execute(&self.pool)
            .await
            .context("set_api_key failed")?;
        Ok(())
    }

    pub async fn api_key(&self, device_id: &str) -> Result<Option<String>> {
        let key: Option<Option<String>> =
            sqlx::query_scalar("SELECT api_key FROM devices WHERE device_id = ?")
                .bind(device_id)
                .fetch_optional(&self.pool)
                .await
                .context("api_key lookup failed")?;
        Ok(key.flatten())
    }

    // ----------------------------
    // Ack log
    // ----------------------------

    pub async fn insert_ack(
        &self,
        device_id: &str,
        pump_on: bool,
        pump_mode: PumpMode,
        note: &str,
        reported_at: i64,
    ) -> Result<AckRecord> {
        let res = sqlx::query(
            r#"
            INSERT INTO acks (device_id, pump_on, pump_mode, note, reported_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(device_id)
        .bind(pump_on)
        .bind(pump_mode.as_str())
        .bind(note)
        .bind(reported_at)
        .execute(&self.pool)
        .await
        .context("insert_ack failed")?;

        Ok(AckRecord {
            id: res.last_insert_rowid(),
            device_id: device_id.to_string(),
            pump_on,
            pump_mode,
            note: note.to_string(),
            reported_at,
        })
    }

    /// Newest first.
    pub async fn recent_acks(&self, device_id: &str, limit: i64) -> Result<Vec<AckRecord>> {
        let rows: Vec<AckRow> = sqlx::query_as(
            r#"
            SELECT id, device_id, pump_on, pump_mode, note, reported_at
            FROM acks
            WHERE device_id = ?
            ORDER BY reported_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_acks failed")?;

        rows.into_iter().map(AckRecord::try_from).collect()
    }

    /// Full history in arrival order.
    pub async fn ack_history(&self, device_id: &str) -> Result<Vec<AckRecord>> {
        let rows: Vec<AckRow> = sqlx::query_as(
            r#"
            SELECT id, device_id, pump_on, pump_mode, note, reported_at
            FROM acks
            WHERE device_id = ?
            ORDER BY reported_at ASC, id ASC
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await
        .context("ack_history failed")?;

        rows.into_iter().map(AckRecord::try_from).collect()
    }

    pub async fn latest_ack_ts(&self, device_id: &str) -> Result<Option<i64>> {
        let ts: Option<i64> =
            sqlx::query_scalar("SELECT MAX(reported_at) FROM acks WHERE device_id = ?")
                .bind(device_id)
                .fetch_one(&self.pool)
                .await
                .context("latest_ack_ts failed")?;
        Ok(ts)
    }

    // ----------------------------
    // Readings
    // ----------------------------

    pub async fn insert_reading(&self, r: &NewReading<'_>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO readings (device_id, ts, moisture, raw, pump_on, note)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(r.device_id)
        .bind(r.ts)
        .bind(r.moisture)
        .bind(r.raw)
        .bind(r.pump_on)
        .bind(r.note)
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?;
        Ok(())
    }

    pub async fn latest_reading_ts(&self, device_id: &str) -> Result<Option<i64>> {
        let ts: Option<i64> =
            sqlx::query_scalar("SELECT MAX(ts) FROM readings WHERE device_id = ?")
                .bind(device_id)
                .fetch_one(&self.pool)
                .await
                .context("latest_reading_ts failed")?;
        Ok(ts)
    }

    // ----------------------------
    // Watering events
    // ----------------------------

    pub async fn open_event(&self, device_id: &str) -> Result<Option<WateringEvent>> {
        let row: Option<EventRow> = sqlx::query_as(
            r#"
            SELECT id, device_id, started_at, ended_at, triggered_by
            FROM watering_events
            WHERE device_id = ? AND ended_at IS NULL
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("open_event failed")?;

        row.map(WateringEvent::try_from).transpose()
    }

    /// Opens an event unless one is already open (the partial unique index
    /// rejects a second one). Returns true when a row was inserted.
    pub async fn insert_open_event(
        &self,
        device_id: &str,
        started_at: i64,
        triggered_by: PumpMode,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            INSERT OR IGNORE INTO watering_events (device_id, started_at, ended_at, triggered_by)
            VALUES (?, ?, NULL, ?)
            "#,
        )
        .bind(device_id)
        .bind(started_at)
        .bind(triggered_by.as_str())
        .execute(&self.pool)
        .await
        .context("insert_open_event failed")?;
        Ok(res.rows_affected() == 1)
    }

    /// Closes the open event, if any. Returns true when a row was closed.
    pub async fn close_open_event(&self, device_id: &str, ended_at: i64) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE watering_events SET ended_at = ?
            WHERE device_id = ? AND ended_at IS NULL
            "#,
        )
        .bind(ended_at)
        .bind(device_id)
        .execute(&self.pool)
        .await
        .context("close_open_event failed")?;
        Ok(res.rows_affected() == 1)
    }

    /// Newest first.
    pub async fn list_events(&self, device_id: &str, limit: i64) -> Result<Vec<WateringEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT id, device_id, started_at, ended_at, triggered_by
            FROM watering_events
            WHERE device_id = ?
            ORDER BY started_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("list_events failed")?;

        rows.into_iter().map(WateringEvent::try_from).collect()
    }

    /// Atomically swaps a device's stored events for `events`
    /// (`(started_at, ended_at, triggered_by)` tuples, oldest first).
    pub async fn replace_events(
        &self,
        device_id: &str,
        events: &[(i64, Option<i64>, PumpMode)],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin replace_events")?;

        sqlx::query("DELETE FROM watering_events WHERE device_id = ?")
            .bind(device_id)
            .execute(&mut *tx)
            .await
            .context("delete watering_events failed")?;

        for &(started_at, ended_at, triggered_by) in events {
            sqlx::query(
                r#"
                INSERT INTO watering_events (device_id, started_at, ended_at, triggered_by)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(device_id)
            .bind(started_at)
            .bind(ended_at)
            .bind(triggered_by.as_str())
            .execute(&mut *tx)
            .await
            .context("insert watering_event failed")?;
        }

        tx.commit().await.context("commit replace_events")?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
