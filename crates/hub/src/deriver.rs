//! Watering sessions reconstructed from the ack stream.
//!
//! The fold carries one bit of state per controller: whether a session is
//! open. [`apply`] runs a single ack against the stored events (normal
//! operation); [`replay`] runs the same [`step`] over a whole history, so
//! rebuilding from scratch yields what incremental derivation produced.
//!
//! Derivation, incremental and full rebuilds alike, is fed through one
//! background task, so a rebuild never interleaves with a live ack. The storage layer backs this up: opening goes through a
//! partial unique index and closing is a conditional update, so a lost race
//! degrades to a no-op rather than a second open session.

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::db::{AckRecord, Db, PumpMode};
use crate::state::SharedState;

const QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Open { started_at: i64, triggered_by: PumpMode },
    Close { ended_at: i64 },
    Noop,
}

/// One derived watering session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub triggered_by: PumpMode,
}

pub fn step(has_open: bool, ack: &AckRecord) -> Transition {
    match (ack.pump_on, has_open) {
        (true, false) => Transition::Open {
            started_at: ack.reported_at,
            triggered_by: ack.pump_mode,
        },
        (false, true) => Transition::Close {
            ended_at: ack.reported_at,
        },
        // Duplicate "on" or an "off" with nothing open.
        _ => Transition::Noop,
    }
}

/// Left fold over a full ack history (oldest first).
pub fn replay<'a>(acks: impl IntoIterator<Item = &'a AckRecord>) -> Vec<Session> {
    let mut sessions: Vec<Session> = Vec::new();
    let mut open: Option<usize> = None;

    for ack in acks {
        match step(open.is_some(), ack) {
            Transition::Open {
                started_at,
                triggered_by,
            } => {
                sessions.push(Session {
                    started_at,
                    ended_at: None,
                    triggered_by,
                });
                open = Some(sessions.len() - 1);
            }
            Transition::Close { ended_at } => {
                if let Some(i) = open.take() {
                    sessions[i].ended_at = Some(ended_at);
                }
            }
            Transition::Noop => {}
        }
    }

    sessions
}

/// Applies one ack to the stored events. Returns the transition that was
/// actually written.
pub async fn apply(db: &Db, ack: &AckRecord) -> Result<Transition> {
    let has_open = db.open_event(&ack.device_id).await?.is_some();
    let transition = step(has_open, ack);

    let written = match transition {
        Transition::Open {
            started_at,
            triggered_by,
        } => db
            .insert_open_event(&ack.device_id, started_at, triggered_by)
            .await?,
        Transition::Close { ended_at } => db.close_open_event(&ack.device_id, ended_at).await?,
        Transition::Noop => false,
    };

    if written {
        Ok(transition)
    } else {
        debug!(
            device = %ack.device_id,
            pump_on = ack.pump_on,
            "ack did not change watering events"
        );
        Ok(Transition::Noop)
    }
}

/// Discards a controller's stored events and re-derives them from its
/// complete ack history.
pub async fn rebuild(db: &Db, device_id: &str) -> Result<Vec<Session>> {
    let history = db.ack_history(device_id).await?;
    let sessions = replay(&history);
    let rows: Vec<_> = sessions
        .iter()
        .map(|s| (s.started_at, s.ended_at, s.triggered_by))
        .collect();
    db.replace_events(device_id, &rows).await?;

    info!(
        device = %device_id,
        acks = history.len(),
        sessions = sessions.len(),
        "watering events rebuilt"
    );
    Ok(sessions)
}

// ---------------------------------------------------------------------------
// Background task
// ---------------------------------------------------------------------------

enum DeriverMsg {
    Ack(AckRecord),
    Rebuild {
        device_id: String,
        reply: oneshot::Sender<Result<Vec<Session>>>,
    },
}

#[derive(Clone)]
pub struct DeriverHandle {
    tx: mpsc::Sender<DeriverMsg>,
}

impl DeriverHandle {
    /// Queues an ack for derivation. The ack is already persisted, so a
    /// dropped submission can be recovered with [`DeriverHandle::rebuild`].
    pub async fn submit(&self, ack: AckRecord) {
        let device = ack.device_id.clone();
        if self.tx.send(DeriverMsg::Ack(ack)).await.is_err() {
            error!(device = %device, "deriver task is gone; ack not derived");
        }
    }

    /// Queues a full rebuild behind any acks already submitted and waits
    /// for it to finish.
    pub async fn rebuild(&self, device_id: &str) -> Result<Vec<Session>> {
        let (reply, rx) = oneshot::channel();
        let msg = DeriverMsg::Rebuild {
            device_id: device_id.to_string(),
            reply,
        };
        self.tx
            .send(msg)
            .await
            .map_err(|_| anyhow!("deriver task is gone"))?;
        rx.await.map_err(|_| anyhow!("deriver task dropped the rebuild"))?
    }
}

/// Spawns the derivation task. Intended to be called once from main.
pub fn spawn(db: Db, shared: SharedState) -> DeriverHandle {
    let (tx, mut rx) = mpsc::channel::<DeriverMsg>(QUEUE_DEPTH);

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let ack = match msg {
                DeriverMsg::Ack(ack) => ack,
                DeriverMsg::Rebuild { device_id, reply } => {
                    let res = rebuild(&db, &device_id).await;
                    if let Err(e) = &res {
                        error!(device = %device_id, "rebuild failed: {e:#}");
                    }
                    let _ = reply.send(res);
                    continue;
                }
            };
            match apply(&db, &ack).await {
                Ok(Transition::Open { triggered_by, .. }) => {
                    let mut st = shared.write().await;
                    st.record_watering(&ack.device_id, true, triggered_by);
                }
                Ok(Transition::Close { .. }) => {
                    let mut st = shared.write().await;
                    st.record_watering(&ack.device_id, false, ack.pump_mode);
                }
                Ok(Transition::Noop) => {}
                Err(e) => {
                    error!(device = %ack.device_id, "derivation failed: {e:#}");
                    let mut st = shared.write().await;
                    st.record_error(format!("derivation failed for {}: {e}", ack.device_id));
                }
            }
        }
    });

    DeriverHandle { tx }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DeviceDefaults;

    fn ack(id: i64, pump_on: bool, mode: PumpMode, at: i64) -> AckRecord {
        AckRecord {
            id,
            device_id: "d1".into(),
            pump_on,
            pump_mode: mode,
            note: "state changed".into(),
            reported_at: at,
        }
    }

    /// on/off pattern, one ack per second.
    fn stream(pattern: &[bool]) -> Vec<AckRecord> {
        pattern
            .iter()
            .enumerate()
            .map(|(i, &on)| ack(i as i64 + 1, on, PumpMode::Auto, (i as i64 + 1) * 1000))
            .collect()
    }

    async fn seeded_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.ensure_device(
            "d1",
            &DeviceDefaults {
                pump_mode: PumpMode::Auto,
                pump_on_below: 35.0,
                pump_off_above: 45.0,
                send_interval_sec: 60,
            },
        )
        .await
        .unwrap();
        db
    }

    fn open_count(sessions: &[Session]) -> usize {
        sessions.iter().filter(|s| s.ended_at.is_none()).count()
    }

    // -- step ------------------------------------------------------------

    #[test]
    fn step_table() {
        let on = ack(1, true, PumpMode::Manual, 10);
        let off = ack(2, false, PumpMode::Auto, 20);
        assert_eq!(
            step(false, &on),
            Transition::Open {
                started_at: 10,
                triggered_by: PumpMode::Manual
            }
        );
        assert_eq!(step(true, &on), Transition::Noop);
        assert_eq!(step(true, &off), Transition::Close { ended_at: 20 });
        assert_eq!(step(false, &off), Transition::Noop);
    }

    // -- replay ----------------------------------------------------------

    #[test]
    fn duplicate_on_reports_make_one_session() {
        let sessions = replay(&stream(&[true, true]));
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].ended_at, None);
    }

    #[test]
    fn off_without_open_session_is_ignored() {
        let sessions = replay(&stream(&[false, false, true, false, false]));
        assert_eq!(
            sessions,
            vec![Session {
                started_at: 3000,
                ended_at: Some(4000),
                triggered_by: PumpMode::Auto,
            }]
        );
    }

    #[test]
    fn triggered_by_comes_from_the_opening_ack() {
        let acks = vec![
            ack(1, true, PumpMode::Manual, 1000),
            ack(2, true, PumpMode::Auto, 2000),
            ack(3, false, PumpMode::Auto, 3000),
        ];
        let sessions = replay(&acks);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].triggered_by, PumpMode::Manual);
        assert_eq!(sessions[0].ended_at, Some(3000));
    }

    #[test]
    fn at_most_one_open_session_at_every_prefix() {
        let pattern = [
            true, true, false, true, false, false, true, true, true, false, true,
        ];
        let acks = stream(&pattern);
        for n in 0..=acks.len() {
            let sessions = replay(&acks[..n]);
            assert!(open_count(&sessions) <= 1, "prefix {n}: {sessions:?}");
        }
        // Sessions never overlap.
        let sessions = replay(&acks);
        for w in sessions.windows(2) {
            assert!(w[0].ended_at.is_some_and(|end| end <= w[1].started_at));
        }
    }

    #[test]
    fn replay_is_deterministic() {
        let acks = stream(&[true, false, true, true, false, true]);
        let first = replay(&acks);
        for _ in 0..5 {
            assert_eq!(replay(&acks), first);
        }
    }

    // -- apply / rebuild (storage-backed) ----------------------------------

    #[tokio::test]
    async fn incremental_apply_matches_replay() {
        let db = seeded_db().await;
        let pattern = [true, true, false, false, true, false, true];
        let mut acks = Vec::new();
        for (i, &on) in pattern.iter().enumerate() {
            let a = db
                .insert_ack("d1", on, PumpMode::Auto, "state changed", (i as i64 + 1) * 1000)
                .await
                .unwrap();
            apply(&db, &a).await.unwrap();
            acks.push(a);
        }

        let mut stored = db.list_events("d1", 100).await.unwrap();
        stored.reverse();
        let stored: Vec<Session> = stored
            .into_iter()
            .map(|e| Session {
                started_at: e.started_at,
                ended_at: e.ended_at,
                triggered_by: e.triggered_by,
            })
            .collect();

        assert_eq!(stored, replay(&acks));
        assert_eq!(open_count(&stored), 1);
    }

    #[tokio::test]
    async fn reapplying_the_same_ack_is_a_noop() {
        let db = seeded_db().await;
        let on = db
            .insert_ack("d1", true, PumpMode::Auto, "state changed", 1000)
            .await
            .unwrap();

        assert!(matches!(apply(&db, &on).await.unwrap(), Transition::Open { .. }));
        assert_eq!(apply(&db, &on).await.unwrap(), Transition::Noop);
        assert_eq!(db.list_events("d1", 10).await.unwrap().len(), 1);

        let off = db
            .insert_ack("d1", false, PumpMode::Auto, "state changed", 2000)
            .await
            .unwrap();
        assert_eq!(
            apply(&db, &off).await.unwrap(),
            Transition::Close { ended_at: 2000 }
        );
        assert_eq!(apply(&db, &off).await.unwrap(), Transition::Noop);
    }

    #[tokio::test]
    async fn rebuild_interleaved_with_live_acks_stays_consistent() {
        let db = seeded_db().await;
        let handle = spawn(db.clone(), crate::state::SystemState::shared());

        let mut at = 0;
        for round in 0..20 {
            at += 1000;
            let on = round % 2 == 0;
            let ack = db
                .insert_ack("d1", on, PumpMode::Auto, "state changed", at)
                .await
                .unwrap();
            // Rebuild races the submission of the ack it may or may not see.
            let (rebuilt, ()) = tokio::join!(handle.rebuild("d1"), handle.submit(ack));
            rebuilt.unwrap();
        }
        let sessions = handle.rebuild("d1").await.unwrap();

        let mut stored = db.list_events("d1", 100).await.unwrap();
        stored.reverse();
        let stored: Vec<Session> = stored
            .into_iter()
            .map(|e| Session {
                started_at: e.started_at,
                ended_at: e.ended_at,
                triggered_by: e.triggered_by,
            })
            .collect();
        let history = db.ack_history("d1").await.unwrap();
        assert_eq!(stored, replay(&history));
        assert_eq!(sessions, stored);
        // Last report was "off".
        assert_eq!(open_count(&stored), 0);
    }

    #[tokio::test]
    async fn drying_then_wetting_reports_make_one_auto_event() {
        let db = seeded_db().await;
        // Reports a controller sends for moisture 50, 40, 30, 20, 38, 50 with
        // a 35..45 band: settings applied at boot, on at 30, off at 50.
        let reports = [
            (false, "settings applied", 0),
            (true, "state changed", 20_000),
            (false, "state changed", 50_000),
        ];
        let mut acks = Vec::new();
        for (on, note, at) in reports {
            let a = db.insert_ack("d1", on, PumpMode::Auto, note, at).await.unwrap();
            apply(&db, &a).await.unwrap();
            acks.push(a);
        }

        let events = db.list_events("d1", 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].triggered_by, PumpMode::Auto);
        assert_eq!(events[0].started_at, 20_000);
        assert_eq!(events[0].ended_at, Some(50_000));
        assert_eq!(replay(&acks).len(), 1);
    }

    #[tokio::test]
    async fn rebuild_is_idempotent() {
        let db = seeded_db().await;
        for (i, on) in [true, false, true].into_iter().enumerate() {
            db.insert_ack("d1", on, PumpMode::Auto, "", (i as i64 + 1) * 1000)
                .await
                .unwrap();
        }

        let first = rebuild(&db, "d1").await.unwrap();
        let second = rebuild(&db, "d1").await.unwrap();
        assert_eq!(first, second);

        let stored = db.list_events("d1", 10).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored.iter().filter(|e| e.ended_at.is_none()).count(), 1);
    }
}
