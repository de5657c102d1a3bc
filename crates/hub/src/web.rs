use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use std::convert::Infallible;
use std::env;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::credentials::{AuthConfig, CredentialManager};
use crate::db::{now_ms, Db, DesiredState, DeviceDefaults, NewReading, PumpMode};
use crate::deriver::{self, DeriverHandle};
use crate::error::HubError;
use crate::liveness::{self, LivenessPolicy};
use crate::state::SharedState;
use crate::store::{validate_device_id, DesiredStateStore, SettingsPatch};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const ENROLL_SECRET_HEADER: &str = "x-enroll-secret";

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;
const MAX_NOTE_LEN: usize = 200;

// ---------------------------------------------------------------------------
// Application state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub store: DesiredStateStore,
    pub credentials: CredentialManager,
    pub deriver: DeriverHandle,
    pub liveness: LivenessPolicy,
    pub shared: SharedState,
}

impl AppState {
    /// Wires the components together and starts the derivation task.
    pub fn new(
        db: Db,
        defaults: DeviceDefaults,
        auth: AuthConfig,
        liveness: LivenessPolicy,
        shared: SharedState,
    ) -> Self {
        let store = DesiredStateStore::new(db.clone(), defaults);
        let credentials = CredentialManager::new(store.clone(), auth);
        if !credentials.enrollment_required() {
            warn!("no enrollment secret configured; any caller may provision an api key");
        }
        let deriver = deriver::spawn(db, shared.clone());
        Self {
            store,
            credentials,
            deriver,
            liveness,
            shared,
        }
    }

    fn db(&self) -> &Db {
        self.store.db()
    }
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckBody {
    pump_on: bool,
    pump_mode: PumpMode,
    #[serde(default)]
    note: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadingBody {
    device_id: String,
    moisture: f64,
    #[serde(default)]
    payload: ReadingPayload,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadingPayload {
    raw: Option<i64>,
    pump_on: Option<bool>,
    note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

impl LimitQuery {
    fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        // controller-facing
        .route("/api/devices/{id}/rotate-key", post(rotate_key))
        .route("/api/devices/{id}/settings", get(device_settings))
        .route("/api/devices/{id}/ack", post(post_ack))
        .route("/api/devices/{id}/stream", get(device_stream))
        .route("/api/readings", post(post_reading))
        // operator-facing
        .route("/api/devices", get(list_devices))
        .route("/api/devices/{id}/desired", get(get_desired).patch(patch_desired))
        .route("/api/devices/{id}/liveness", get(get_liveness))
        .route("/api/devices/{id}/events", get(list_events))
        .route("/api/devices/{id}/events/rebuild", post(rebuild_events))
        .route("/api/devices/{id}/acks", get(list_acks))
        .route("/api/policy/apply", post(apply_policy))
        .with_state(state)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Credential gate for every controller write and the settings read.
async fn authorize(app: &AppState, device_id: &str, headers: &HeaderMap) -> Result<(), HubError> {
    validate_device_id(device_id)?;
    let res = app
        .credentials
        .require(device_id, header(headers, API_KEY_HEADER))
        .await;
    if let Err(HubError::Unauthorized) = &res {
        let mut st = app.shared.write().await;
        st.record_auth(format!("{device_id}: rejected api key"));
    }
    res
}

/// Operator reads of history should not register unknown ids.
async fn known_device(app: &AppState, device_id: &str) -> Result<DesiredState, HubError> {
    validate_device_id(device_id)?;
    app.db()
        .get_device(device_id)
        .await?
        .ok_or_else(|| HubError::NotFound(format!("device '{device_id}'")))
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let st = app.shared.read().await;
    Json(st.to_status())
}

// -- controller-facing ------------------------------------------------------

async fn rotate_key(
    State(app): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, HubError> {
    let key = app
        .credentials
        .issue(&id, header(&headers, ENROLL_SECRET_HEADER))
        .await;

    let mut st = app.shared.write().await;
    match &key {
        Ok(_) => st.record_auth(format!("{id}: api key issued")),
        Err(HubError::Forbidden) => st.record_auth(format!("{id}: enrollment rejected")),
        Err(_) => {}
    }
    drop(st);

    let key = key?;
    Ok(Json(serde_json::json!({ "deviceId": id, "apiKey": key })))
}

async fn device_settings(
    State(app): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DesiredState>, HubError> {
    authorize(&app, &id, &headers).await?;
    Ok(Json(app.store.get(&id).await?))
}

fn settings_event(version: Option<i64>) -> Event {
    let data = match version {
        Some(v) => format!("{{\"version\":{v}}}"),
        None => "{}".to_string(),
    };
    Event::default().event("settings").data(data)
}

/// Server-sent `settings` events whenever this controller's desired state
/// gets a new version. Carries no settings itself; the controller re-fetches.
async fn device_stream(
    State(app): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, HubError> {
    authorize(&app, &id, &headers).await?;
    let rx = app.store.subscribe();
    info!(device = %id, "push stream opened");

    let events = stream::unfold((rx, id), |(mut rx, id)| async move {
        loop {
            match rx.recv().await {
                Ok(change) if change.device_id == id => {
                    return Some((Ok(settings_event(Some(change.version))), (rx, id)));
                }
                Ok(_) => {}
                // Missed changes collapse into one nudge.
                Err(RecvError::Lagged(_)) => return Some((Ok(settings_event(None)), (rx, id))),
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn post_ack(
    State(app): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<AckBody>,
) -> Result<impl IntoResponse, HubError> {
    authorize(&app, &id, &headers).await?;

    let note: String = body.note.chars().take(MAX_NOTE_LEN).collect();
    let ack = app
        .db()
        .insert_ack(&id, body.pump_on, body.pump_mode, &note, now_ms())
        .await?;

    info!(
        device = %id,
        pump_on = ack.pump_on,
        mode = %ack.pump_mode,
        note = %ack.note,
        "ack received"
    );
    {
        let mut st = app.shared.write().await;
        st.record_ack(&id, ack.pump_on, ack.pump_mode, &ack.note);
    }

    app.deriver.submit(ack.clone()).await;
    Ok((StatusCode::CREATED, Json(ack)))
}

async fn post_reading(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ReadingBody>,
) -> Result<impl IntoResponse, HubError> {
    authorize(&app, &body.device_id, &headers).await?;

    if !(0.0..=100.0).contains(&body.moisture) {
        return Err(HubError::InvalidRequest(format!(
            "moisture {} out of range [0, 100]",
            body.moisture
        )));
    }

    let note = body
        .payload
        .note
        .as_deref()
        .map(|n| n.chars().take(MAX_NOTE_LEN).collect::<String>());
    app.db()
        .insert_reading(&NewReading {
            device_id: &body.device_id,
            ts: now_ms(),
            moisture: body.moisture,
            raw: body.payload.raw,
            pump_on: body.payload.pump_on,
            note: note.as_deref(),
        })
        .await?;

    {
        let mut st = app.shared.write().await;
        st.record_reading(&body.device_id, body.moisture);
    }
    Ok(StatusCode::CREATED)
}

// -- operator-facing --------------------------------------------------------

async fn list_devices(State(app): State<AppState>) -> Result<Json<Vec<DesiredState>>, HubError> {
    Ok(Json(app.store.list().await?))
}

async fn get_desired(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DesiredState>, HubError> {
    Ok(Json(app.store.get(&id).await?))
}

async fn patch_desired(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<DesiredState>, HubError> {
    if patch.is_empty() {
        return Err(HubError::InvalidRequest("patch names no known field".into()));
    }
    let updated = app.store.patch(&id, &patch).await?;

    let mut st = app.shared.write().await;
    st.record_settings(format!(
        "{id}: desired state v{} mode={} override={} band={}..{}",
        updated.version,
        updated.pump_mode,
        updated.override_pump_on,
        updated.pump_on_below,
        updated.pump_off_above
    ));
    Ok(Json(updated))
}

async fn apply_policy(
    State(app): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> Result<impl IntoResponse, HubError> {
    if patch.is_empty() {
        return Err(HubError::InvalidRequest("patch names no known field".into()));
    }
    let outcome = app.store.apply_policy(&patch).await?;

    let mut st = app.shared.write().await;
    st.record_settings(format!(
        "policy applied: {} updated, {} unchanged, {} rejected",
        outcome.updated,
        outcome.unchanged,
        outcome.rejected.len()
    ));
    Ok(Json(outcome))
}

async fn get_liveness(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, HubError> {
    let desired = known_device(&app, &id).await?;
    let last_seen = liveness::last_contact(
        app.db().latest_ack_ts(&id).await?,
        app.db().latest_reading_ts(&id).await?,
    );
    Ok(Json(liveness::evaluate(
        &id,
        last_seen,
        desired.send_interval_sec,
        &app.liveness,
        now_ms(),
    )))
}

async fn list_events(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> Result<impl IntoResponse, HubError> {
    known_device(&app, &id).await?;
    Ok(Json(app.db().list_events(&id, q.limit()).await?))
}

async fn rebuild_events(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, HubError> {
    known_device(&app, &id).await?;
    app.deriver.rebuild(&id).await?;
    Ok(Json(app.db().list_events(&id, MAX_LIST_LIMIT).await?))
}

async fn list_acks(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> Result<impl IntoResponse, HubError> {
    known_device(&app, &id).await?;
    Ok(Json(app.db().recent_acks(&id, q.limit()).await?))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!("hub api listening on http://{addr}");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
