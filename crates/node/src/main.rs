mod client;
mod control;
mod push;
mod relay;
mod reporter;
mod session;
mod settings;
mod sim;

use anyhow::Result;
use std::str::FromStr;
use std::sync::Arc;
use std::{env, path::PathBuf, time::Duration};
use tokio::sync::{watch, Notify};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use client::{AckReport, ClientError, HubClient, ReadingPayload, ReadingReport};
use control::Controller;
use relay::Relay;
use reporter::{Outbound, Reporter};
use session::Session;
use settings::{PumpMode, Settings};
use sim::{MoistureSim, Scenario};

const NOTE_STATE_CHANGED: &str = "state changed";
const NOTE_SETTINGS_APPLIED: &str = "settings applied";

#[derive(Debug, Clone, PartialEq)]
struct NodeConfig {
    hub_url: String,
    device_id: String,
    enroll_secret: Option<String>,
    state_path: PathBuf,
    control_period: Duration,
    min_on: Duration,
    default_send_interval_s: u64,
    http_timeout: Duration,
    scenario: Scenario,
    relay_gpio: u8,
    relay_active_low: bool,
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn parse_flag(value: Option<String>, default: bool) -> bool {
    value
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

impl NodeConfig {
    fn from_env() -> Self {
        let var = |key: &str| env::var(key).ok();
        Self {
            hub_url: var("HUB_URL").unwrap_or_else(|| "http://127.0.0.1:8080".to_string()),
            device_id: var("DEVICE_ID").unwrap_or_else(|| "esp32-001".to_string()),
            enroll_secret: var("ENROLL_SECRET").filter(|s| !s.is_empty()),
            state_path: var("STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("pump-node-state.json")),
            control_period: Duration::from_millis(parse_or(var("CONTROL_PERIOD_MS"), 1000).max(50)),
            min_on: Duration::from_secs(parse_or(var("MIN_ON_SEC"), 30)),
            default_send_interval_s: parse_or(var("DEFAULT_SEND_INTERVAL_S"), 60),
            http_timeout: Duration::from_secs(parse_or(var("HTTP_TIMEOUT_S"), 10).max(1)),
            scenario: Scenario::from_str_lossy(&var("SIM_SCENARIO").unwrap_or_default()),
            // Many common relay boards are active-low. If yours is active-high, set false.
            relay_gpio: parse_or(var("RELAY_GPIO"), 17),
            relay_active_low: parse_flag(var("RELAY_ACTIVE_LOW"), true),
        }
    }
}

fn ack(pump_on: bool, pump_mode: PumpMode, note: &'static str) -> Outbound {
    Outbound::Ack(AckReport {
        pump_on,
        pump_mode,
        note,
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = NodeConfig::from_env();
    info!(
        device = %cfg.device_id,
        hub = %cfg.hub_url,
        scenario = %cfg.scenario,
        "pump node starting"
    );

    // Fail-safe: relay off before anything touches the network.
    let mut relay = Relay::new(cfg.relay_gpio, cfg.relay_active_low)?;
    relay.set(false);

    let client = HubClient::new(&cfg.hub_url, &cfg.device_id, cfg.http_timeout)?;
    let session = Session::start(client, cfg.state_path.clone(), cfg.enroll_secret.clone()).await;

    let (settings_tx, settings_rx) =
        watch::channel(Settings::with_defaults(cfg.default_send_interval_s));
    let wake = Arc::new(Notify::new());
    tokio::spawn(poll_settings(Arc::clone(&session), settings_tx, Arc::clone(&wake)));
    tokio::spawn(push::listen(Arc::clone(&session), wake));

    let (reporter, outbound) = reporter::channel(reporter::QUEUE_DEPTH);
    tokio::spawn(reporter::drain(outbound, Arc::clone(&session)));

    run_control_loop(&cfg, relay, settings_rx, reporter).await;
    Ok(())
}

/// Fetches settings every `sendIntervalSec`, or right away when the push
/// stream signals a change, and publishes effective changes.
async fn poll_settings(session: Arc<Session>, tx: watch::Sender<Settings>, wake: Arc<Notify>) {
    loop {
        let key = session.api_key().await;
        match session.client().fetch_settings(&key).await {
            Ok(body) => {
                let changed = tx.send_if_modified(|cached| cached.merge(&body));
                if changed {
                    let s = tx.borrow();
                    info!(
                        mode = %s.pump_mode,
                        override_on = s.override_pump_on,
                        on_below = s.pump_on_below,
                        off_above = s.pump_off_above,
                        send_interval_sec = s.send_interval_sec,
                        "settings updated"
                    );
                }
            }
            Err(ClientError::Unauthorized) => {
                warn!("settings fetch rejected; re-provisioning");
                if let Err(e) = session.reprovision(&key).await {
                    warn!("re-provisioning failed: {e}");
                }
            }
            Err(e) => warn!("settings fetch failed: {e}; keeping last known settings"),
        }

        let wait = tx.borrow().send_interval_sec;
        tokio::select! {
            _ = sleep(Duration::from_secs(wait)) => {}
            _ = wake.notified() => {}
        }
    }
}

/// Never awaits the network: settings come from the watch channel and
/// reports leave through the queue.
async fn run_control_loop(
    cfg: &NodeConfig,
    mut relay: Relay,
    mut settings_rx: watch::Receiver<Settings>,
    reporter: Reporter,
) {
    let mut sim = MoistureSim::new(cfg.scenario);
    let mut controller = Controller::new(cfg.min_on, Instant::now().into_std());
    let mut ticker = interval(cfg.control_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut next_reading = Instant::now();

    loop {
        ticker.tick().await;
        let now = Instant::now();

        let settings_changed = settings_rx.has_changed().unwrap_or(false);
        let settings = settings_rx.borrow_and_update().clone();

        let reading = sim.sample();
        if let Some(on) = controller.step(&settings, Some(reading.moisture), now.into_std()) {
            relay.set(on);
            sim.set_watering(on);
            info!(
                pump_on = on,
                mode = %settings.pump_mode,
                moisture = reading.moisture,
                "pump state changed"
            );
            reporter.report(ack(on, settings.pump_mode, NOTE_STATE_CHANGED));
        }

        if settings_changed {
            reporter.report(ack(relay.is_on(), settings.pump_mode, NOTE_SETTINGS_APPLIED));
        }

        if now >= next_reading {
            reporter.report(Outbound::Reading(ReadingReport {
                device_id: cfg.device_id.clone(),
                moisture: reading.moisture,
                payload: ReadingPayload {
                    raw: reading.raw,
                    pump_on: relay.is_on(),
                    note: format!("sim {}", sim.scenario()),
                },
            }));
            next_reading = now + Duration::from_secs(settings.send_interval_sec);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
