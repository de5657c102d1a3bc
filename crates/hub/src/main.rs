mod config;
mod credentials;
mod db;
mod deriver;
mod error;
mod liveness;
mod state;
mod store;
mod web;

use anyhow::Result;
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

use db::Db;
use state::SystemState;
use store::DesiredStateStore;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:pump-hub.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let env_secret = env::var("ENROLL_SECRET").ok();

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (policy + pre-seeded devices) ─────────────────────
    let cfg = config::load_or_default(&config_path)?;
    let seed_store = DesiredStateStore::new(db.clone(), cfg.device_defaults());
    config::apply(&cfg, &seed_store).await?;

    let devices = seed_store.list().await?;
    info!(devices = devices.len(), "db ready");

    // ── Shared state (ephemeral, for /api/status) ─────────────────────
    let shared = SystemState::shared();
    {
        let mut st = shared.write().await;
        st.record_system(format!("hub started with {} device(s)", devices.len()));
    }

    // ── Web server ──────────────────────────────────────────────────
    let app = AppState::new(
        db,
        cfg.device_defaults(),
        cfg.auth_config(env_secret),
        cfg.liveness_policy(),
        shared,
    );
    web::serve(app).await
}
