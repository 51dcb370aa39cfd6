mod actuator;
mod config;
mod control;
mod controller;
mod handshake;
mod mode;
mod notify;
mod scheduler;
mod snapshot;
mod state;
mod store;
mod web;
mod writer;

use anyhow::{bail, Result};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use controller::CommandSender;
use scheduler::TimerState;
use state::SystemState;
use store::{MemoryStore, MqttSettings, MqttStore};
use web::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Mqtt,
    Memory,
}

impl Backend {
    fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mqtt" => Ok(Backend::Mqtt),
            "memory" => Ok(Backend::Memory),
            other => bail!("unknown STORE_BACKEND '{other}' (use mqtt or memory)"),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Backend::Mqtt => "mqtt",
            Backend::Memory => "memory",
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_parse("MQTT_PORT", 1883);
    let prefix = env::var("STORE_PREFIX").unwrap_or_else(|_| "irrigation".to_string());
    let backend = Backend::parse(&env::var("STORE_BACKEND").unwrap_or_else(|_| "mqtt".into()))?;
    let web_port: u16 = env_parse("WEB_PORT", 8080);

    // ── Config file (tuning) ─────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load_or_default(&config_path)?;

    // ── Shared state (ephemeral, for the web API) ───────────────────
    let shared = Arc::new(RwLock::new(SystemState::new(
        backend.name(),
        cfg.thresholds(),
        TimerState::new(cfg.timer.default_hours),
    )));
    shared
        .write()
        .await
        .record_system(format!("controller starting ({} backend)", backend.name()));

    let (stop_tx, stop_rx) = watch::channel(false);
    let (commands, command_rx) = CommandSender::channel(32);

    // ── Web server ──────────────────────────────────────────────────
    let web_state = AppState {
        shared: Arc::clone(&shared),
        commands,
    };
    let web = tokio::spawn(web::serve(web_state, web_port, stop_rx.clone()));

    // ── Shutdown ────────────────────────────────────────────────────
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested");
        let _ = stop_tx.send(true);
    });

    // ── Controller ──────────────────────────────────────────────────
    match backend {
        Backend::Mqtt => {
            let settings = MqttSettings {
                host: broker,
                port,
                client_id: cfg.store.client_id.clone(),
                prefix,
                keep_alive: cfg.keep_alive(),
            };
            let (store, driver) = MqttStore::connect(&settings);
            controller::run(store.clone(), &cfg, shared, command_rx, stop_rx).await;

            if let Err(e) = store.disconnect().await {
                warn!("{e:#}");
            }
            if tokio::time::timeout(Duration::from_secs(2), driver).await.is_err() {
                warn!("state store did not close in time");
            }
        }
        Backend::Memory => {
            warn!("using the in-memory store; nothing reaches the rig");
            controller::run(MemoryStore::new(), &cfg, shared, command_rx, stop_rx).await;
        }
    }

    match web.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("{e:#}"),
        Err(e) => error!("web task failed: {e}"),
    }
    info!("bye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
