mod relay;
mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::Value;
use std::{env, time::Duration};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use relay::RelayBoard;
use sim::{RigSim, Scenario};

const PLANTS: usize = 4;

/// What the broker told us, forwarded from the event loop task.
#[derive(Debug, PartialEq)]
enum Incoming {
    Motor { index: usize, on: bool },
    LinkDown,
}

/// Extract the 0-based motor index from "<prefix>/motor_<n>", n in 1..=4.
fn motor_index(prefix: &str, topic: &str) -> Option<usize> {
    let n: usize = topic
        .strip_prefix(prefix)?
        .strip_prefix("/motor_")?
        .parse()
        .ok()?;
    (1..=PLANTS).contains(&n).then(|| n - 1)
}

/// Parse a motor payload: JSON `true`/`false`, `1`/`0`, or bare ON/OFF.
fn parse_motor_payload(payload: &[u8]) -> Result<bool, String> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Bool(on)) => return Ok(on),
        Ok(Value::Number(n)) if n.as_u64() == Some(1) => return Ok(true),
        Ok(Value::Number(n)) if n.as_u64() == Some(0) => return Ok(false),
        _ => {}
    }
    let s = String::from_utf8_lossy(payload)
        .trim()
        .trim_matches('"')
        .to_uppercase();
    match s.as_str() {
        "ON" => Ok(true),
        "OFF" => Ok(false),
        _ => Err(format!("unknown motor command '{s}'")),
    }
}

/// Retained field updates for one sampling tick.
fn readings(sim: &mut RigSim) -> Vec<(String, f64)> {
    let mut out = vec![
        ("Temp".to_string(), sim.temperature()),
        ("Humidity".to_string(), sim.humidity()),
    ];
    for i in 0..sim.plant_count() {
        out.push((format!("Plant_{}", i + 1), sim.sample(i)));
    }
    out
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_parse("MQTT_PORT", 1883);
    let prefix = env::var("STORE_PREFIX")
        .unwrap_or_else(|_| "irrigation".to_string())
        .trim_end_matches('/')
        .to_string();
    let sample_every_s: u64 = env_parse("SAMPLE_EVERY_S", 5);
    let heartbeat_every_s: u64 = env_parse("HEARTBEAT_EVERY_S", 5);
    let diurnal_period_s: f64 = env_parse("DIURNAL_PERIOD_S", 600.0);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());

    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);
    let pins = match env::var("RELAY_PINS") {
        Ok(s) => relay::parse_pins(&s)?,
        Err(_) => relay::DEFAULT_PINS.to_vec(),
    };

    let mut relays = RelayBoard::new(&pins, active_low)?;
    relays.all_off();
    let mut sim = RigSim::new(scenario, PLANTS, diurnal_period_s);
    info!(%scenario, plants = PLANTS, "simulator ready");

    let mut mqttoptions = MqttOptions::new("irrigation-device", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 32);

    let (tx, mut rx) = mpsc::channel::<Incoming>(32);
    let filter = format!("{prefix}/motor_+");
    let sub_client = client.clone();
    let topic_prefix = prefix.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("device connected to mqtt");
                    if let Err(e) = sub_client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                        error!("subscribe to {filter} failed: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    let Some(index) = motor_index(&topic_prefix, &p.topic) else {
                        continue;
                    };
                    match parse_motor_payload(&p.payload) {
                        Ok(on) => {
                            if tx.send(Incoming::Motor { index, on }).await.is_err() {
                                break;
                            }
                        }
                        Err(msg) => warn!(topic = %p.topic, "{msg}"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    if tx.send(Incoming::LinkDown).await.is_err() {
                        break;
                    }
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let mut sample = interval(Duration::from_secs(sample_every_s.max(1)));
    let mut heartbeat = interval(Duration::from_secs(heartbeat_every_s.max(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = sample.tick() => {
                for (key, value) in readings(&mut sim) {
                    publish(&client, &prefix, &key, Value::from(value)).await;
                }
            }
            _ = heartbeat.tick() => {
                publish(&client, &prefix, "isConnected", Value::Bool(true)).await;
            }
            Some(msg) = rx.recv() => match msg {
                Incoming::Motor { index, on } => {
                    relays.set(index, on);
                    sim.set_watering(index, on);
                }
                Incoming::LinkDown => {
                    // Best-effort fail-safe: turn everything off on comms error
                    relays.all_off();
                    sim.stop_all_watering();
                }
            },
            _ = &mut ctrl_c => {
                info!("shutting down");
                relays.all_off();
                break;
            }
        }
    }
    Ok(())
}

async fn publish(client: &AsyncClient, prefix: &str, key: &str, value: Value) {
    let topic = format!("{prefix}/{key}");
    if let Err(e) = client
        .publish(topic.as_str(), QoS::AtLeastOnce, true, value.to_string())
        .await
    {
        warn!(%topic, "publish error: {e}");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
