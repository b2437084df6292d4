mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::{env, time::Duration};
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{parse_switch_payload, GrowRoomSim, Scenario};

#[derive(Debug, Serialize)]
struct StateMsg {
    ts: i64,
    states: BTreeMap<&'static str, Value>,
}

/// Extract the actuator name from "switch/<device_id>/<actuator>/set".
fn extract_actuator<'a>(topic: &'a str, device_id: &str) -> Option<&'a str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 4
        && parts[0] == "switch"
        && parts[1] == device_id
        && parts[3] == "set"
        && !parts[2].is_empty()
    {
        Some(parts[2])
    } else {
        None
    }
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
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let device_id = env::var("DEVICE_ID").unwrap_or_else(|_| "growbox".to_string());
    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(10);
    let day_length_s: f64 = env::var("SIM_DAY_LENGTH_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(600.0);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());

    let sim = Arc::new(Mutex::new(GrowRoomSim::new(scenario, day_length_s)));
    info!(%scenario, day_length_s, "simulating grow room");

    let mut mqttoptions = MqttOptions::new(format!("grow-node-{device_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    let switch_filter = format!("switch/{device_id}/+/set");
    client.subscribe(&switch_filter, QoS::AtLeastOnce).await?;

    // Feed switch commands back into the simulation.
    let feedback = Arc::clone(&sim);
    let listen_id = device_id.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("node connected to mqtt");
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    let Some(name) = extract_actuator(&p.topic, &listen_id) else {
                        debug!(topic = %p.topic, "unhandled topic");
                        continue;
                    };
                    match parse_switch_payload(&p.payload) {
                        Some(on) => {
                            let applied = match feedback.lock() {
                                Ok(mut sim) => sim.switches.apply(name, on),
                                Err(_) => false,
                            };
                            if applied {
                                info!(actuator = name, on, "switch applied");
                            } else {
                                warn!(actuator = name, "switch not simulated");
                            }
                        }
                        None => warn!(topic = %p.topic, "bad switch payload (use ON/OFF)"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let topic = format!("tele/{device_id}/state");
    info!(%topic, "publishing");

    loop {
        let states = match sim.lock() {
            Ok(mut sim) => {
                sim.step(sample_every_s as f64);
                sim.states()
            }
            Err(_) => anyhow::bail!("simulator state poisoned"),
        };

        let msg = StateMsg {
            ts: OffsetDateTime::now_utc().unix_timestamp(),
            states,
        };
        let payload = serde_json::to_vec(&msg)?;

        if let Err(e) = client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            warn!("publish error: {e}");
        } else {
            debug!(ts = msg.ts, "published state");
        }

        sleep(Duration::from_secs(sample_every_s)).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
