mod actuator;
mod alerts;
mod climate;
mod config;
mod coordinator;
mod error;
mod growth;
mod irrigation;
mod metrics;
mod mqtt;
mod sensors;
mod state;
mod targets;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use actuator::{Actuator, ActuatorSink, MqttActuators, RelayBoard};
use config::Backend;
use coordinator::Coordinator;
use mqtt::{extract_device_id, telemetry_topic, StateMsg};
use sensors::SensorCache;
use state::EngineState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load_or_default(&config_path)?;
    let device_id = cfg.device_id.clone();

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("grow-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    let topic = telemetry_topic(&device_id);
    client.subscribe(&topic, QoS::AtLeastOnce).await?;
    info!(%topic, "hub subscribed");

    // ── Actuators ───────────────────────────────────────────────────
    let sink: Arc<dyn ActuatorSink> = match cfg.actuators.backend {
        Backend::Mqtt => Arc::new(MqttActuators::new(
            client.clone(),
            &device_id,
            &cfg.wired_actuators()?,
        )),
        Backend::Relay => {
            // Many common relay boards are active-low. If yours is active-high, set false.
            let active_low = env::var("RELAY_ACTIVE_LOW")
                .ok()
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true);
            let board = RelayBoard::new(&cfg.relay_wiring()?, active_low)?;
            board.all_off();
            Arc::new(board)
        }
    };

    // ── Engine ──────────────────────────────────────────────────────
    let cache = Arc::new(SensorCache::new(cfg.stale_timeout()));
    let shared = EngineState::shared(cfg.growth_config()?);
    shared
        .write()
        .await
        .record_system(format!("hub started for device '{device_id}'"));

    let coordinator = Arc::new(Coordinator::new(
        cache.clone(),
        sink.clone(),
        shared.clone(),
        cfg.engine_settings()?,
    ));

    // ── Web server ──────────────────────────────────────────────────
    let web_coordinator = Arc::clone(&coordinator);
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_coordinator).await {
            error!("web server stopped: {e:#}");
        }
    });

    tokio::spawn(Arc::clone(&coordinator).run_refresh_loop());

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if extract_device_id(&p.topic) != Some(device_id.as_str()) {
                    debug!(topic = %p.topic, "unhandled topic");
                    continue;
                }
                match serde_json::from_slice::<StateMsg>(&p.payload) {
                    Ok(msg) => {
                        debug!(ts = msg.ts, keys = msg.states.len(), "telemetry");
                        cache.replace(msg.into_states());
                    }
                    Err(e) => {
                        warn!(topic = %p.topic, "bad telemetry json: {e}");
                        shared
                            .write()
                            .await
                            .record_error(format!("bad telemetry json: {e}"));
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
                drop(st);
                coordinator.request_refresh();
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                // Best-effort fail-safe: the pump must not run unsupervised.
                if let Err(off) = sink.set(Actuator::Pump, false) {
                    warn!("pump off on comms error failed: {off}");
                }

                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
