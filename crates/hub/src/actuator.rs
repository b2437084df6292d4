//! Actuator sink: on/off commands addressed by logical actuator. Commands go
//! out over MQTT by default; the `gpio` feature adds a directly wired relay
//! board. Without it, a mock relay board logs state changes instead.

use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

use crate::error::EngineError;
use crate::mqtt::switch_topic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actuator {
    Pump,
    FanIntake,
    FanExhaust,
    FanCirculation,
    Humidifier,
    Dehumidifier,
    Co2Valve,
    GrowLight,
}

impl Actuator {
    pub const ALL: [Actuator; 8] = [
        Self::Pump,
        Self::FanIntake,
        Self::FanExhaust,
        Self::FanCirculation,
        Self::Humidifier,
        Self::Dehumidifier,
        Self::Co2Valve,
        Self::GrowLight,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pump => "pump",
            Self::FanIntake => "fan_intake",
            Self::FanExhaust => "fan_exhaust",
            Self::FanCirculation => "fan_circulation",
            Self::Humidifier => "humidifier",
            Self::Dehumidifier => "dehumidifier",
            Self::Co2Valve => "co2_valve",
            Self::GrowLight => "grow_light",
        }
    }
}

impl fmt::Display for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Actuator {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == wanted)
            .ok_or_else(|| EngineError::invalid("actuator", s))
    }
}

#[derive(Debug, Clone, Error)]
pub enum ActuatorError {
    #[error("{0} is not wired")]
    NotWired(Actuator),
    #[error("{actuator}: {reason}")]
    CommandFailed { actuator: Actuator, reason: String },
}

/// Accepts on/off commands. Implementations must not block for long: the
/// irrigation cleanup guard calls `set` from `Drop`.
pub trait ActuatorSink: Send + Sync {
    fn set(&self, actuator: Actuator, on: bool) -> Result<(), ActuatorError>;
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

// ---------------------------------------------------------------------------
// MQTT command publisher
// ---------------------------------------------------------------------------

pub struct MqttActuators {
    client: AsyncClient,
    device_id: String,
    wired: HashSet<Actuator>,
}

impl MqttActuators {
    pub fn new(client: AsyncClient, device_id: &str, wired: &[Actuator]) -> Self {
        Self {
            client,
            device_id: device_id.to_string(),
            wired: wired.iter().copied().collect(),
        }
    }
}

impl ActuatorSink for MqttActuators {
    fn set(&self, actuator: Actuator, on: bool) -> Result<(), ActuatorError> {
        if !self.wired.contains(&actuator) {
            return Err(ActuatorError::NotWired(actuator));
        }
        self.client
            .try_publish(
                switch_topic(&self.device_id, actuator),
                QoS::AtLeastOnce,
                false,
                on_off(on).as_bytes().to_vec(),
            )
            .map_err(|e| ActuatorError::CommandFailed {
                actuator,
                reason: e.to_string(),
            })?;
        debug!(%actuator, state = on_off(on), "mqtt switch command queued");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct RelayBoard {
    pins: Mutex<HashMap<Actuator, OutputPin>>,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl RelayBoard {
    pub fn new(wiring: &[(Actuator, u8)], active_low: bool) -> anyhow::Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();

        for (actuator, pin_num) in wiring {
            let mut pin = gpio.get(*pin_num)?.into_output();
            // Everything starts OFF.
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }
            pins.insert(*actuator, pin);
        }

        Ok(Self {
            pins: Mutex::new(pins),
            active_low,
        })
    }

    pub fn all_off(&self) {
        let keys: Vec<Actuator> = {
            let pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
            pins.keys().copied().collect()
        };
        for k in keys {
            let _ = self.set(k, false);
        }
    }
}

#[cfg(feature = "gpio")]
impl ActuatorSink for RelayBoard {
    fn set(&self, actuator: Actuator, on: bool) -> Result<(), ActuatorError> {
        let mut pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        let pin = pins
            .get_mut(&actuator)
            .ok_or(ActuatorError::NotWired(actuator))?;
        // active-low: LOW = ON, HIGH = OFF
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        info!(%actuator, state = on_off(on), "relay set");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct RelayBoard {
    relays: Mutex<HashMap<Actuator, bool>>,
}

#[cfg(not(feature = "gpio"))]
impl RelayBoard {
    pub fn new(wiring: &[(Actuator, u8)], _active_low: bool) -> anyhow::Result<Self> {
        let mut relays = HashMap::new();
        for (actuator, pin_num) in wiring {
            info!(%actuator, gpio = pin_num, "[mock-gpio] relay registered (not wired)");
            relays.insert(*actuator, false);
        }
        Ok(Self {
            relays: Mutex::new(relays),
        })
    }

    pub fn state(&self, actuator: Actuator) -> Option<bool> {
        let relays = self.relays.lock().unwrap_or_else(|e| e.into_inner());
        relays.get(&actuator).copied()
    }

    pub fn all_off(&self) {
        let mut relays = self.relays.lock().unwrap_or_else(|e| e.into_inner());
        for on in relays.values_mut() {
            *on = false;
        }
    }
}

#[cfg(not(feature = "gpio"))]
impl ActuatorSink for RelayBoard {
    fn set(&self, actuator: Actuator, on: bool) -> Result<(), ActuatorError> {
        let mut relays = self.relays.lock().unwrap_or_else(|e| e.into_inner());
        let state = relays
            .get_mut(&actuator)
            .ok_or(ActuatorError::NotWired(actuator))?;
        *state = on;
        info!(%actuator, state = on_off(on), "[mock-gpio] relay set");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recording sink for tests
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================
