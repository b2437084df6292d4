//! TOML config file loading and validation: device identity, initial growth
//! configuration, light detection, actuator wiring, phase table overrides
//! and alert bands.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::actuator::Actuator;
use crate::alerts::AlertBands;
use crate::coordinator::{EngineSettings, SUBSTRATE_LITRES};
use crate::growth::{CropSteering, DayNight, GrowthPhase, Param, PhaseTable};
use crate::state::GrowthConfig;
use crate::targets::LightSchedule;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device_id: String,
    pub update_interval_sec: u64,
    pub stale_timeout_sec: u64,
    pub growth: GrowthSection,
    pub lights: LightsSection,
    pub actuators: ActuatorsSection,
    /// `[phases.<phase>.<param>]` day/night overrides of the built-in table.
    pub phases: BTreeMap<String, BTreeMap<String, DayNightEntry>>,
    pub alerts: AlertBands,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: "growbox".into(),
            update_interval_sec: 30,
            stale_timeout_sec: 300,
            growth: GrowthSection::default(),
            lights: LightsSection::default(),
            actuators: ActuatorsSection::default(),
            phases: BTreeMap::new(),
            alerts: AlertBands::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GrowthSection {
    pub phase: String,
    pub steering: String,
    pub substrate_size_l: f64,
}

impl Default for GrowthSection {
    fn default() -> Self {
        Self {
            phase: GrowthPhase::Vegetative.as_str().into(),
            steering: CropSteering::Balanced.as_str().into(),
            substrate_size_l: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LightsSection {
    pub light_key: String,
    pub schedule_start: Option<String>,
    pub schedule_end: Option<String>,
    pub utc_offset_minutes: i32,
}

impl Default for LightsSection {
    fn default() -> Self {
        Self {
            light_key: crate::sensors::keys::LED_PANEL.into(),
            schedule_start: None,
            schedule_end: None,
            utc_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Mqtt,
    Relay,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActuatorsSection {
    pub backend: Backend,
    /// Actuators the MQTT backend may command.
    pub wired: Vec<String>,
    /// BCM pin per actuator for the relay backend.
    pub relay_pins: BTreeMap<String, i64>,
}

impl Default for ActuatorsSection {
    fn default() -> Self {
        let wired = [
            Actuator::Pump,
            Actuator::FanIntake,
            Actuator::FanExhaust,
            Actuator::Humidifier,
            Actuator::Dehumidifier,
            Actuator::Co2Valve,
        ];
        Self {
            backend: Backend::Mqtt,
            wired: wired.iter().map(|a| a.as_str().to_string()).collect(),
            relay_pins: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DayNightEntry {
    pub day: Option<f64>,
    pub night: Option<f64>,
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_general(&mut errors);
        self.validate_growth(&mut errors);
        self.validate_lights(&mut errors);
        self.validate_actuators(&mut errors);
        self.validate_phases(&mut errors);
        self.validate_alerts(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_general(&self, errors: &mut Vec<String>) {
        if self.device_id.trim().is_empty() {
            errors.push("device_id is empty".into());
        } else if self.device_id.contains(['/', '+', '#']) {
            errors.push(format!(
                "device_id '{}' must not contain MQTT topic characters (/ + #)",
                self.device_id
            ));
        }
        if self.update_interval_sec == 0 {
            errors.push("update_interval_sec must be positive".into());
        }
        if self.stale_timeout_sec == 0 {
            errors.push("stale_timeout_sec must be positive".into());
        }
    }

    fn validate_growth(&self, errors: &mut Vec<String>) {
        if let Err(e) = self.growth.phase.parse::<GrowthPhase>() {
            errors.push(format!("growth: {e}"));
        }
        if let Err(e) = self.growth.steering.parse::<CropSteering>() {
            errors.push(format!("growth: {e}"));
        }
        if !SUBSTRATE_LITRES.contains(&self.growth.substrate_size_l) {
            errors.push(format!(
                "growth: substrate_size_l {} out of range [{}, {}]",
                self.growth.substrate_size_l,
                SUBSTRATE_LITRES.start(),
                SUBSTRATE_LITRES.end()
            ));
        }
    }

    fn validate_lights(&self, errors: &mut Vec<String>) {
        if self.lights.light_key.trim().is_empty() {
            errors.push("lights: light_key is empty".into());
        }
        match (&self.lights.schedule_start, &self.lights.schedule_end) {
            (Some(start), Some(end)) => {
                if let Err(e) = LightSchedule::parse(start, end, self.lights.utc_offset_minutes) {
                    errors.push(format!("lights: {e}"));
                }
            }
            (None, None) => {}
            _ => errors.push(
                "lights: schedule_start and schedule_end must be set together".into(),
            ),
        }
    }

    fn validate_actuators(&self, errors: &mut Vec<String>) {
        for name in &self.actuators.wired {
            if let Err(e) = name.parse::<Actuator>() {
                errors.push(format!("actuators.wired: {e}"));
            }
        }

        let mut seen_pins: HashSet<i64> = HashSet::new();
        for (name, pin) in &self.actuators.relay_pins {
            if let Err(e) = name.parse::<Actuator>() {
                errors.push(format!("actuators.relay_pins: {e}"));
            }
            if !VALID_GPIO_PINS.contains(pin) {
                errors.push(format!(
                    "actuators.relay_pins.{name}: {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen_pins.insert(*pin) {
                errors.push(format!(
                    "actuators.relay_pins.{name}: pin {pin} is already used by another actuator"
                ));
            }
        }

        if self.actuators.backend == Backend::Relay
            && !self.actuators.relay_pins.contains_key(Actuator::Pump.as_str())
        {
            errors.push("actuators: relay backend needs a pin for 'pump'".into());
        }
    }

    fn validate_phases(&self, errors: &mut Vec<String>) {
        for (phase, params) in &self.phases {
            if let Err(e) = phase.parse::<GrowthPhase>() {
                errors.push(format!("phases: {e}"));
            }
            for (param, entry) in params {
                let ctx = format!("phases.{phase}.{param}");
                if parse_param(param).is_none() {
                    errors.push(format!("{ctx}: unknown parameter"));
                }
                match (entry.day, entry.night) {
                    (Some(d), Some(n)) => {
                        if !d.is_finite() || !n.is_finite() {
                            errors.push(format!("{ctx}: values must be finite"));
                        }
                    }
                    (Some(_), None) => errors.push(format!("{ctx}: day set without night")),
                    (None, Some(_)) => errors.push(format!("{ctx}: night set without day")),
                    (None, None) => errors.push(format!("{ctx}: neither day nor night set")),
                }
            }
        }
    }

    fn validate_alerts(&self, errors: &mut Vec<String>) {
        for (metric, band) in self.alerts.iter() {
            if band.critical_low >= band.critical_high {
                errors.push(format!(
                    "alerts.{metric}: critical_low ({}) must be below critical_high ({})",
                    band.critical_low, band.critical_high
                ));
            }
            if band.warn_tolerance < 0.0 {
                errors.push(format!(
                    "alerts.{metric}: warn_tolerance must not be negative, got {}",
                    band.warn_tolerance
                ));
            }
        }
    }
}

fn parse_param(name: &str) -> Option<Param> {
    Param::ALL.into_iter().find(|p| p.as_str() == name)
}

// ---------------------------------------------------------------------------
// Derived engine inputs (call after `validate`)
// ---------------------------------------------------------------------------

impl Config {
    pub fn growth_config(&self) -> Result<GrowthConfig> {
        Ok(GrowthConfig {
            phase: self.growth.phase.parse()?,
            steering: self.growth.steering.parse()?,
            substrate_size_l: self.growth.substrate_size_l,
        })
    }

    pub fn phase_table(&self) -> Result<PhaseTable> {
        let mut table = PhaseTable::default();
        for (phase, params) in &self.phases {
            let phase: GrowthPhase = phase.parse()?;
            for (name, entry) in params {
                let param = parse_param(name)
                    .with_context(|| format!("unknown phase parameter '{name}'"))?;
                let (Some(day), Some(night)) = (entry.day, entry.night) else {
                    bail!("phases.{phase}.{name}: day and night must both be set");
                };
                table.params_mut(phase).set(param, DayNight::new(day, night));
            }
        }
        Ok(table)
    }

    pub fn light_schedule(&self) -> Result<Option<LightSchedule>> {
        match (&self.lights.schedule_start, &self.lights.schedule_end) {
            (Some(start), Some(end)) => Ok(Some(LightSchedule::parse(
                start,
                end,
                self.lights.utc_offset_minutes,
            )?)),
            _ => Ok(None),
        }
    }

    pub fn engine_settings(&self) -> Result<EngineSettings> {
        Ok(EngineSettings {
            phases: self.phase_table()?,
            alerts: self.alerts.clone(),
            light_key: self.lights.light_key.clone(),
            schedule: self.light_schedule()?,
            update_interval: Duration::from_secs(self.update_interval_sec),
        })
    }

    pub fn wired_actuators(&self) -> Result<Vec<Actuator>> {
        self.actuators
            .wired
            .iter()
            .map(|name| -> Result<Actuator> { Ok(name.parse()?) })
            .collect()
    }

    pub fn relay_wiring(&self) -> Result<Vec<(Actuator, u8)>> {
        self.actuators
            .relay_pins
            .iter()
            .map(|(name, pin)| -> Result<(Actuator, u8)> {
                let pin = u8::try_from(*pin).with_context(|| format!("bad pin {pin}"))?;
                Ok((name.parse::<Actuator>()?, pin))
            })
            .collect()
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_sec)
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Like [`load`], but a missing file means built-in defaults.
pub fn load_or_default(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        tracing::warn!(path, "config file not found, using defaults");
        return Ok(Config::default());
    }
    load(path)
}

// ===========================================================================
// Tests
// ===========================================================================
