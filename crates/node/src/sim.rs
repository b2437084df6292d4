//! Stateful grow-room simulator for local development.
//!
//! Models a tent with an outside reference climate:
//! - Inside temperature and humidity drift toward a lights-dependent setpoint
//! - Outside climate follows a slow diurnal swing
//! - Substrate VWC dries back continuously and rises while the pump runs
//! - Actuator states fed back from switch commands move the inside climate
//! - Per-reading sensor noise

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Room near a comfortable setpoint, mild outside air.
    Balanced,
    /// Hot, dry room with cooler, moister outside air. Drives the hub toward
    /// intake and humidification.
    HotDry,
    /// Humid room with dry outside air. Drives dehumidification and exhaust.
    Humid,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "hot_dry" | "hot-dry" => Self::HotDry,
            "humid" => Self::Humid,
            _ => Self::Balanced,
        }
    }

    /// (inside temp, inside rh, outside temp, outside rh)
    fn baseline(self) -> (f64, f64, f64, f64) {
        match self {
            Self::Balanced => (25.0, 60.0, 20.0, 55.0),
            Self::HotDry => (30.0, 40.0, 22.0, 60.0),
            Self::Humid => (24.0, 78.0, 18.0, 45.0),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Balanced => write!(f, "balanced"),
            Self::HotDry => write!(f, "hot_dry"),
            Self::Humid => write!(f, "humid"),
        }
    }
}

// ---------------------------------------------------------------------------
// Actuator feedback
// ---------------------------------------------------------------------------

/// Switches the simulator reacts to. Names match the hub's command topics.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Switches {
    pub pump: bool,
    pub fan_intake: bool,
    pub fan_exhaust: bool,
    pub fan_circulation: bool,
    pub humidifier: bool,
    pub dehumidifier: bool,
    pub co2_valve: bool,
    /// `Some` once the hub has commanded the light; overrides the cycle.
    pub grow_light: Option<bool>,
}

impl Switches {
    /// Apply a command. Returns false for names the simulator does not model.
    pub fn apply(&mut self, name: &str, on: bool) -> bool {
        let slot = match name {
            "pump" => &mut self.pump,
            "fan_intake" => &mut self.fan_intake,
            "fan_exhaust" => &mut self.fan_exhaust,
            "fan_circulation" => &mut self.fan_circulation,
            "humidifier" => &mut self.humidifier,
            "dehumidifier" => &mut self.dehumidifier,
            "co2_valve" => &mut self.co2_valve,
            "grow_light" => {
                self.grow_light = Some(on);
                return true;
            }
            _ => return false,
        };
        *slot = on;
        true
    }
}

/// Parse an "ON"/"OFF" command payload.
pub fn parse_switch_payload(payload: &[u8]) -> Option<bool> {
    let s = std::str::from_utf8(payload).ok()?.trim();
    if s.eq_ignore_ascii_case("on") {
        Some(true)
    } else if s.eq_ignore_ascii_case("off") {
        Some(false)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct GrowRoomSim {
    pub switches: Switches,

    temp_in: f64,
    rh_in: f64,
    temp_out: f64,
    rh_out: f64,
    co2: f64,
    vwc: f64,
    ec: f64,
    ph: f64,
    water_level: f64,

    base_temp_out: f64,
    base_rh_out: f64,
    setpoint_temp: f64,
    setpoint_rh: f64,

    /// Seconds of simulated time since start.
    clock_s: f64,
    /// Length of a full day/night cycle in seconds.
    day_length_s: f64,
    noise: f64,
}

impl GrowRoomSim {
    /// `day_length_s` controls the light cycle. Use 600 (10 min) for fast
    /// dev iteration or 86400 for real-time. Lights are on for the first
    /// two thirds of each cycle (18/6).
    pub fn new(scenario: Scenario, day_length_s: f64) -> Self {
        let (temp_in, rh_in, temp_out, rh_out) = scenario.baseline();
        Self {
            switches: Switches::default(),
            temp_in,
            rh_in,
            temp_out,
            rh_out,
            co2: 800.0,
            vwc: 55.0,
            ec: 2.5,
            ph: 6.0,
            water_level: 80.0,
            base_temp_out: temp_out,
            base_rh_out: rh_out,
            setpoint_temp: temp_in,
            setpoint_rh: rh_in,
            clock_s: 0.0,
            day_length_s: day_length_s.max(1.0),
            noise: 1.0,
        }
    }

    /// Disable sensor noise (deterministic runs).
    pub fn without_noise(mut self) -> Self {
        self.noise = 0.0;
        self
    }

    pub fn lights_on(&self) -> bool {
        self.switches
            .grow_light
            .unwrap_or_else(|| (self.clock_s % self.day_length_s) < self.day_length_s * 2.0 / 3.0)
    }

    /// Advance the simulation by `dt_s` seconds.
    pub fn step(&mut self, dt_s: f64) {
        self.clock_s += dt_s;
        let minutes = dt_s / 60.0;

        // Outside swings a few degrees over the cycle.
        let phase = 2.0 * std::f64::consts::PI * self.clock_s / self.day_length_s;
        self.temp_out = self.base_temp_out + 3.0 * phase.sin();
        self.rh_out = (self.base_rh_out - 8.0 * phase.sin()).clamp(5.0, 100.0);

        // Inside relaxes toward its setpoint; lights add heat.
        let light_heat = if self.lights_on() { 2.0 } else { -1.0 };
        let mut d_temp = 0.02 * (self.setpoint_temp + light_heat - self.temp_in);
        let mut d_rh = 0.02 * (self.setpoint_rh - self.rh_in);

        let air_exchange = match (self.switches.fan_intake, self.switches.fan_exhaust) {
            (true, true) => 0.15,
            (true, false) | (false, true) => 0.08,
            (false, false) => 0.0,
        };
        d_temp += air_exchange * (self.temp_out - self.temp_in);
        d_rh += air_exchange * (self.rh_out - self.rh_in);

        if self.switches.humidifier {
            d_rh += 1.5;
        }
        if self.switches.dehumidifier {
            d_rh -= 1.5;
            d_temp += 0.1;
        }

        self.temp_in += d_temp * minutes;
        self.rh_in = (self.rh_in + d_rh * minutes).clamp(5.0, 100.0);

        // Plants draw CO2 in the light; the valve and fresh air restore it.
        let mut d_co2 = if self.lights_on() { -15.0 } else { 5.0 };
        if self.switches.co2_valve {
            d_co2 += 60.0;
        }
        d_co2 += air_exchange * (420.0 - self.co2);
        self.co2 = (self.co2 + d_co2 * minutes).clamp(300.0, 2500.0);

        // Substrate: dryback, faster with lights on; pump wets it.
        let dryback = if self.lights_on() { 0.08 } else { 0.03 };
        self.vwc -= dryback * minutes;
        if self.switches.pump {
            self.vwc += 2.0 * minutes;
            self.ec -= 0.01 * minutes;
            self.water_level -= 0.5 * minutes;
        } else {
            self.ec += 0.001 * minutes;
        }
        self.vwc = self.vwc.clamp(10.0, 90.0);
        self.ec = self.ec.clamp(0.5, 6.0);
        self.water_level = self.water_level.clamp(0.0, 100.0);
    }

    fn noisy(&self, v: f64, sigma: f64) -> f64 {
        gaussian(v, sigma * self.noise)
    }

    /// Current state map in the shape the hub expects on `tele/<device>/state`.
    pub fn states(&self) -> BTreeMap<&'static str, Value> {
        let on_off = |b: bool| json!(if b { "on" } else { "off" });
        let mut m = BTreeMap::new();

        m.insert("temperature", json!(round1(self.noisy(self.temp_in, 0.1))));
        m.insert("humidity", json!(round1(self.noisy(self.rh_in, 0.3)).clamp(0.0, 100.0)));
        m.insert("pressure", json!(round1(self.noisy(1013.0, 0.5))));
        m.insert("co2", json!(self.noisy(self.co2, 5.0).round()));
        m.insert("vwc", json!(round1(self.noisy(self.vwc, 0.2))));
        m.insert("ec_substrate", json!(round2(self.noisy(self.ec, 0.02))));
        m.insert("ph_substrate", json!(round2(self.noisy(self.ph, 0.02))));
        m.insert("temp_substrate", json!(round1(self.noisy(self.temp_in - 2.0, 0.1))));
        m.insert("water_level", json!(round1(self.water_level)));

        m.insert("temperature_outside", json!(round1(self.noisy(self.temp_out, 0.1))));
        m.insert(
            "humidity_outside",
            json!(round1(self.noisy(self.rh_out, 0.3)).clamp(0.0, 100.0)),
        );
        m.insert("pressure_outside", json!(round1(self.noisy(1013.0, 0.5))));
        m.insert("co2_outside", json!(420.0));

        m.insert("pump", on_off(self.switches.pump));
        m.insert("fan_intake", on_off(self.switches.fan_intake));
        m.insert("fan_exhaust", on_off(self.switches.fan_exhaust));
        m.insert("humidifier", on_off(self.switches.humidifier));
        m.insert("dehumidifier", on_off(self.switches.dehumidifier));
        m.insert("co2_valve", on_off(self.switches.co2_valve));
        m.insert("led_panel", on_off(self.lights_on()));
        m.insert("grow_light_switch", on_off(self.lights_on()));
        m
    }
}

// ===========================================================================
// Tests
// ===========================================================================
