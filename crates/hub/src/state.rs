use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::actuator::Actuator;
use crate::alerts::Alert;
use crate::climate::ClimateDecision;
use crate::growth::{CropSteering, GrowthPhase, IrrigationPhase};
use crate::metrics::DerivedMetrics;
use crate::sensors::Readings;
use crate::targets::{SteeringAdvice, Targets};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<EngineState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct EngineState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub growth: GrowthConfig,
    pub irrigation: IrrigationState,
    pub refresh: RefreshHealth,
    pub events: VecDeque<EngineEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrowthConfig {
    pub phase: GrowthPhase,
    pub steering: CropSteering,
    pub substrate_size_l: f64,
}

impl Default for GrowthConfig {
    fn default() -> Self {
        Self {
            phase: GrowthPhase::Vegetative,
            steering: CropSteering::Balanced,
            substrate_size_l: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrrigationState {
    pub current_phase: IrrigationPhase,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_irrigation: Option<OffsetDateTime>,
    pub daily_water_total_l: f64,
    pub max_vwc_today: f64,
    pub lights_on: bool,
    pub automation_enabled: bool,
    /// Set when the pump could not be confirmed off. Cleared by a successful
    /// emergency stop.
    pub safety_fault: Option<String>,
}

impl Default for IrrigationState {
    fn default() -> Self {
        Self {
            current_phase: IrrigationPhase::P3,
            last_irrigation: None,
            daily_water_total_l: 0.0,
            max_vwc_today: 0.0,
            lights_on: false,
            automation_enabled: true,
            safety_fault: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RefreshHealth {
    pub cycles: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success: Option<OffsetDateTime>,
}

#[derive(Clone, Serialize)]
pub struct EngineEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Actuator,
    Irrigation,
    Climate,
    Error,
    Safety,
    System,
}

// ---------------------------------------------------------------------------
// Published snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseInfo {
    pub code: IrrigationPhase,
    pub name: &'static str,
    pub description: &'static str,
}

impl From<IrrigationPhase> for PhaseInfo {
    fn from(code: IrrigationPhase) -> Self {
        Self {
            code,
            name: code.name(),
            description: code.description(),
        }
    }
}

/// Everything one refresh cycle produced. Published whole; never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub taken_at: OffsetDateTime,
    pub readings: Readings,
    pub derived: DerivedMetrics,
    pub targets: Targets,
    pub steering: SteeringAdvice,
    pub climate: ClimateDecision,
    pub alerts: Vec<Alert>,
    pub growth: GrowthConfig,
    pub irrigation: IrrigationState,
    pub irrigation_phase: PhaseInfo,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub growth: GrowthConfig,
    pub irrigation: IrrigationState,
    pub refresh: RefreshHealth,
    pub events: Vec<EngineEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl EngineState {
    pub fn new(growth: GrowthConfig) -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            growth,
            irrigation: IrrigationState::default(),
            refresh: RefreshHealth::default(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared(growth: GrowthConfig) -> SharedState {
        Arc::new(RwLock::new(Self::new(growth)))
    }

    /// Per-cycle irrigation tracking: raise the VWC peak and take the light
    /// state.
    pub fn track_cycle(&mut self, vwc: Option<f64>, lights_on: bool) {
        if let Some(v) = vwc {
            if v > self.irrigation.max_vwc_today {
                self.irrigation.max_vwc_today = v;
            }
        }
        if lights_on != self.irrigation.lights_on {
            let which = if lights_on { "on" } else { "off" };
            self.push_event(EventKind::System, format!("lights {which}"));
        }
        self.irrigation.lights_on = lights_on;
    }

    pub fn record_refresh_ok(&mut self, readings: usize) {
        self.refresh.cycles += 1;
        self.refresh.last_success = Some(OffsetDateTime::now_utc());
        self.refresh.last_error = None;
        self.push_event(EventKind::Reading, format!("refresh: {readings} readings"));
    }

    pub fn record_refresh_failure(&mut self, detail: String) {
        self.refresh.cycles += 1;
        self.refresh.failures += 1;
        self.refresh.last_error = Some(detail.clone());
        self.push_event(EventKind::Error, format!("refresh failed: {detail}"));
    }

    /// Book a completed shot.
    pub fn record_shot(&mut self, size_percent: f64, litres: f64, at: OffsetDateTime) {
        self.irrigation.last_irrigation = Some(at);
        self.irrigation.daily_water_total_l += litres;
        self.push_event(
            EventKind::Irrigation,
            format!("shot {size_percent}% delivered {litres:.3} L"),
        );
    }

    pub fn record_actuator(&mut self, actuator: Actuator, on: bool) {
        let state_str = if on { "ON" } else { "OFF" };
        self.push_event(EventKind::Actuator, format!("{actuator} set {state_str}"));
    }

    pub fn record_pump_fault(&mut self, detail: String) {
        self.irrigation.safety_fault = Some(detail.clone());
        self.push_event(EventKind::Safety, detail);
    }

    pub fn record_irrigation(&mut self, detail: String) {
        self.push_event(EventKind::Irrigation, detail);
    }

    pub fn record_climate(&mut self, detail: String) {
        self.push_event(EventKind::Climate, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status view.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            growth: self.growth.clone(),
            irrigation: self.irrigation.clone(),
            refresh: self.refresh.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(EngineEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}
