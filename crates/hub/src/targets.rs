//! Target resolution: growth phase + crop steering + day/night state to
//! concrete setpoints.

use serde::Serialize;
use time::macros::format_description;
use time::{OffsetDateTime, Time, UtcOffset};

use crate::error::{EngineError, EngineResult};
use crate::growth::{CropSteering, GrowthPhase, PhaseTable};
use crate::metrics::round_to;
use crate::sensors::Readings;

pub const VPD_TARGET_MIN: f64 = 0.5;
pub const VPD_TARGET_MAX: f64 = 2.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Targets {
    pub vwc: f64,
    pub ec: f64,
    pub ph: f64,
    pub vpd: f64,
    pub temperature: f64,
    pub humidity: f64,
    pub co2: f64,
    pub dryback: f64,
}

/// Steering-adjusted values, reported next to the unmodified targets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SteeringAdvice {
    pub strategy: CropSteering,
    pub shot_multiplier: f64,
    pub ec_target: f64,
    pub dryback_target: f64,
}

/// Phase VPD for the current light state, shifted by steering and clamped
/// to [0.5, 2.0] kPa.
pub fn vpd_target(table: &PhaseTable, phase: GrowthPhase, steering: CropSteering, is_day: bool) -> f64 {
    let base = table.params(phase).vpd.pick(is_day);
    let adjusted = base + steering.profile().vpd_delta;
    round_to(adjusted.clamp(VPD_TARGET_MIN, VPD_TARGET_MAX), 2)
}

pub fn resolve(
    table: &PhaseTable,
    phase: GrowthPhase,
    steering: CropSteering,
    is_day: bool,
) -> Targets {
    let p = table.params(phase);
    Targets {
        vwc: p.vwc.pick(is_day),
        ec: p.ec.pick(is_day),
        ph: p.ph.pick(is_day),
        vpd: vpd_target(table, phase, steering, is_day),
        temperature: p.temperature.pick(is_day),
        humidity: p.humidity.pick(is_day),
        co2: p.co2.pick(is_day),
        dryback: p.dryback,
    }
}

pub fn steering_advice(targets: &Targets, steering: CropSteering) -> SteeringAdvice {
    let profile = steering.profile();
    SteeringAdvice {
        strategy: steering,
        shot_multiplier: profile.shot_multiplier,
        ec_target: round_to(targets.ec + profile.ec_delta, 2),
        dryback_target: round_to(targets.dryback + profile.dryback_delta, 1),
    }
}

// ---------------------------------------------------------------------------
// Day / night
// ---------------------------------------------------------------------------

/// Fixed lights-on window, used only when no light state is reported.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightSchedule {
    pub start: Time,
    pub end: Time,
    pub offset: UtcOffset,
}

impl LightSchedule {
    pub fn parse(start: &str, end: &str, utc_offset_minutes: i32) -> EngineResult<Self> {
        let fmt = format_description!("[hour]:[minute]");
        let start = Time::parse(start.trim(), &fmt)
            .map_err(|_| EngineError::InvalidArgument(format!("bad schedule start '{start}'")))?;
        let end = Time::parse(end.trim(), &fmt)
            .map_err(|_| EngineError::InvalidArgument(format!("bad schedule end '{end}'")))?;
        let offset = UtcOffset::from_whole_seconds(utc_offset_minutes * 60).map_err(|_| {
            EngineError::InvalidArgument(format!("bad utc offset {utc_offset_minutes} min"))
        })?;
        Ok(Self { start, end, offset })
    }

    pub fn is_day_at(&self, now: OffsetDateTime) -> bool {
        let t = now.to_offset(self.offset).time();
        if self.start <= self.end {
            self.start <= t && t <= self.end
        } else {
            // Window wraps past midnight.
            t >= self.start || t <= self.end
        }
    }
}

/// Lights are on when the configured light reports "on". Without any light
/// reading the schedule decides, if there is one; otherwise it is night.
pub fn lights_on(
    readings: &Readings,
    light_key: &str,
    schedule: Option<&LightSchedule>,
    now: OffsetDateTime,
) -> bool {
    match readings.text(light_key) {
        Some(state) => state.eq_ignore_ascii_case("on"),
        None => schedule.is_some_and(|s| s.is_day_at(now)),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
