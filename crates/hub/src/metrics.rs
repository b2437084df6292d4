//! Derived climate and substrate metrics. Pure functions over one reading
//! snapshot; nothing here keeps state between cycles.

use serde::Serialize;

use crate::error::{EngineError, EngineResult};
use crate::sensors::{keys, Readings};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DerivedMetrics {
    pub vpd_inside: Option<f64>,
    pub vpd_outside: Option<f64>,
    pub temperature_differential: Option<f64>,
    pub humidity_differential: Option<f64>,
    pub dryback_percent: f64,
}

/// Vapor pressure deficit in kPa (Tetens), rounded to 2 decimals.
pub fn vpd(temp_c: f64, humidity: f64) -> f64 {
    let svp = 0.6108 * (17.27 * temp_c / (temp_c + 237.3)).exp();
    round_to(svp * (100.0 - humidity) / 100.0, 2)
}

/// `a - b` rounded to 1 decimal, when both are present.
pub fn differential(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    Some(round_to(a? - b?, 1))
}

/// Percentage drop of VWC from the peak recorded since the last reset.
///
/// Returns 0 when there is no peak yet (`max_vwc <= 0`) or no current reading.
pub fn dryback_percent(max_vwc: f64, current_vwc: Option<f64>) -> f64 {
    match current_vwc {
        Some(current) if max_vwc > 0.0 => {
            round_to((max_vwc - current) / max_vwc * 100.0, 1).clamp(0.0, 100.0)
        }
        _ => 0.0,
    }
}

/// Compute every derived metric for one cycle.
pub fn derive(readings: &Readings, max_vwc_today: f64) -> EngineResult<DerivedMetrics> {
    let temp_in = readings.number(keys::TEMPERATURE);
    let rh_in = readings.number(keys::HUMIDITY);
    let temp_out = readings.number(keys::TEMPERATURE_OUTSIDE);
    let rh_out = readings.number(keys::HUMIDITY_OUTSIDE);

    let derived = DerivedMetrics {
        vpd_inside: temp_in.zip(rh_in).map(|(t, h)| vpd(t, h)),
        vpd_outside: temp_out.zip(rh_out).map(|(t, h)| vpd(t, h)),
        temperature_differential: differential(temp_in, temp_out),
        humidity_differential: differential(rh_in, rh_out),
        dryback_percent: dryback_percent(max_vwc_today, readings.number(keys::VWC)),
    };

    ensure_finite("vpd_inside", derived.vpd_inside)?;
    ensure_finite("vpd_outside", derived.vpd_outside)?;
    ensure_finite("temperature_differential", derived.temperature_differential)?;
    ensure_finite("humidity_differential", derived.humidity_differential)?;
    ensure_finite("dryback_percent", Some(derived.dryback_percent))?;

    Ok(derived)
}

fn ensure_finite(name: &str, value: Option<f64>) -> EngineResult<()> {
    match value {
        Some(v) if !v.is_finite() => Err(EngineError::Derivation(format!(
            "{name} is not finite ({v})"
        ))),
        _ => Ok(()),
    }
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

// ===========================================================================
// Tests
// ===========================================================================
