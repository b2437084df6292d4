//! Threshold alerts, recomputed from scratch every refresh.

use serde::{Deserialize, Serialize};

use crate::sensors::{keys, Readings};
use crate::targets::Targets;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub severity: Severity,
    pub metric: &'static str,
    pub message: String,
}

/// Critical band plus the allowed deviation from target before a warning.
/// With `relative`, `warn_tolerance` is a fraction of the target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub critical_low: f64,
    pub critical_high: f64,
    pub warn_tolerance: f64,
    #[serde(default)]
    pub relative: bool,
}

impl Band {
    const fn absolute(low: f64, high: f64, tolerance: f64) -> Self {
        Self {
            critical_low: low,
            critical_high: high,
            warn_tolerance: tolerance,
            relative: false,
        }
    }

    const fn relative(low: f64, high: f64, fraction: f64) -> Self {
        Self {
            critical_low: low,
            critical_high: high,
            warn_tolerance: fraction,
            relative: true,
        }
    }

    fn tolerance(&self, target: f64) -> f64 {
        if self.relative {
            self.warn_tolerance * target.abs()
        } else {
            self.warn_tolerance
        }
    }

    fn check(&self, value: f64, target: f64) -> Option<Severity> {
        if value < self.critical_low || value > self.critical_high {
            Some(Severity::Critical)
        } else if (value - target).abs() > self.tolerance(target) {
            Some(Severity::Warning)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertBands {
    pub vwc: Band,
    pub ec: Band,
    pub ph: Band,
    pub temperature: Band,
    pub vpd: Band,
}

impl Default for AlertBands {
    fn default() -> Self {
        Self {
            vwc: Band::relative(50.0, 95.0, 0.10),
            ec: Band::relative(2.0, 10.0, 0.15),
            ph: Band::absolute(5.0, 7.0, 0.3),
            temperature: Band::absolute(15.0, 35.0, 3.0),
            vpd: Band::absolute(0.5, 2.0, 0.2),
        }
    }
}

impl AlertBands {
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Band)> {
        [
            ("vwc", &self.vwc),
            ("ec", &self.ec),
            ("ph", &self.ph),
            ("temperature", &self.temperature),
            ("vpd", &self.vpd),
        ]
        .into_iter()
    }
}

/// Compare each monitored metric against its band and target. `vpd` is the
/// derived inside VPD; the rest come straight from the readings.
pub fn evaluate(
    readings: &Readings,
    vpd: Option<f64>,
    targets: &Targets,
    bands: &AlertBands,
) -> Vec<Alert> {
    let checks = [
        ("vwc", readings.number(keys::VWC), targets.vwc, &bands.vwc, "%"),
        ("ec", readings.number(keys::EC_SUBSTRATE), targets.ec, &bands.ec, " mS/cm"),
        ("ph", readings.number(keys::PH_SUBSTRATE), targets.ph, &bands.ph, ""),
        (
            "temperature",
            readings.number(keys::TEMPERATURE),
            targets.temperature,
            &bands.temperature,
            " C",
        ),
        ("vpd", vpd, targets.vpd, &bands.vpd, " kPa"),
    ];

    let mut alerts = Vec::new();
    for (metric, value, target, band, unit) in checks {
        let Some(value) = value else {
            alerts.push(Alert {
                severity: Severity::Info,
                metric,
                message: format!("{metric}: no reading"),
            });
            continue;
        };
        let Some(severity) = band.check(value, target) else {
            continue;
        };
        let message = if severity == Severity::Critical {
            format!(
                "{metric} {value}{unit} outside safe range {}-{}{unit}",
                band.critical_low, band.critical_high
            )
        } else {
            format!("{metric} {value}{unit} is off target {target}{unit}")
        };
        alerts.push(Alert {
            severity,
            metric,
            message,
        });
    }
    alerts
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::growth::{CropSteering, GrowthPhase, PhaseTable};
    use crate::sensors::ReadingValue;
    use crate::targets::resolve;

    fn veg_day() -> Targets {
        // vwc 75, ec 4.0, ph 6.0, vpd 0.9, temperature 25
        resolve(&PhaseTable::default(), GrowthPhase::Vegetative, CropSteering::Balanced, true)
    }

    fn readings(pairs: &[(&str, f64)]) -> Readings {
        let mut r = Readings::default();
        for (k, v) in pairs {
            r.insert(k, Some(ReadingValue::Number(*v)));
        }
        r
    }

    fn on_target() -> Readings {
        readings(&[
            (keys::VWC, 75.0),
            (keys::EC_SUBSTRATE, 4.0),
            (keys::PH_SUBSTRATE, 6.0),
            (keys::TEMPERATURE, 25.0),
        ])
    }

    fn severity_of(alerts: &[Alert], metric: &str) -> Option<Severity> {
        alerts.iter().find(|a| a.metric == metric).map(|a| a.severity)
    }

    #[test]
    fn on_target_room_has_no_alerts() {
        let alerts = evaluate(&on_target(), Some(0.9), &veg_day(), &AlertBands::default());
        assert!(alerts.is_empty(), "{alerts:?}");
    }

    #[test]
    fn missing_reading_is_info() {
        let alerts = evaluate(&on_target(), None, &veg_day(), &AlertBands::default());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Info);
        assert_eq!(alerts[0].metric, "vpd");
    }

    #[test]
    fn outside_critical_band_is_critical() {
        let r = readings(&[
            (keys::VWC, 45.0),
            (keys::EC_SUBSTRATE, 4.0),
            (keys::PH_SUBSTRATE, 7.2),
            (keys::TEMPERATURE, 25.0),
        ]);
        let alerts = evaluate(&r, Some(2.3), &veg_day(), &AlertBands::default());
        assert_eq!(severity_of(&alerts, "vwc"), Some(Severity::Critical));
        assert_eq!(severity_of(&alerts, "ph"), Some(Severity::Critical));
        assert_eq!(severity_of(&alerts, "vpd"), Some(Severity::Critical));
        assert_eq!(severity_of(&alerts, "ec"), None);
    }

    #[test]
    fn relative_tolerance_scales_with_target() {
        // ec target 4.0, 15 % -> 0.6
        let mut r = on_target();
        r.insert(keys::EC_SUBSTRATE, Some(ReadingValue::Number(4.5)));
        let alerts = evaluate(&r, Some(0.9), &veg_day(), &AlertBands::default());
        assert!(alerts.is_empty());

        r.insert(keys::EC_SUBSTRATE, Some(ReadingValue::Number(4.7)));
        let alerts = evaluate(&r, Some(0.9), &veg_day(), &AlertBands::default());
        assert_eq!(severity_of(&alerts, "ec"), Some(Severity::Warning));
    }

    #[test]
    fn absolute_tolerance_for_temperature() {
        let mut r = on_target();
        r.insert(keys::TEMPERATURE, Some(ReadingValue::Number(28.5)));
        let alerts = evaluate(&r, Some(0.9), &veg_day(), &AlertBands::default());
        assert_eq!(severity_of(&alerts, "temperature"), Some(Severity::Warning));
        assert!(alerts[0].message.contains("off target"));
    }

    #[test]
    fn bands_deserialize_with_missing_metrics_defaulted() {
        let bands: AlertBands = toml::from_str(
            "[ph]\ncritical_low = 5.5\ncritical_high = 6.5\nwarn_tolerance = 0.2\n",
        )
        .unwrap();
        assert_eq!(bands.ph, Band::absolute(5.5, 6.5, 0.2));
        assert_eq!(bands.vwc, AlertBands::default().vwc);
    }
}
