//! Sensor source: logical reading keys, the per-cycle reading snapshot, and
//! the MQTT-fed state cache the refresh loop pulls from.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Logical reading keys published by the grow-room controller.
pub mod keys {
    pub const TEMPERATURE: &str = "temperature";
    pub const HUMIDITY: &str = "humidity";
    pub const PRESSURE: &str = "pressure";
    pub const VWC: &str = "vwc";
    pub const EC_SUBSTRATE: &str = "ec_substrate";
    pub const PH_SUBSTRATE: &str = "ph_substrate";
    pub const TEMP_SUBSTRATE: &str = "temp_substrate";
    pub const CO2: &str = "co2";
    pub const WATER_LEVEL: &str = "water_level";

    pub const TEMPERATURE_OUTSIDE: &str = "temperature_outside";
    pub const HUMIDITY_OUTSIDE: &str = "humidity_outside";
    pub const PRESSURE_OUTSIDE: &str = "pressure_outside";
    pub const CO2_OUTSIDE: &str = "co2_outside";

    pub const PUMP: &str = "pump";
    pub const FAN_INTAKE: &str = "fan_intake";
    pub const FAN_EXHAUST: &str = "fan_exhaust";
    pub const HUMIDIFIER: &str = "humidifier";
    pub const DEHUMIDIFIER: &str = "dehumidifier";
    pub const CO2_VALVE: &str = "co2_valve";
    pub const LED_PANEL: &str = "led_panel";
    pub const GROW_LIGHT_SWITCH: &str = "grow_light_switch";

    /// Keys whose states are parsed as numbers.
    pub const NUMERIC: &[&str] = &[
        TEMPERATURE,
        HUMIDITY,
        PRESSURE,
        VWC,
        EC_SUBSTRATE,
        PH_SUBSTRATE,
        TEMP_SUBSTRATE,
        CO2,
        WATER_LEVEL,
        TEMPERATURE_OUTSIDE,
        HUMIDITY_OUTSIDE,
        PRESSURE_OUTSIDE,
        CO2_OUTSIDE,
    ];

    /// Switch and light states, kept as text.
    pub const STATES: &[&str] = &[
        PUMP,
        FAN_INTAKE,
        FAN_EXHAUST,
        HUMIDIFIER,
        DEHUMIDIFIER,
        CO2_VALVE,
        LED_PANEL,
        GROW_LIGHT_SWITCH,
    ];
}

// ---------------------------------------------------------------------------
// Reading snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReadingValue {
    Number(f64),
    Text(String),
}

/// One poll cycle's readings. `None` marks an unavailable reading.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Readings(BTreeMap<String, Option<ReadingValue>>);

impl Readings {
    pub fn insert(&mut self, key: &str, value: Option<ReadingValue>) {
        self.0.insert(key.to_string(), value);
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        match self.0.get(key) {
            Some(Some(ReadingValue::Number(v))) => Some(*v),
            _ => None,
        }
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(Some(ReadingValue::Text(s))) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn is_on(&self, key: &str) -> bool {
        self.text(key).is_some_and(|s| s.eq_ignore_ascii_case("on"))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Convert a raw state string into a reading.
///
/// "unavailable"/"unknown" (and empty) mean absent. Numeric keys become
/// numbers when they parse; anything else is passed through as text.
pub fn parse_state(key: &str, raw: Option<&str>) -> Option<ReadingValue> {
    let raw = raw?.trim();
    if raw.is_empty()
        || raw.eq_ignore_ascii_case("unavailable")
        || raw.eq_ignore_ascii_case("unknown")
    {
        return None;
    }
    if keys::NUMERIC.contains(&key) {
        match raw.parse::<f64>() {
            Ok(v) if v.is_finite() => return Some(ReadingValue::Number(v)),
            // NaN / inf from a faulty probe counts as no reading.
            Ok(_) => return None,
            Err(_) => {}
        }
    }
    Some(ReadingValue::Text(raw.to_string()))
}

// ---------------------------------------------------------------------------
// Source contract
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no telemetry received yet")]
    NoTelemetry,
    #[error("telemetry is stale ({age_sec}s old, limit {limit_sec}s)")]
    Stale { age_sec: u64, limit_sec: u64 },
}

/// Supplies the raw state of a logical sensor key, or `None` when that
/// reading is unavailable.
pub trait SensorSource: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, SourceError>;
}

// ---------------------------------------------------------------------------
// MQTT-fed cache
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CacheInner {
    states: HashMap<String, String>,
    last_update: Option<Instant>,
}

/// Latest state per key, filled from telemetry messages. Each message
/// replaces the whole map so keys that stop reporting become unavailable.
pub struct SensorCache {
    inner: RwLock<CacheInner>,
    stale_after: Duration,
}

impl SensorCache {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            stale_after,
        }
    }

    pub fn replace(&self, states: HashMap<String, String>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.states = states;
        inner.last_update = Some(Instant::now());
    }

    fn check_fresh(&self, inner: &CacheInner) -> Result<(), SourceError> {
        let last = inner.last_update.ok_or(SourceError::NoTelemetry)?;
        let age = last.elapsed();
        if age > self.stale_after {
            return Err(SourceError::Stale {
                age_sec: age.as_secs(),
                limit_sec: self.stale_after.as_secs(),
            });
        }
        Ok(())
    }
}

impl SensorSource for SensorCache {
    fn get(&self, key: &str) -> Result<Option<String>, SourceError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        self.check_fresh(&inner)?;
        Ok(inner.states.get(key).cloned())
    }
}

// ---------------------------------------------------------------------------
// Test source
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_numeric_key() {
        assert_eq!(
            parse_state(keys::VWC, Some(" 62.5 ")),
            Some(ReadingValue::Number(62.5))
        );
    }

    #[test]
    fn parse_numeric_key_with_garbage_keeps_text() {
        assert_eq!(
            parse_state(keys::TEMPERATURE, Some("n/a")),
            Some(ReadingValue::Text("n/a".into()))
        );
    }

    #[test]
    fn parse_outside_keys_are_numeric() {
        assert_eq!(
            parse_state(keys::HUMIDITY_OUTSIDE, Some("58")),
            Some(ReadingValue::Number(58.0))
        );
    }

    #[test]
    fn parse_state_keys_stay_text() {
        assert_eq!(
            parse_state(keys::PUMP, Some("off")),
            Some(ReadingValue::Text("off".into()))
        );
    }

    #[test]
    fn parse_non_finite_numbers_as_absent() {
        for raw in ["nan", "NaN", "inf", "-inf", "infinity"] {
            assert_eq!(parse_state(keys::TEMPERATURE, Some(raw)), None, "{raw}");
        }
        assert_eq!(
            parse_state(keys::PUMP, Some("nan")),
            Some(ReadingValue::Text("nan".into()))
        );
    }

    #[test]
    fn parse_unavailable_markers() {
        assert_eq!(parse_state(keys::VWC, Some("unavailable")), None);
        assert_eq!(parse_state(keys::VWC, Some("Unknown")), None);
        assert_eq!(parse_state(keys::VWC, Some("")), None);
        assert_eq!(parse_state(keys::VWC, None), None);
    }

    #[test]
    fn readings_is_on() {
        let mut r = Readings::default();
        r.insert(keys::LED_PANEL, Some(ReadingValue::Text("ON".into())));
        r.insert(keys::PUMP, Some(ReadingValue::Text("off".into())));
        assert!(r.is_on(keys::LED_PANEL));
        assert!(!r.is_on(keys::PUMP));
        assert!(!r.is_on(keys::FAN_INTAKE));
    }

    #[test]
    fn cache_errors_before_first_message() {
        let cache = SensorCache::new(Duration::from_secs(60));
        assert!(matches!(cache.get(keys::VWC), Err(SourceError::NoTelemetry)));
    }

    #[test]
    fn cache_replace_drops_missing_keys() {
        let cache = SensorCache::new(Duration::from_secs(60));
        cache.replace(HashMap::from([
            (keys::VWC.to_string(), "60".to_string()),
            (keys::EC_SUBSTRATE.to_string(), "4.2".to_string()),
        ]));
        cache.replace(HashMap::from([(keys::VWC.to_string(), "58".to_string())]));
        assert_eq!(cache.get(keys::VWC).unwrap().as_deref(), Some("58"));
        assert_eq!(cache.get(keys::EC_SUBSTRATE).unwrap(), None);
    }

    #[test]
    fn cache_reports_stale_telemetry() {
        let cache = SensorCache::new(Duration::from_millis(0));
        cache.replace(HashMap::new());
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(cache.get(keys::VWC), Err(SourceError::Stale { .. })));
    }
}
