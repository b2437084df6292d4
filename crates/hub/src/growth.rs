//! Growth phases, crop steering and irrigation phases, with the built-in
//! per-phase parameter table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Growth phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrowthPhase {
    Vegetative,
    FloweringStretch,
    FloweringBulk,
    FloweringFinish,
}

impl GrowthPhase {
    pub const ALL: [GrowthPhase; 4] = [
        Self::Vegetative,
        Self::FloweringStretch,
        Self::FloweringBulk,
        Self::FloweringFinish,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vegetative => "vegetative",
            Self::FloweringStretch => "flowering_stretch",
            Self::FloweringBulk => "flowering_bulk",
            Self::FloweringFinish => "flowering_finish",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Vegetative => 0,
            Self::FloweringStretch => 1,
            Self::FloweringBulk => 2,
            Self::FloweringFinish => 3,
        }
    }
}

impl fmt::Display for GrowthPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrowthPhase {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| EngineError::invalid("growth phase", s))
    }
}

// ---------------------------------------------------------------------------
// Crop steering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CropSteering {
    Vegetative,
    Generative,
    Balanced,
}

/// Adjustments a steering strategy applies on top of the phase table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SteeringProfile {
    pub shot_multiplier: f64,
    pub dryback_delta: f64,
    pub ec_delta: f64,
    pub vpd_delta: f64,
}

impl CropSteering {
    pub const ALL: [CropSteering; 3] = [Self::Vegetative, Self::Generative, Self::Balanced];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vegetative => "vegetative",
            Self::Generative => "generative",
            Self::Balanced => "balanced",
        }
    }

    pub fn profile(self) -> SteeringProfile {
        match self {
            // More water, less stress.
            Self::Vegetative => SteeringProfile {
                shot_multiplier: 1.5,
                dryback_delta: -5.0,
                ec_delta: -1.0,
                vpd_delta: -0.1,
            },
            // Less water, more stress; pushes flowering.
            Self::Generative => SteeringProfile {
                shot_multiplier: 0.8,
                dryback_delta: 5.0,
                ec_delta: 1.5,
                vpd_delta: 0.2,
            },
            Self::Balanced => SteeringProfile {
                shot_multiplier: 1.0,
                dryback_delta: 0.0,
                ec_delta: 0.0,
                vpd_delta: 0.0,
            },
        }
    }
}

impl fmt::Display for CropSteering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CropSteering {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| EngineError::invalid("crop steering", s))
    }
}

// ---------------------------------------------------------------------------
// Irrigation phase (P0-P3)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IrrigationPhase {
    P0,
    P1,
    P2,
    P3,
}

impl IrrigationPhase {
    pub const ALL: [IrrigationPhase; 4] = [Self::P0, Self::P1, Self::P2, Self::P3];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::P0 => "P0",
            Self::P1 => "P1",
            Self::P2 => "P2",
            Self::P3 => "P3",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::P0 => "Additional Dryback",
            Self::P1 => "Saturation",
            Self::P2 => "Maintenance",
            Self::P3 => "Overnight Dryback",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::P0 => "let transpiration start before the first irrigation",
            Self::P1 => "saturate the substrate with spaced shots (4% every 20 min, max 4)",
            Self::P2 => "hold peak VWC with 2.5% shots triggered at 5% dryback",
            Self::P3 => "overnight dryback toward the steering target",
        }
    }
}

impl fmt::Display for IrrigationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IrrigationPhase {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| EngineError::invalid("irrigation phase", s))
    }
}

// ---------------------------------------------------------------------------
// Phase parameter table
// ---------------------------------------------------------------------------

/// The tunable per-phase parameters that carry separate day and night values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Param {
    Vwc,
    Ec,
    Ph,
    Vpd,
    Temperature,
    Humidity,
    Co2,
}

impl Param {
    pub const ALL: [Param; 7] = [
        Self::Vwc,
        Self::Ec,
        Self::Ph,
        Self::Vpd,
        Self::Temperature,
        Self::Humidity,
        Self::Co2,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vwc => "vwc",
            Self::Ec => "ec",
            Self::Ph => "ph",
            Self::Vpd => "vpd",
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Co2 => "co2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DayNight {
    pub day: f64,
    pub night: f64,
}

impl DayNight {
    pub const fn new(day: f64, night: f64) -> Self {
        Self { day, night }
    }

    pub fn pick(&self, is_day: bool) -> f64 {
        if is_day {
            self.day
        } else {
            self.night
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseParams {
    pub vwc: DayNight,
    pub ec: DayNight,
    pub ph: DayNight,
    pub vpd: DayNight,
    pub temperature: DayNight,
    pub humidity: DayNight,
    pub co2: DayNight,
    pub dryback: f64,
}

impl PhaseParams {
    pub fn get(&self, param: Param) -> DayNight {
        *self.slot(param)
    }

    pub fn set(&mut self, param: Param, value: DayNight) {
        *self.slot_mut(param) = value;
    }

    fn slot(&self, param: Param) -> &DayNight {
        match param {
            Param::Vwc => &self.vwc,
            Param::Ec => &self.ec,
            Param::Ph => &self.ph,
            Param::Vpd => &self.vpd,
            Param::Temperature => &self.temperature,
            Param::Humidity => &self.humidity,
            Param::Co2 => &self.co2,
        }
    }

    fn slot_mut(&mut self, param: Param) -> &mut DayNight {
        match param {
            Param::Vwc => &mut self.vwc,
            Param::Ec => &mut self.ec,
            Param::Ph => &mut self.ph,
            Param::Vpd => &mut self.vpd,
            Param::Temperature => &mut self.temperature,
            Param::Humidity => &mut self.humidity,
            Param::Co2 => &mut self.co2,
        }
    }
}

/// Parameters for every growth phase. Starts from the built-in values; the
/// config file may override individual day/night pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseTable {
    entries: [PhaseParams; 4],
}

impl PhaseTable {
    pub fn params(&self, phase: GrowthPhase) -> &PhaseParams {
        &self.entries[phase.index()]
    }

    pub fn params_mut(&mut self, phase: GrowthPhase) -> &mut PhaseParams {
        &mut self.entries[phase.index()]
    }
}

impl Default for PhaseTable {
    fn default() -> Self {
        Self {
            entries: [
                PhaseParams {
                    vwc: DayNight::new(75.0, 75.0),
                    ec: DayNight::new(4.0, 4.0),
                    ph: DayNight::new(6.0, 6.0),
                    vpd: DayNight::new(0.9, 0.7),
                    temperature: DayNight::new(25.0, 22.0),
                    humidity: DayNight::new(65.0, 70.0),
                    co2: DayNight::new(1200.0, 1000.0),
                    dryback: 35.0,
                },
                PhaseParams {
                    vwc: DayNight::new(80.0, 80.0),
                    ec: DayNight::new(5.0, 5.0),
                    ph: DayNight::new(6.0, 6.0),
                    vpd: DayNight::new(1.2, 0.9),
                    temperature: DayNight::new(24.0, 21.0),
                    humidity: DayNight::new(60.0, 65.0),
                    co2: DayNight::new(1400.0, 1200.0),
                    dryback: 40.0,
                },
                PhaseParams {
                    vwc: DayNight::new(85.0, 85.0),
                    ec: DayNight::new(7.0, 7.0),
                    ph: DayNight::new(6.0, 6.0),
                    vpd: DayNight::new(1.2, 0.9),
                    temperature: DayNight::new(22.0, 19.0),
                    humidity: DayNight::new(55.0, 60.0),
                    co2: DayNight::new(1500.0, 1300.0),
                    dryback: 45.0,
                },
                PhaseParams {
                    vwc: DayNight::new(70.0, 70.0),
                    ec: DayNight::new(3.0, 3.0),
                    ph: DayNight::new(6.0, 6.0),
                    vpd: DayNight::new(1.4, 1.0),
                    temperature: DayNight::new(20.0, 17.0),
                    humidity: DayNight::new(50.0, 55.0),
                    co2: DayNight::new(1200.0, 1000.0),
                    dryback: 50.0,
                },
            ],
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
