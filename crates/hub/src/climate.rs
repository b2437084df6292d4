//! Climate strategy selection and the action tables used to apply a strategy
//! or a ventilation preset to the actuators.
//!
//! Selection is a pure function of the current readings. Applying a strategy
//! expands it into actions, each action into actuator commands, and sends
//! the commands to the sink.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, error, info};

use crate::actuator::{Actuator, ActuatorError, ActuatorSink};
use crate::error::EngineError;

/// Band around the VPD target inside which no humidity rule fires.
pub const VPD_BAND: f64 = 0.2;
/// Deviation below which `fine_tune` and `optimize_vpd` leave things alone.
pub const VPD_FINE_BAND: f64 = 0.1;

const HOT_C: f64 = 28.0;
const COLD_C: f64 = 20.0;

// ---------------------------------------------------------------------------
// Strategy / ventilation names
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClimateStrategy {
    /// Not enough inputs to decide.
    Maintain,
    MaintainOptimal,
    IntakeAir,
    HeatDehumidify,
    CoolHumidify,
    DehumidifyOnly,
    HumidifyOnly,
    CoolingVentilation,
    CoolingOnly,
    Heating,
}

impl ClimateStrategy {
    pub const ALL: [ClimateStrategy; 10] = [
        Self::Maintain,
        Self::MaintainOptimal,
        Self::IntakeAir,
        Self::HeatDehumidify,
        Self::CoolHumidify,
        Self::DehumidifyOnly,
        Self::HumidifyOnly,
        Self::CoolingVentilation,
        Self::CoolingOnly,
        Self::Heating,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Maintain => "maintain",
            Self::MaintainOptimal => "maintain_optimal",
            Self::IntakeAir => "intake_air",
            Self::HeatDehumidify => "heat_dehumidify",
            Self::CoolHumidify => "cool_humidify",
            Self::DehumidifyOnly => "dehumidify_only",
            Self::HumidifyOnly => "humidify_only",
            Self::CoolingVentilation => "cooling_ventilation",
            Self::CoolingOnly => "cooling_only",
            Self::Heating => "heating",
        }
    }

    pub fn actions(self) -> &'static [ClimateAction] {
        use ClimateAction::*;
        match self {
            Self::Maintain => &[Monitor],
            Self::MaintainOptimal => &[Monitor, FineTune],
            Self::IntakeAir => &[IncreaseIntake, ReduceDehumidifier],
            Self::HeatDehumidify => &[IncreaseHeating, IncreaseDehumidifier],
            Self::CoolHumidify => &[IncreaseExhaust, IncreaseHumidifier],
            Self::DehumidifyOnly => &[IncreaseDehumidifier, IncreaseCirculation],
            Self::HumidifyOnly => &[IncreaseHumidifier, ReduceExhaust],
            Self::CoolingVentilation => &[MaximumIntake, IncreaseExhaust],
            Self::CoolingOnly => &[IncreaseExhaust, ReduceHeating],
            Self::Heating => &[IncreaseHeating, ReduceIntake],
        }
    }
}

impl fmt::Display for ClimateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClimateStrategy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| EngineError::invalid("climate strategy", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VentilationMode {
    ReduceIntake,
    Normal,
    IncreaseIntake,
    IncreaseExhaust,
    MaximumIntake,
    ReduceExhaust,
}

/// Fan speeds (percent) a ventilation preset asks for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FanPreset {
    pub intake: u8,
    pub exhaust: u8,
    pub circulation: u8,
}

impl VentilationMode {
    pub const ALL: [VentilationMode; 6] = [
        Self::ReduceIntake,
        Self::Normal,
        Self::IncreaseIntake,
        Self::IncreaseExhaust,
        Self::MaximumIntake,
        Self::ReduceExhaust,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReduceIntake => "reduce_intake",
            Self::Normal => "normal",
            Self::IncreaseIntake => "increase_intake",
            Self::IncreaseExhaust => "increase_exhaust",
            Self::MaximumIntake => "maximum_intake",
            Self::ReduceExhaust => "reduce_exhaust",
        }
    }

    pub fn preset(self) -> FanPreset {
        let (intake, exhaust, circulation) = match self {
            Self::ReduceIntake => (20, 60, 80),
            Self::Normal => (60, 60, 80),
            Self::IncreaseIntake => (80, 60, 100),
            Self::IncreaseExhaust => (60, 80, 80),
            Self::MaximumIntake => (100, 80, 100),
            Self::ReduceExhaust => (40, 40, 100),
        };
        FanPreset {
            intake,
            exhaust,
            circulation,
        }
    }
}

impl fmt::Display for VentilationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VentilationMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == wanted)
            .ok_or_else(|| EngineError::invalid("ventilation mode", s))
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClimateInputs {
    pub temp_in: Option<f64>,
    pub rh_in: Option<f64>,
    pub vpd_in: Option<f64>,
    pub temp_out: Option<f64>,
    pub rh_out: Option<f64>,
    pub vpd_out: Option<f64>,
    pub vpd_target: f64,
}

/// The six readings every rule may look at, all present.
#[derive(Debug, Clone, Copy)]
struct Climate {
    temp_in: f64,
    rh_in: f64,
    vpd_in: f64,
    temp_out: f64,
    rh_out: f64,
    target: f64,
}

impl Climate {
    fn vpd_low(&self) -> bool {
        self.vpd_in < self.target - VPD_BAND
    }

    fn vpd_high(&self) -> bool {
        self.vpd_in > self.target + VPD_BAND
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClimateDecision {
    pub strategy: ClimateStrategy,
    pub ventilation: VentilationMode,
}

impl ClimateDecision {
    const fn new(strategy: ClimateStrategy, ventilation: VentilationMode) -> Self {
        Self {
            strategy,
            ventilation,
        }
    }

    pub const FALLBACK: Self = Self::new(ClimateStrategy::Maintain, VentilationMode::Normal);
}

type Rule = (fn(&Climate) -> bool, ClimateDecision);

/// Evaluated top to bottom; the first matching predicate wins.
const RULES: &[Rule] = {
    use ClimateStrategy as S;
    use VentilationMode as V;
    &[
        (
            |c| c.vpd_low() && c.temp_out > c.temp_in && c.rh_out < c.rh_in,
            ClimateDecision::new(S::IntakeAir, V::IncreaseIntake),
        ),
        (
            |c| c.vpd_low() && c.temp_in < HOT_C,
            ClimateDecision::new(S::HeatDehumidify, V::IncreaseExhaust),
        ),
        (
            |c| c.vpd_low(),
            ClimateDecision::new(S::DehumidifyOnly, V::Normal),
        ),
        (
            |c| c.vpd_high() && c.temp_out < c.temp_in && c.rh_out > c.rh_in,
            ClimateDecision::new(S::IntakeAir, V::IncreaseIntake),
        ),
        (
            |c| c.vpd_high() && c.temp_in > COLD_C,
            ClimateDecision::new(S::CoolHumidify, V::IncreaseExhaust),
        ),
        (
            |c| c.vpd_high(),
            ClimateDecision::new(S::HumidifyOnly, V::ReduceExhaust),
        ),
        (
            |c| c.temp_in > HOT_C && c.temp_out < c.temp_in - 2.0,
            ClimateDecision::new(S::CoolingVentilation, V::MaximumIntake),
        ),
        (
            |c| c.temp_in > HOT_C,
            ClimateDecision::new(S::CoolingOnly, V::IncreaseExhaust),
        ),
        (
            |c| c.temp_in < COLD_C,
            ClimateDecision::new(S::Heating, V::ReduceIntake),
        ),
    ]
};

const OPTIMAL: ClimateDecision =
    ClimateDecision::new(ClimateStrategy::MaintainOptimal, VentilationMode::Normal);

pub fn select(inputs: &ClimateInputs) -> ClimateDecision {
    let climate = match (
        inputs.temp_in,
        inputs.rh_in,
        inputs.vpd_in,
        inputs.temp_out,
        inputs.rh_out,
        inputs.vpd_out,
    ) {
        (Some(temp_in), Some(rh_in), Some(vpd_in), Some(temp_out), Some(rh_out), Some(_)) => {
            Climate {
                temp_in,
                rh_in,
                vpd_in,
                temp_out,
                rh_out,
                target: inputs.vpd_target,
            }
        }
        _ => return ClimateDecision::FALLBACK,
    };

    RULES
        .iter()
        .find(|(matches, _)| matches(&climate))
        .map(|(_, decision)| *decision)
        .unwrap_or(OPTIMAL)
}

/// Strategy `optimize_vpd` picks for the current inside VPD, or `None` when
/// the deviation is between the fine band and the rule band.
pub fn optimize_choice(inputs: &ClimateInputs, vpd_in: f64, target: f64) -> Option<ClimateStrategy> {
    let diff = vpd_in - target;
    let temps = inputs.temp_in.zip(inputs.temp_out);

    if diff.abs() < VPD_FINE_BAND {
        return Some(ClimateStrategy::MaintainOptimal);
    }
    if diff < -VPD_BAND {
        // Too humid: dry outside air helps if it is not too warm.
        return Some(match (inputs.vpd_out, temps) {
            (Some(out), Some((t_in, t_out))) if out > vpd_in => {
                if t_out <= t_in + 2.0 {
                    ClimateStrategy::IntakeAir
                } else {
                    ClimateStrategy::DehumidifyOnly
                }
            }
            _ => ClimateStrategy::HeatDehumidify,
        });
    }
    if diff > VPD_BAND {
        // Too dry: humid outside air helps if it is not too cold.
        return Some(match (inputs.vpd_out, temps) {
            (Some(out), Some((t_in, t_out))) if out < vpd_in => {
                if t_out >= t_in - 2.0 {
                    ClimateStrategy::IntakeAir
                } else {
                    ClimateStrategy::HumidifyOnly
                }
            }
            _ => ClimateStrategy::CoolHumidify,
        });
    }
    None
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClimateAction {
    Monitor,
    FineTune,
    IncreaseIntake,
    ReduceIntake,
    IncreaseExhaust,
    ReduceExhaust,
    MaximumIntake,
    IncreaseCirculation,
    IncreaseHumidifier,
    IncreaseDehumidifier,
    ReduceDehumidifier,
    IncreaseHeating,
    ReduceHeating,
}

/// One step of applying an action.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Switch { actuator: Actuator, on: bool },
    /// Variable-speed request. Fans are on/off only: above 50 % means on.
    Fan { actuator: Actuator, speed: u8 },
    /// No actuator for this; logged as a recommendation.
    Advise(&'static str),
}

impl Command {
    pub fn switch_state(self) -> Option<(Actuator, bool)> {
        match self {
            Self::Switch { actuator, on } => Some((actuator, on)),
            Self::Fan { actuator, speed } => Some((actuator, speed > 50)),
            Self::Advise(_) => None,
        }
    }
}

/// Expand an action into commands. `vpd` is the current inside VPD, used
/// only by `fine_tune`.
pub fn plan(action: ClimateAction, vpd: Option<f64>, target: f64) -> Vec<Command> {
    use ClimateAction::*;
    let fan = |actuator, speed| Command::Fan { actuator, speed };
    let on = |actuator| Command::Switch { actuator, on: true };

    match action {
        Monitor => vec![Command::Advise("monitoring, no change")],
        IncreaseIntake => vec![fan(Actuator::FanIntake, 80)],
        ReduceIntake => vec![fan(Actuator::FanIntake, 30)],
        IncreaseExhaust => vec![fan(Actuator::FanExhaust, 80)],
        ReduceExhaust => vec![fan(Actuator::FanExhaust, 40)],
        MaximumIntake => vec![fan(Actuator::FanIntake, 100)],
        IncreaseCirculation => vec![fan(Actuator::FanCirculation, 100)],
        IncreaseHumidifier => vec![on(Actuator::Humidifier)],
        IncreaseDehumidifier => vec![on(Actuator::Dehumidifier)],
        ReduceDehumidifier => vec![Command::Switch {
            actuator: Actuator::Dehumidifier,
            on: false,
        }],
        IncreaseHeating => vec![Command::Advise("heating increase recommended")],
        ReduceHeating => vec![Command::Advise("heating reduction recommended")],
        FineTune => match vpd {
            Some(v) if (v - target).abs() > VPD_FINE_BAND => {
                if v > target {
                    vec![on(Actuator::Humidifier)]
                } else {
                    vec![on(Actuator::Dehumidifier)]
                }
            }
            _ => Vec::new(),
        },
    }
}

pub fn ventilation_commands(mode: VentilationMode) -> [Command; 3] {
    let p = mode.preset();
    [
        Command::Fan {
            actuator: Actuator::FanIntake,
            speed: p.intake,
        },
        Command::Fan {
            actuator: Actuator::FanExhaust,
            speed: p.exhaust,
        },
        Command::Fan {
            actuator: Actuator::FanCirculation,
            speed: p.circulation,
        },
    ]
}

/// Send every command, even after a failure. Unwired actuators are skipped.
/// Returns the switch states actually applied, or the first failure.
pub fn execute(
    sink: &dyn ActuatorSink,
    commands: impl IntoIterator<Item = Command>,
) -> Result<Vec<(Actuator, bool)>, ActuatorError> {
    let mut applied = Vec::new();
    let mut first_err = None;

    for cmd in commands {
        if let Command::Advise(msg) = cmd {
            info!("climate: {msg}");
            continue;
        }
        let Some((actuator, on)) = cmd.switch_state() else {
            continue;
        };
        match sink.set(actuator, on) {
            Ok(()) => {
                if let Command::Fan { speed, .. } = cmd {
                    info!(%actuator, speed, on, "fan set");
                }
                applied.push((actuator, on));
            }
            Err(ActuatorError::NotWired(_)) => {
                debug!(%actuator, "not wired, skipping");
            }
            Err(e) => {
                error!(%actuator, error = %e, "climate command failed");
                first_err.get_or_insert(e);
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(applied),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
