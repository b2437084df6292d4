//! Timed irrigation sequences: single shots and multi-shot saturation.
//!
//! Every shot switches the pump on under a [`PumpGuard`]. The guard sends
//! "off" exactly once: explicitly when the shot finishes, or from `Drop` if
//! the shot future is cancelled or unwinds. A failed "off" is a pump safety
//! fault, recorded in engine state and surfaced as its own error.

use serde::Deserialize;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::actuator::{Actuator, ActuatorError, ActuatorSink};
use crate::error::{EngineError, EngineResult};
use crate::state::SharedState;

pub const SHOT_SIZE_PERCENT: RangeInclusive<f64> = 1.0..=10.0;
pub const SHOT_DURATION_SEC: RangeInclusive<u64> = 5..=300;
pub const SATURATION_SHOTS: RangeInclusive<u32> = 1..=4;
pub const SATURATION_INTERVAL_MIN: RangeInclusive<u64> = 1..=1440;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ShotRequest {
    pub size_percent: f64,
    pub duration_sec: u64,
}

impl Default for ShotRequest {
    fn default() -> Self {
        Self {
            size_percent: 3.0,
            duration_sec: 30,
        }
    }
}

impl ShotRequest {
    pub fn validate(&self) -> EngineResult<()> {
        check_size(self.size_percent)?;
        if !SHOT_DURATION_SEC.contains(&self.duration_sec) {
            return Err(EngineError::InvalidArgument(format!(
                "shot duration {}s outside {}-{}s",
                self.duration_sec,
                SHOT_DURATION_SEC.start(),
                SHOT_DURATION_SEC.end()
            )));
        }
        Ok(())
    }

    /// Water delivered into a substrate of `substrate_l` litres.
    pub fn litres(&self, substrate_l: f64) -> f64 {
        self.size_percent / 100.0 * substrate_l
    }
}

fn check_size(size_percent: f64) -> EngineResult<()> {
    if !SHOT_SIZE_PERCENT.contains(&size_percent) {
        return Err(EngineError::InvalidArgument(format!(
            "shot size {size_percent}% outside {}-{}%",
            SHOT_SIZE_PERCENT.start(),
            SHOT_SIZE_PERCENT.end()
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShotPreset {
    Small,
    Medium,
    Large,
}

impl ShotPreset {
    pub fn request(self) -> ShotRequest {
        let (size_percent, duration_sec) = match self {
            Self::Small => (2.0, 20),
            Self::Medium => (3.0, 30),
            Self::Large => (5.0, 50),
        };
        ShotRequest {
            size_percent,
            duration_sec,
        }
    }
}

impl FromStr for ShotPreset {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            _ => Err(EngineError::invalid("shot preset", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct SaturationRequest {
    pub shots: u32,
    pub size_percent: f64,
    pub interval_min: u64,
}

impl Default for SaturationRequest {
    fn default() -> Self {
        Self {
            shots: 3,
            size_percent: 4.0,
            interval_min: 20,
        }
    }
}

impl SaturationRequest {
    pub fn validate(&self) -> EngineResult<()> {
        if !SATURATION_SHOTS.contains(&self.shots) {
            return Err(EngineError::InvalidArgument(format!(
                "saturation shots {} outside {}-{}",
                self.shots,
                SATURATION_SHOTS.start(),
                SATURATION_SHOTS.end()
            )));
        }
        if !SATURATION_INTERVAL_MIN.contains(&self.interval_min) {
            return Err(EngineError::InvalidArgument(format!(
                "saturation interval {} min outside {}-{} min",
                self.interval_min,
                SATURATION_INTERVAL_MIN.start(),
                SATURATION_INTERVAL_MIN.end()
            )));
        }
        check_size(self.size_percent)
    }

    /// 30 s per 3 % of substrate, rounded down. Call after `validate`.
    pub fn shot(&self) -> ShotRequest {
        ShotRequest {
            size_percent: self.size_percent,
            duration_sec: (30.0 * (self.size_percent / 3.0)).floor() as u64,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_min.saturating_mul(60))
    }
}

impl fmt::Display for SaturationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} x {}% every {} min",
            self.shots, self.size_percent, self.interval_min
        )
    }
}

// ---------------------------------------------------------------------------
// Emergency stop signal
// ---------------------------------------------------------------------------

/// Monotonic stop counter. A sequence remembers the epoch it started in and
/// aborts once the counter moves.
#[derive(Default)]
pub struct StopSignal {
    epoch: AtomicU64,
    notify: Notify,
}

impl StopSignal {
    pub fn trigger(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn fired_since(&self, epoch: u64) -> bool {
        self.epoch() != epoch
    }

    /// Sleep for `dur`, returning early if a stop arrives. True when stopped.
    async fn sleep_unless_stopped(&self, epoch: u64, dur: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.fired_since(epoch) {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(dur) => self.fired_since(epoch),
            _ = notified => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Pump guard
// ---------------------------------------------------------------------------

pub(crate) struct PumpGuard<'a> {
    sink: &'a dyn ActuatorSink,
    state: &'a SharedState,
    armed: bool,
}

impl<'a> PumpGuard<'a> {
    pub(crate) fn arm(sink: &'a dyn ActuatorSink, state: &'a SharedState) -> Self {
        Self {
            sink,
            state,
            armed: true,
        }
    }

    /// Send the pump-off now and hand back the outcome.
    pub(crate) fn release(mut self) -> Result<(), ActuatorError> {
        self.armed = false;
        self.sink.set(Actuator::Pump, false)
    }
}

impl Drop for PumpGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("irrigation interrupted, forcing pump off");
        if let Err(e) = self.sink.set(Actuator::Pump, false) {
            error!(error = %e, "PUMP SAFETY FAULT: pump-off failed after interruption");
            // Best effort; the engine lock may be held elsewhere.
            if let Ok(mut st) = self.state.try_write() {
                st.record_pump_fault(format!("pump-off failed after interruption: {e}"));
            }
        }
    }
}

pub(crate) async fn escalate_pump_fault(state: &SharedState, source: ActuatorError) -> EngineError {
    error!(error = %source, "PUMP SAFETY FAULT: pump may still be running");
    state
        .write()
        .await
        .record_pump_fault(format!("pump-off failed: {source}"));
    EngineError::PumpSafety {
        actuator: Actuator::Pump,
        source,
    }
}

// ---------------------------------------------------------------------------
// Sequences
// ---------------------------------------------------------------------------

/// Pump on, wait, pump off, book the water. Caller holds the irrigation lock.
pub(crate) async fn run_shot(
    sink: &dyn ActuatorSink,
    state: &SharedState,
    req: ShotRequest,
) -> EngineResult<()> {
    req.validate()?;
    let substrate_l = state.read().await.growth.substrate_size_l;

    info!(
        size_percent = req.size_percent,
        duration_sec = req.duration_sec,
        "irrigation shot starting"
    );

    let guard = PumpGuard::arm(sink, state);
    if let Err(e) = sink.set(Actuator::Pump, true) {
        error!(error = %e, "pump-on failed");
        if let Err(off) = guard.release() {
            return Err(escalate_pump_fault(state, off).await);
        }
        state
            .write()
            .await
            .record_error(format!("shot aborted, pump-on failed: {e}"));
        return Err(e.into());
    }
    state.write().await.record_actuator(Actuator::Pump, true);
    let started_at = OffsetDateTime::now_utc();
    let started = tokio::time::Instant::now();

    tokio::time::sleep(Duration::from_secs(req.duration_sec)).await;

    if let Err(e) = guard.release() {
        return Err(escalate_pump_fault(state, e).await);
    }

    let litres = req.litres(substrate_l);
    {
        let mut st = state.write().await;
        st.record_actuator(Actuator::Pump, false);
        st.record_shot(req.size_percent, litres, started_at + started.elapsed());
    }
    info!(litres, "irrigation shot complete");
    Ok(())
}

/// Run `req.shots` shots spaced `req.interval()` apart. Stops on the first
/// failed shot or when `stop` fires. Returns the number of shots delivered.
pub(crate) async fn run_saturation(
    sink: &dyn ActuatorSink,
    state: &SharedState,
    stop: &StopSignal,
    req: SaturationRequest,
) -> EngineResult<u32> {
    req.validate()?;
    let epoch = stop.epoch();
    let shot = req.shot();

    info!(
        shots = req.shots,
        size_percent = req.size_percent,
        interval_min = req.interval_min,
        shot_sec = shot.duration_sec,
        "saturation sequence starting"
    );
    state
        .write()
        .await
        .record_irrigation(format!("saturation started: {req}"));

    for i in 0..req.shots {
        let stopped = if i == 0 {
            stop.fired_since(epoch)
        } else {
            stop.sleep_unless_stopped(epoch, req.interval()).await
        };
        if stopped {
            warn!(completed = i, requested = req.shots, "saturation aborted by stop");
            state.write().await.record_irrigation(format!(
                "saturation aborted after {i} of {} shots",
                req.shots
            ));
            return Err(EngineError::Aborted {
                completed: i,
                requested: req.shots,
            });
        }

        info!(shot = i + 1, of = req.shots, "saturation shot");
        run_shot(sink, state, shot).await?;
    }

    state
        .write()
        .await
        .record_irrigation(format!("saturation complete: {} shots", req.shots));
    Ok(req.shots)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::testing::RecordingSink;
    use crate::state::{EngineState, EventKind, GrowthConfig};
    use std::sync::Arc;

    fn state_with_substrate(litres: f64) -> SharedState {
        EngineState::shared(GrowthConfig {
            substrate_size_l: litres,
            ..GrowthConfig::default()
        })
    }

    // -- validation -----------------------------------------------------------

    #[test]
    fn shot_validation_bounds() {
        assert!(ShotRequest::default().validate().is_ok());
        for (size, dur) in [(0.5, 30), (10.5, 30), (3.0, 4), (3.0, 301)] {
            let req = ShotRequest {
                size_percent: size,
                duration_sec: dur,
            };
            assert!(
                matches!(req.validate(), Err(EngineError::InvalidArgument(_))),
                "{req:?}"
            );
        }
    }

    #[test]
    fn saturation_shot_duration_is_floored() {
        let req = SaturationRequest::default();
        assert_eq!(req.shot().duration_sec, 40);
        let req = SaturationRequest {
            size_percent: 2.5,
            ..req
        };
        assert_eq!(req.shot().duration_sec, 25);
        let req = SaturationRequest {
            size_percent: 1.25,
            ..req
        };
        assert_eq!(req.shot().duration_sec, 12);
    }

    #[test]
    fn saturation_duration_matches_size_thirds() {
        for (size, secs) in [(1.2, 11), (2.4, 23), (3.3, 32), (9.6, 95)] {
            let req = SaturationRequest {
                size_percent: size,
                ..SaturationRequest::default()
            };
            assert_eq!(req.shot().duration_sec, secs, "size {size}");
        }
    }

    #[test]
    fn saturation_validation_bounds() {
        assert!(SaturationRequest::default().validate().is_ok());
        for (shots, interval_min) in [(0, 20), (5, 20), (3, 0), (3, 1441), (2, u64::MAX)] {
            let req = SaturationRequest {
                shots,
                interval_min,
                ..SaturationRequest::default()
            };
            assert!(
                matches!(req.validate(), Err(EngineError::InvalidArgument(_))),
                "{req:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_interval_is_rejected_before_any_shot() {
        let sink = RecordingSink::default();
        let state = state_with_substrate(10.0);
        let stop = StopSignal::default();
        let req = SaturationRequest {
            shots: 2,
            size_percent: 3.0,
            interval_min: u64::MAX,
        };

        let err = run_saturation(&sink, &state, &stop, req).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)), "{err}");
        assert!(sink.commands().is_empty());
    }

    #[test]
    fn presets() {
        assert_eq!(
            "large".parse::<ShotPreset>().unwrap().request(),
            ShotRequest {
                size_percent: 5.0,
                duration_sec: 50
            }
        );
        assert_eq!(ShotPreset::Medium.request(), ShotRequest::default());
        assert!("huge".parse::<ShotPreset>().is_err());
    }

    // -- single shot ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn shot_books_water_and_cycles_pump_once() {
        let sink = RecordingSink::default();
        let state = state_with_substrate(10.0);
        let t0 = tokio::time::Instant::now();

        run_shot(&sink, &state, ShotRequest::default()).await.unwrap();

        let pump = sink.commands_for(Actuator::Pump);
        assert_eq!(pump.len(), 2);
        assert!(pump[0].on && !pump[1].on);
        assert_eq!(pump[0].at, t0);
        assert_eq!(pump[1].at - pump[0].at, Duration::from_secs(30));

        let st = state.read().await;
        assert!((st.irrigation.daily_water_total_l - 0.3).abs() < 1e-9);
        assert!(st.irrigation.last_irrigation.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn shot_is_booked_at_completion_after_pump_off() {
        let sink = Arc::new(RecordingSink::default());
        let state = state_with_substrate(10.0);
        let wall_start = OffsetDateTime::now_utc();

        let task = {
            let (sink, state) = (sink.clone(), state.clone());
            tokio::spawn(async move { run_shot(&*sink, &state, ShotRequest::default()).await })
        };

        // Mid-shot: pump running, nothing booked yet.
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(sink.last_state(Actuator::Pump), Some(true));
        {
            let st = state.read().await;
            assert!(st.irrigation.last_irrigation.is_none());
            assert_eq!(st.irrigation.daily_water_total_l, 0.0);
        }

        task.await.unwrap().unwrap();

        let st = state.read().await;
        let booked = st.irrigation.last_irrigation.unwrap();
        assert!(booked >= wall_start + Duration::from_secs(30));
        assert!(booked < wall_start + Duration::from_secs(35));

        // Pump-off is recorded before the shot itself.
        let kinds: Vec<_> = st.events.iter().map(|e| e.kind).collect();
        let off = st
            .events
            .iter()
            .position(|e| e.kind == EventKind::Actuator && e.detail.ends_with("OFF"))
            .unwrap();
        let shot = kinds.iter().position(|k| *k == EventKind::Irrigation).unwrap();
        assert!(off < shot);
    }

    #[tokio::test(start_paused = true)]
    async fn shot_rejects_invalid_request_without_touching_pump() {
        let sink = RecordingSink::default();
        let state = state_with_substrate(10.0);
        let req = ShotRequest {
            size_percent: 12.0,
            duration_sec: 30,
        };
        assert!(run_shot(&sink, &state, req).await.is_err());
        assert!(sink.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_pump_on_still_sends_off_and_books_nothing() {
        let sink = RecordingSink::default();
        sink.fail(Actuator::Pump, true);
        let state = state_with_substrate(10.0);

        let err = run_shot(&sink, &state, ShotRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Actuator(_)), "{err}");
        assert_eq!(sink.commands(), vec![(Actuator::Pump, false)]);
        assert_eq!(state.read().await.irrigation.daily_water_total_l, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_pump_off_is_a_safety_fault() {
        let sink = RecordingSink::default();
        sink.fail(Actuator::Pump, false);
        let state = state_with_substrate(10.0);

        let err = run_shot(&sink, &state, ShotRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PumpSafety { .. }), "{err}");

        let st = state.read().await;
        assert!(st.irrigation.safety_fault.is_some());
        assert!(st.events.iter().any(|e| e.kind == EventKind::Safety));
        assert_eq!(st.irrigation.daily_water_total_l, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_shot_still_turns_pump_off() {
        let sink = Arc::new(RecordingSink::default());
        let state = state_with_substrate(10.0);

        let task = {
            let sink = sink.clone();
            let state = state.clone();
            tokio::spawn(async move {
                run_shot(&*sink, &state, ShotRequest::default()).await
            })
        };
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.last_state(Actuator::Pump), Some(true));

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert_eq!(
            sink.commands(),
            vec![(Actuator::Pump, true), (Actuator::Pump, false)]
        );
        assert_eq!(state.read().await.irrigation.daily_water_total_l, 0.0);
    }

    // -- saturation -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn saturation_spaces_shots_by_interval() {
        let sink = RecordingSink::default();
        let state = state_with_substrate(10.0);
        let stop = StopSignal::default();

        let done = run_saturation(&sink, &state, &stop, SaturationRequest::default())
            .await
            .unwrap();
        assert_eq!(done, 3);

        let pump = sink.commands_for(Actuator::Pump);
        assert_eq!(pump.len(), 6);
        let shot = Duration::from_secs(40);
        let gap = Duration::from_secs(20 * 60);
        for i in 0..3 {
            let (on, off) = (pump[2 * i], pump[2 * i + 1]);
            assert!(on.on && !off.on);
            assert_eq!(off.at - on.at, shot);
            if i > 0 {
                assert_eq!(on.at - pump[2 * i - 1].at, gap);
            }
        }

        let total = state.read().await.irrigation.daily_water_total_l;
        assert!((total - 1.2).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_wait_aborts_remaining_shots() {
        let sink = Arc::new(RecordingSink::default());
        let state = state_with_substrate(10.0);
        let stop = Arc::new(StopSignal::default());

        let task = {
            let (sink, state, stop) = (sink.clone(), state.clone(), stop.clone());
            tokio::spawn(async move {
                run_saturation(&*sink, &state, &stop, SaturationRequest::default()).await
            })
        };

        // First shot (40 s) done, waiting for the second.
        tokio::time::sleep(Duration::from_secs(5 * 60)).await;
        stop.trigger();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            EngineError::Aborted {
                completed: 1,
                requested: 3
            }
        ));
        assert_eq!(sink.commands_for(Actuator::Pump).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_shot_aborts_the_sequence() {
        let sink = RecordingSink::default();
        sink.fail(Actuator::Pump, true);
        let state = state_with_substrate(10.0);
        let stop = StopSignal::default();

        let err = run_saturation(&sink, &state, &stop, SaturationRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Actuator(_)));
        assert_eq!(sink.commands(), vec![(Actuator::Pump, false)]);
    }
}
