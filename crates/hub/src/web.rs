use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::coordinator::Coordinator;
use crate::error::EngineError;
use crate::irrigation::{SaturationRequest, ShotPreset, ShotRequest};

type AppState = Arc<Coordinator>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(coordinator: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/snapshot", get(api_snapshot))
        .route("/api/irrigation/shot", post(irrigation_shot))
        .route("/api/irrigation/saturation", post(irrigation_saturation))
        .route("/api/irrigation/phase", post(irrigation_phase))
        .route("/api/irrigation/reset", post(irrigation_reset))
        .route("/api/irrigation/automation", post(irrigation_automation))
        .route("/api/emergency-stop", post(emergency_stop))
        .route("/api/growth/phase", post(growth_phase))
        .route("/api/growth/steering", post(growth_steering))
        .route("/api/growth/substrate", post(growth_substrate))
        .route("/api/climate/strategy", post(climate_strategy))
        .route("/api/climate/ventilation", post(climate_ventilation))
        .route("/api/climate/optimize-vpd", post(climate_optimize_vpd))
        .with_state(coordinator)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::InvalidSelection { .. } | EngineError::InvalidArgument(_) => {
                StatusCode::BAD_REQUEST
            }
            EngineError::Busy | EngineError::Aborted { .. } => StatusCode::CONFLICT,
            EngineError::UnavailableInput(_) | EngineError::Source(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            EngineError::Actuator(_) => StatusCode::BAD_GATEWAY,
            EngineError::PumpSafety { .. }
            | EngineError::Derivation(_)
            | EngineError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

fn ok(detail: serde_json::Value) -> ApiResult {
    Ok(Json(json!({ "ok": true, "result": detail })))
}

// ---------------------------------------------------------------------------
// Read-only
// ---------------------------------------------------------------------------

async fn api_status(State(coord): State<AppState>) -> impl IntoResponse {
    Json(coord.status().await)
}

async fn api_snapshot(State(coord): State<AppState>) -> Response {
    match coord.snapshot() {
        Some(snapshot) => Json(&*snapshot).into_response(),
        None => ApiError(EngineError::UnavailableInput("snapshot")).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Irrigation
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ShotBody {
    preset: Option<ShotPreset>,
    size_percent: Option<f64>,
    duration_sec: Option<u64>,
}

impl ShotBody {
    fn request(&self) -> ShotRequest {
        let base = self.preset.map(ShotPreset::request).unwrap_or_default();
        ShotRequest {
            size_percent: self.size_percent.unwrap_or(base.size_percent),
            duration_sec: self.duration_sec.unwrap_or(base.duration_sec),
        }
    }
}

async fn irrigation_shot(State(coord): State<AppState>, Json(body): Json<ShotBody>) -> ApiResult {
    let req = body.request();
    coord.trigger_shot(req).await?;
    ok(json!({ "size_percent": req.size_percent, "duration_sec": req.duration_sec }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SaturationBody {
    shots: Option<u32>,
    size_percent: Option<f64>,
    interval_min: Option<u64>,
}

async fn irrigation_saturation(
    State(coord): State<AppState>,
    Json(body): Json<SaturationBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let base = SaturationRequest::default();
    let req = SaturationRequest {
        shots: body.shots.unwrap_or(base.shots),
        size_percent: body.size_percent.unwrap_or(base.size_percent),
        interval_min: body.interval_min.unwrap_or(base.interval_min),
    };
    // The sequence runs on; its outcome lands in the event log.
    let _handle = coord.spawn_saturation(req)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "ok": true, "result": { "started": req.to_string() } })),
    ))
}

#[derive(Deserialize)]
struct PhaseBody {
    phase: String,
}

async fn irrigation_phase(State(coord): State<AppState>, Json(body): Json<PhaseBody>) -> ApiResult {
    let phase = coord.set_irrigation_phase(&body.phase).await?;
    ok(json!({ "phase": phase, "name": phase.name() }))
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct ResetBody {
    water: bool,
    vwc: bool,
}

async fn irrigation_reset(State(coord): State<AppState>, Json(body): Json<ResetBody>) -> ApiResult {
    coord.reset_counters(body.water, body.vwc).await;
    ok(json!({ "water": body.water, "vwc": body.vwc }))
}

#[derive(Deserialize)]
struct AutomationBody {
    enabled: bool,
}

async fn irrigation_automation(
    State(coord): State<AppState>,
    Json(body): Json<AutomationBody>,
) -> ApiResult {
    coord.set_automation_enabled(body.enabled).await;
    ok(json!({ "enabled": body.enabled }))
}

async fn emergency_stop(State(coord): State<AppState>) -> ApiResult {
    coord.emergency_stop().await?;
    ok(json!({ "pump": "off", "automation_enabled": false }))
}

// ---------------------------------------------------------------------------
// Growth
// ---------------------------------------------------------------------------

async fn growth_phase(State(coord): State<AppState>, Json(body): Json<PhaseBody>) -> ApiResult {
    let phase = coord.set_growth_phase(&body.phase).await?;
    ok(json!({ "phase": phase }))
}

#[derive(Deserialize)]
struct SteeringBody {
    steering: String,
}

async fn growth_steering(
    State(coord): State<AppState>,
    Json(body): Json<SteeringBody>,
) -> ApiResult {
    let steering = coord.set_crop_steering(&body.steering).await?;
    ok(json!({ "steering": steering }))
}

#[derive(Deserialize)]
struct SubstrateBody {
    litres: f64,
}

async fn growth_substrate(
    State(coord): State<AppState>,
    Json(body): Json<SubstrateBody>,
) -> ApiResult {
    coord.set_substrate_size(body.litres).await?;
    ok(json!({ "litres": body.litres }))
}

// ---------------------------------------------------------------------------
// Climate
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct StrategyBody {
    #[serde(default = "auto")]
    strategy: String,
}

fn auto() -> String {
    "auto".into()
}

async fn climate_strategy(
    State(coord): State<AppState>,
    Json(body): Json<StrategyBody>,
) -> ApiResult {
    let strategy = coord.apply_climate_strategy(&body.strategy).await?;
    ok(json!({ "strategy": strategy }))
}

#[derive(Deserialize)]
struct VentilationBody {
    mode: String,
}

async fn climate_ventilation(
    State(coord): State<AppState>,
    Json(body): Json<VentilationBody>,
) -> ApiResult {
    let mode = coord.set_ventilation_mode(&body.mode).await?;
    ok(json!({ "mode": mode, "preset": mode.preset() }))
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct OptimizeBody {
    target: Option<f64>,
}

async fn climate_optimize_vpd(
    State(coord): State<AppState>,
    Json(body): Json<OptimizeBody>,
) -> ApiResult {
    let applied = coord.optimize_vpd(body.target).await?;
    ok(json!({ "applied": applied }))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(coordinator: AppState) -> anyhow::Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "http api listening");

    axum::serve(listener, router(coordinator))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
