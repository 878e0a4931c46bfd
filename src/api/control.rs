use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{
    api::{error::ApiError, response::ApiResponse},
    controller::{AppState, Controller, Permission},
};

#[derive(Debug, Deserialize)]
pub struct ControlQuery {
    pub controller: String,
}

/// GET /api/v1/control?controller=<name>
///
/// Manual requests also carry the EV scheduler's advisory, if any.
pub async fn can_act(
    State(state): State<AppState>,
    Query(q): Query<ControlQuery>,
) -> Result<Json<ApiResponse<Permission>>, ApiError> {
    let controller = Controller::from_str(q.controller.trim())
        .map_err(|_| ApiError::BadRequest(format!("unknown controller '{}'", q.controller)))?;
    let permission = state.registry.can_act(controller);
    let advisory = match controller {
        Controller::Manual => state.registry.check_ev_manual().reason,
        _ => None,
    };
    Ok(Json(ApiResponse::success(permission).with_warning(advisory)))
}

#[derive(Debug, Deserialize)]
pub struct OffgridRequest {
    pub active: bool,
}

#[derive(Debug, Serialize)]
pub struct ControlState {
    pub offgrid_active: bool,
    pub active: Option<Controller>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ev_strategy: Option<String>,
}

fn control_state(state: &AppState) -> ControlState {
    ControlState {
        offgrid_active: state.registry.offgrid_active(),
        active: state.registry.snapshot().active(),
        ev_strategy: state.registry.ev_strategy(),
    }
}

/// POST /api/v1/control/offgrid
pub async fn set_offgrid(
    State(state): State<AppState>,
    Json(request): Json<OffgridRequest>,
) -> Result<Json<ApiResponse<ControlState>>, ApiError> {
    state.registry.set_offgrid(request.active)?;
    Ok(Json(ApiResponse::success(control_state(&state))))
}

#[derive(Debug, Deserialize)]
pub struct EvStrategyRequest {
    pub strategy: Option<String>,
}

/// POST /api/v1/control/ev
pub async fn set_ev_strategy(
    State(state): State<AppState>,
    Json(request): Json<EvStrategyRequest>,
) -> Result<Json<ApiResponse<ControlState>>, ApiError> {
    let strategy = request.strategy.as_deref().map(str::trim).filter(|s| !s.is_empty());
    state.registry.set_ev_strategy(strategy)?;
    Ok(Json(ApiResponse::success(control_state(&state))))
}
