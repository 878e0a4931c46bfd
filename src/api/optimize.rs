use axum::{extract::State, Json};
use serde::Deserialize;
use validator::{Validate, ValidationError};

use crate::{
    api::{error::ApiError, response::ApiResponse},
    controller::AppState,
    optimizer::{OptimizerParams, OptimizerStatus},
};

/// Body of `POST /optimizer/enable`
#[derive(Debug, Deserialize, Validate)]
#[validate(schema(function = "validate_window"))]
pub struct EnableRequest {
    #[validate(range(max = 23))]
    pub peak_start_hour: u32,
    #[validate(range(min = 1, max = 24))]
    pub peak_end_hour: u32,
    #[validate(range(max = 120))]
    pub buffer_minutes: u32,
    #[validate(range(min = 0.0, max = 50.0))]
    pub min_reserve_pct: f64,
}

fn validate_window(req: &EnableRequest) -> Result<(), ValidationError> {
    if req.peak_start_hour >= req.peak_end_hour {
        let mut err = ValidationError::new("peak_window");
        err.message = Some("peak_start_hour must be before peak_end_hour".into());
        return Err(err);
    }
    Ok(())
}

impl From<&EnableRequest> for OptimizerParams {
    fn from(req: &EnableRequest) -> Self {
        Self {
            peak_start_hour: req.peak_start_hour,
            peak_end_hour: req.peak_end_hour,
            buffer_minutes: req.buffer_minutes,
            min_reserve_pct: req.min_reserve_pct,
        }
    }
}

/// GET /api/v1/optimizer
pub async fn get_status(State(state): State<AppState>) -> Json<ApiResponse<OptimizerStatus>> {
    let snapshot = state.optimizer_status.read().clone();
    Json(ApiResponse::success(snapshot))
}

/// POST /api/v1/optimizer/enable
///
/// Refused with 409 while off-grid mode holds the device.
pub async fn enable(
    State(state): State<AppState>,
    Json(request): Json<EnableRequest>,
) -> Result<Json<ApiResponse<OptimizerStatus>>, ApiError> {
    request.validate()?;
    state.registry.check_optimizer_enable()?;

    let params = OptimizerParams::from(&request);
    tracing::info!(?params, "enable requested");
    // Waits for any in-flight tick; the machine has a single writer.
    state.optimizer.lock().await.enable(params, state.now()).await;

    let snapshot = state.optimizer_status.read().clone();
    Ok(Json(ApiResponse::success(snapshot)))
}

/// POST /api/v1/optimizer/disable
pub async fn disable(State(state): State<AppState>) -> Json<ApiResponse<OptimizerStatus>> {
    tracing::info!("disable requested");
    state.optimizer.lock().await.disable(state.now()).await;
    let snapshot = state.optimizer_status.read().clone();
    Json(ApiResponse::success(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn req(start: u32, end: u32, buffer: u32, reserve: f64) -> EnableRequest {
        EnableRequest {
            peak_start_hour: start,
            peak_end_hour: end,
            buffer_minutes: buffer,
            min_reserve_pct: reserve,
        }
    }

    #[rstest]
    #[case(req(17, 21, 15, 5.0), true)]
    #[case(req(0, 24, 0, 0.0), true)]
    #[case(req(21, 17, 15, 5.0), false)]
    #[case(req(17, 17, 15, 5.0), false)]
    #[case(req(24, 24, 15, 5.0), false)]
    #[case(req(17, 21, 121, 5.0), false)]
    #[case(req(17, 21, 15, 60.0), false)]
    fn test_enable_request_validation(#[case] request: EnableRequest, #[case] ok: bool) {
        assert_eq!(request.validate().is_ok(), ok);
    }
}
