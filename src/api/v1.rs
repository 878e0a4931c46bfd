use axum::{
    routing::{get, post},
    Router,
};

use crate::controller::AppState;

use super::{control, health, optimize};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/optimizer", get(optimize::get_status))
        .route("/optimizer/enable", post(optimize::enable))
        .route("/optimizer/disable", post(optimize::disable))
        .route("/control", get(control::can_act))
        .route("/control/offgrid", post(control::set_offgrid))
        .route("/control/ev", post(control::set_ev_strategy))
        .route("/healthz", get(health::healthz))
        .with_state(state)
}
