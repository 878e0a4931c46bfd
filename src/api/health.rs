use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::controller::{AppState, TaskStatus};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    timestamp: chrono::DateTime<chrono::Utc>,
    checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    optimizer_loop: ComponentHealth,
}

/// Health status of a component
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    task: TaskStatus,
}

impl ComponentHealth {
    fn from_task(task: TaskStatus) -> Self {
        match &task.last_error {
            Some(e) => Self {
                status: "unhealthy".to_string(),
                error: Some(e.clone()),
                task,
            },
            None => Self {
                status: "healthy".to_string(),
                error: None,
                task,
            },
        }
    }
}

/// GET /api/v1/healthz
///
/// Degraded when the most recent optimizer run failed. Device reachability is
/// not checked here; the optimizer trace reports that.
pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let optimizer_loop = ComponentHealth::from_task(state.scheduler.get_optimizer_status().await);
    let healthy = optimizer_loop.status == "healthy";

    let response = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        timestamp: chrono::Utc::now(),
        checks: HealthChecks { optimizer_loop },
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_health_healthy() {
        let health = ComponentHealth::from_task(TaskStatus::default());
        assert_eq!(health.status, "healthy");
        assert!(health.error.is_none());
    }

    #[test]
    fn test_component_health_unhealthy() {
        let task = TaskStatus {
            last_error: Some("task panicked".to_string()),
            error_count: 1,
            ..TaskStatus::default()
        };
        let health = ComponentHealth::from_task(task);
        assert_eq!(health.status, "unhealthy");
        assert_eq!(health.error, Some("task panicked".to_string()));
    }
}
