use axum::{extract::State, response::Json as ResponseJson};
use deployment::Deployment;
use serde::Serialize;
use ts_rs::TS;
use utils::response::ApiResponse;

use crate::DeploymentImpl;

#[derive(Debug, Serialize, TS)]
pub struct HealthStatus {
    pub status: String,
    pub active_executions: usize,
    pub observed_tasks: usize,
}

pub async fn health_check(
    State(deployment): State<DeploymentImpl>,
) -> ResponseJson<ApiResponse<HealthStatus>> {
    ResponseJson(ApiResponse::success(HealthStatus {
        status: "ok".to_string(),
        active_executions: deployment.dispatcher().execution_count(),
        observed_tasks: deployment.progress_bus().topic_count(),
    }))
}
