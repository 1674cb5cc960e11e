use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::models::research_task::{
    CreateResearchTask, ReportType, ResearchStatus, ResearchTask, ResearchTaskFilter,
    ResearchTaskView,
};
use deployment::Deployment;
use serde::{Deserialize, Serialize};
use services::services::estimate::{CostEstimate, estimate};
use ts_rs::TS;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError, routes::research_ws};

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct ListResearchQuery {
    pub status: Option<ResearchStatus>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

impl ListResearchQuery {
    fn into_filter(self) -> Result<ResearchTaskFilter, ApiError> {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(ApiError::BadRequest(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        let offset = self.offset.unwrap_or(0);
        if offset < 0 {
            return Err(ApiError::BadRequest(
                "offset must not be negative".to_string(),
            ));
        }

        Ok(ResearchTaskFilter {
            status: self.status,
            offset,
            limit,
        })
    }
}

#[derive(Debug, Deserialize, TS)]
pub struct EstimateRequest {
    pub query: String,
    #[serde(default)]
    pub report_type: ReportType,
}

#[derive(Debug, Serialize, Deserialize, TS)]
pub struct ObserverCount {
    pub task_id: Uuid,
    pub observers: usize,
}

pub async fn create_research(
    State(deployment): State<DeploymentImpl>,
    Json(payload): Json<CreateResearchTask>,
) -> Result<(StatusCode, ResponseJson<ApiResponse<ResearchTaskView>>), ApiError> {
    let task = deployment.dispatcher().submit(payload).await?;
    Ok((
        StatusCode::CREATED,
        ResponseJson(ApiResponse::success(task.into())),
    ))
}

pub async fn list_research(
    State(deployment): State<DeploymentImpl>,
    Query(query): Query<ListResearchQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<ResearchTaskView>>>, ApiError> {
    let filter = query.into_filter()?;
    let tasks = ResearchTask::list(&deployment.db().pool, &filter).await?;

    Ok(ResponseJson(ApiResponse::success(
        tasks.into_iter().map(ResearchTaskView::from).collect(),
    )))
}

pub async fn get_research(
    State(deployment): State<DeploymentImpl>,
    Path(task_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<ResearchTaskView>>, ApiError> {
    let task = ResearchTask::find_by_id(&deployment.db().pool, task_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Research task not found".to_string()))?;

    Ok(ResponseJson(ApiResponse::success(task.into())))
}

pub async fn cancel_research(
    State(deployment): State<DeploymentImpl>,
    Path(task_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<ResearchTaskView>>, ApiError> {
    let task = deployment.dispatcher().cancel(task_id).await?;
    Ok(ResponseJson(ApiResponse::success(task.into())))
}

pub async fn pause_research(
    State(deployment): State<DeploymentImpl>,
    Path(task_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<ResearchTaskView>>, ApiError> {
    let task = deployment.dispatcher().pause(task_id).await?;
    Ok(ResponseJson(ApiResponse::success(task.into())))
}

pub async fn resume_research(
    State(deployment): State<DeploymentImpl>,
    Path(task_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<ResearchTaskView>>, ApiError> {
    let task = deployment.dispatcher().resume(task_id).await?;
    Ok(ResponseJson(ApiResponse::success(task.into())))
}

pub async fn get_observer_count(
    State(deployment): State<DeploymentImpl>,
    Path(task_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<ObserverCount>>, ApiError> {
    if ResearchTask::find_by_id(&deployment.db().pool, task_id)
        .await?
        .is_none()
    {
        return Err(ApiError::NotFound("Research task not found".to_string()));
    }

    Ok(ResponseJson(ApiResponse::success(ObserverCount {
        task_id,
        observers: deployment.progress_bus().count(task_id),
    })))
}

pub async fn estimate_research(
    Json(payload): Json<EstimateRequest>,
) -> Result<ResponseJson<ApiResponse<CostEstimate>>, ApiError> {
    if payload.query.trim().is_empty() {
        return Err(ApiError::BadRequest("query must not be empty".to_string()));
    }

    Ok(ResponseJson(ApiResponse::success(estimate(
        payload.report_type,
        &payload.query,
    ))))
}

pub fn router(_deployment: &DeploymentImpl) -> Router<DeploymentImpl> {
    let task_id_router = Router::new()
        .route("/", get(get_research))
        .route("/cancel", post(cancel_research))
        .route("/pause", post(pause_research))
        .route("/resume", post(resume_research))
        .route("/observers", get(get_observer_count))
        .route("/ws", get(research_ws::research_ws));

    let inner = Router::new()
        .route("/", get(list_research).post(create_research))
        .route("/estimate", post(estimate_research))
        .nest("/{task_id}", task_id_router);

    Router::new().nest("/research", inner)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use db::DBService;
    use serde_json::{Value, json};
    use services::services::{
        config::Config,
        research_engine::{EngineOutput, ScriptedEngine},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::routes::app;

    struct TestApp {
        router: Router,
        engine: Arc<ScriptedEngine>,
    }

    async fn test_app() -> TestApp {
        let db = DBService::new_in_memory().await.unwrap();
        let engine = Arc::new(ScriptedEngine::new());
        let deployment = DeploymentImpl::from_parts(Config::default(), db, engine.clone());
        TestApp {
            router: app(deployment),
            engine,
        }
    }

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn http_get(router: &Router, uri: &str) -> (StatusCode, Value) {
        send(router, "GET", uri, None).await
    }

    async fn http_post(router: &Router, uri: &str) -> (StatusCode, Value) {
        send(router, "POST", uri, None).await
    }

    async fn create(router: &Router, query: &str) -> Uuid {
        let body = json!({ "query": query });
        let (status, body) = send(router, "POST", "/api/research", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
        body["data"]["id"].as_str().unwrap().parse().unwrap()
    }

    async fn wait_for_status(router: &Router, task_id: Uuid, status: &str) -> Value {
        for _ in 0..200 {
            let (_, body) = http_get(router, &format!("/api/research/{task_id}")).await;
            if body["data"]["status"] == status {
                return body["data"].clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never reached {status}");
    }

    #[tokio::test]
    async fn create_returns_pending_task_with_defaults() {
        let app = test_app().await;
        let (status, body) = send(
            &app.router,
            "POST",
            "/api/research",
            Some(json!({ "query": "state of solid-state batteries" })),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["success"], true);
        let task = &body["data"];
        assert_eq!(task["status"], "pending");
        assert_eq!(task["report_type"], "research_report");
        assert_eq!(task["completed_queries"], 0);
        assert_eq!(task["total_queries"], 0);
        assert_eq!(task["progress_percentage"], 0.0);
    }

    #[tokio::test]
    async fn create_rejects_invalid_parameters() {
        let app = test_app().await;
        let blank = json!({ "query": "  " });
        let (status, body) = send(&app.router, "POST", "/api/research", Some(blank)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = send(
            &app.router,
            "POST",
            "/api/research",
            Some(json!({ "query": "valid query", "max_subtopics": 50 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let app = test_app().await;
        let missing = Uuid::new_v4();

        let (status, body) = http_get(&app.router, &format!("/api/research/{missing}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "Research task not found");

        let (status, _) = http_post(&app.router, &format!("/api/research/{missing}/cancel")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) =
            http_get(&app.router, &format!("/api/research/{missing}/observers")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_validates_pagination() {
        let app = test_app().await;
        for uri in [
            "/api/research?limit=0",
            "/api/research?limit=101",
            "/api/research?offset=-1",
        ] {
            let (status, _) = http_get(&app.router, uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        }
    }

    #[tokio::test]
    async fn list_filters_by_status_newest_first() {
        let app = test_app().await;
        let first = create(&app.router, "first research query").await;
        let second = create(&app.router, "second research query").await;

        let (status, _) = http_post(&app.router, &format!("/api/research/{first}/cancel")).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = http_get(&app.router, "/api/research").await;
        let ids: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec![second.to_string(), first.to_string()]);

        let (_, body) = http_get(&app.router, "/api/research?status=cancelled").await;
        let tasks = body["data"].as_array().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["id"], first.to_string());
        assert_eq!(tasks[0]["error_message"], "cancelled by user");

        let (_, body) = http_get(&app.router, "/api/research?limit=1&offset=1").await;
        assert_eq!(body["data"][0]["id"], first.to_string());
    }

    #[tokio::test]
    async fn cancelling_a_completed_task_conflicts() {
        let app = test_app().await;
        let task_id = create(&app.router, "quick research query").await;

        let run = app.engine.next_run().await;
        run.complete(EngineOutput {
            report: "R".to_string(),
            total_cost: 0.05,
            ..Default::default()
        });
        let task = wait_for_status(&app.router, task_id, "completed").await;
        assert_eq!(task["report"], "R");

        let (status, body) =
            http_post(&app.router, &format!("/api/research/{task_id}/cancel")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);

        let (status, _) = http_post(&app.router, &format!("/api/research/{task_id}/pause")).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn pause_and_resume_round_trip() {
        let app = test_app().await;
        let task_id = create(&app.router, "pausable research query").await;
        let _run = app.engine.next_run().await;
        wait_for_status(&app.router, task_id, "running").await;

        let (status, body) =
            http_post(&app.router, &format!("/api/research/{task_id}/pause")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "paused");

        let (status, _) = http_post(&app.router, &format!("/api/research/{task_id}/pause")).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) =
            http_post(&app.router, &format!("/api/research/{task_id}/resume")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "running");
    }

    #[tokio::test]
    async fn estimate_scales_with_report_type() {
        let app = test_app().await;
        let (status, body) = send(
            &app.router,
            "POST",
            "/api/research/estimate",
            Some(json!({ "query": "history of the transistor", "report_type": "deep" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["estimated_cost"], 0.4);
        assert_eq!(body["data"]["estimated_time_minutes"], 8);
        assert_eq!(body["data"]["estimated_queries"], 75);

        let (status, _) = send(
            &app.router,
            "POST",
            "/api/research/estimate",
            Some(json!({ "query": "" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn observers_and_health_report_live_counts() {
        let app = test_app().await;
        let task_id = create(&app.router, "observed research query").await;

        let (status, body) =
            http_get(&app.router, &format!("/api/research/{task_id}/observers")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["observers"], 0);

        let (status, body) = http_get(&app.router, "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ok");
        assert_eq!(body["data"]["observed_tasks"], 0);
    }
}
