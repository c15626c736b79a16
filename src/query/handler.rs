use crate::auth::bearer::TokenAuth;
use crate::error::{AppResult, LoggedJson};
use crate::query::filters::{FilterRequest, TraceSearchRequest};
use crate::query::planner::{self, QueryState};
use crate::types::{
    CustomersAndLabels, HealthResponse, TopicCounts, Trace, TraceCheck, TraceGroups,
    TraceWithSpans,
};
use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceIdsRequest {
    #[serde(default)]
    pub trace_ids: Vec<String>,
}

/// POST /api/projects/{project_id}/traces/search
pub async fn search_traces(
    State(state): State<Arc<QueryState>>,
    Extension(caller): Extension<TokenAuth>,
    Path(project_id): Path<String>,
    LoggedJson(request): LoggedJson<TraceSearchRequest>,
) -> AppResult<Json<TraceGroups>> {
    let groups = planner::get_all_for_project(&state, &caller, &project_id, request).await?;
    Ok(Json(groups))
}

/// GET /api/projects/{project_id}/traces/{trace_id}
pub async fn get_trace(
    State(state): State<Arc<QueryState>>,
    Extension(caller): Extension<TokenAuth>,
    Path((project_id, trace_id)): Path<(String, String)>,
) -> AppResult<Json<Trace>> {
    let trace = planner::get_trace(&state, &caller, &project_id, &trace_id).await?;
    Ok(Json(trace))
}

/// POST /api/projects/{project_id}/traces/spans
pub async fn traces_with_spans(
    State(state): State<Arc<QueryState>>,
    Extension(caller): Extension<TokenAuth>,
    Path(project_id): Path<String>,
    LoggedJson(request): LoggedJson<TraceIdsRequest>,
) -> AppResult<Json<Vec<TraceWithSpans>>> {
    let traces =
        planner::get_traces_with_spans(&state, &caller, &project_id, request.trace_ids).await?;
    Ok(Json(traces))
}

/// POST /api/projects/{project_id}/traces/checks
pub async fn trace_checks(
    State(state): State<Arc<QueryState>>,
    Extension(caller): Extension<TokenAuth>,
    Path(project_id): Path<String>,
    LoggedJson(request): LoggedJson<TraceIdsRequest>,
) -> AppResult<Json<HashMap<String, Vec<TraceCheck>>>> {
    let checks = planner::get_trace_checks(&state, &caller, &project_id, request.trace_ids).await?;
    Ok(Json(checks))
}

/// GET /api/projects/{project_id}/threads/{thread_id}
pub async fn thread(
    State(state): State<Arc<QueryState>>,
    Extension(caller): Extension<TokenAuth>,
    Path((project_id, thread_id)): Path<(String, String)>,
) -> AppResult<Json<Vec<Trace>>> {
    let traces = planner::get_thread(&state, &caller, &project_id, &thread_id).await?;
    Ok(Json(traces))
}

/// POST /api/projects/{project_id}/topics/counts
pub async fn topic_counts(
    State(state): State<Arc<QueryState>>,
    Extension(caller): Extension<TokenAuth>,
    Path(project_id): Path<String>,
    LoggedJson(request): LoggedJson<FilterRequest>,
) -> AppResult<Json<TopicCounts>> {
    let counts = planner::get_topic_counts(&state, &caller, &project_id, request).await?;
    Ok(Json(counts))
}

/// GET /api/projects/{project_id}/customers-and-labels
pub async fn customers_and_labels(
    State(state): State<Arc<QueryState>>,
    Extension(caller): Extension<TokenAuth>,
    Path(project_id): Path<String>,
) -> AppResult<Json<CustomersAndLabels>> {
    let result = planner::get_customers_and_labels(&state, &caller, &project_id).await?;
    Ok(Json(result))
}

/// GET /health
pub async fn health(State(state): State<Arc<QueryState>>) -> Json<HealthResponse> {
    let db_ok = match state.pool.get().await {
        Ok(conn) => matches!(
            conn.interact(|conn| conn.execute_batch("SELECT 1")).await,
            Ok(Ok(()))
        ),
        Err(_) => false,
    };

    Json(HealthResponse {
        status: if db_ok { "ok".into() } else { "degraded".into() },
        db_ok,
    })
}
