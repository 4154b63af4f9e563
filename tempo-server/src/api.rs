//! Operational HTTP surface over a running engine.
//!
//! | route                             | operation                  |
//! |-----------------------------------|----------------------------|
//! | `POST /v1/triggers/{id}/run`      | manual execution           |
//! | `POST /v1/triggers/{id}/signal`   | event-driven firing        |
//! | `POST /v1/jobs/{id}/cancel`       | cancel a job               |
//! | `GET  /v1/triggers/{id}/jobs`     | paged job history          |
//! | `GET  /v1/health`                 | engine health snapshot     |

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tempo_core::{EngineHealth, EngineRuntime};
use tempo_model::{Job, JobId, TriggerId};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::errors::ApiResult;

const DEFAULT_PAGE_SIZE: u32 = 50;

#[derive(Clone, Debug)]
pub struct ApiState {
    engine: Arc<EngineRuntime>,
}

impl ApiState {
    pub fn new(engine: Arc<EngineRuntime>) -> Self {
        Self { engine }
    }
}

/// Builds the versioned router with request tracing.
pub fn router(engine: Arc<EngineRuntime>) -> Router {
    let v1 = Router::new()
        .route("/triggers/{id}/run", post(run_trigger))
        .route("/triggers/{id}/signal", post(signal_trigger))
        .route("/triggers/{id}/jobs", get(job_history))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/health", get(health));

    Router::new()
        .nest("/v1", v1)
        .layer(TraceLayer::new_for_http())
        .with_state(ApiState::new(engine))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunAccepted {
    pub job_id: JobId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Signalled {
    pub queued: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Cancelled {
    pub cancelled: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub page: u32,
    pub page_size: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobHistory {
    pub trigger_id: TriggerId,
    pub page: u32,
    pub page_size: u32,
    pub jobs: Vec<Job>,
}

async fn run_trigger(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<RunAccepted>)> {
    let trigger_id = TriggerId(id);
    let job_id = state.engine.trigger_manual_execution(trigger_id).await?;
    info!(target: "tempo::api", trigger = %trigger_id, job = %job_id, "manual execution accepted");
    Ok((StatusCode::ACCEPTED, Json(RunAccepted { job_id })))
}

async fn signal_trigger(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<Signalled>)> {
    let queued = state.engine.signal_trigger(TriggerId(id)).await?;
    let status = if queued {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(Signalled { queued })))
}

async fn cancel_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Cancelled>> {
    let cancelled = state.engine.cancel_job(JobId(id)).await?;
    Ok(Json(Cancelled { cancelled }))
}

async fn job_history(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<JobHistory>> {
    let trigger_id = TriggerId(id);
    let page_size = query
        .page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, tempo_core::engine::MAX_PAGE_SIZE);
    let jobs = state
        .engine
        .get_job_history(trigger_id, query.page, page_size)
        .await?;
    Ok(Json(JobHistory {
        trigger_id,
        page: query.page,
        page_size,
        jobs,
    }))
}

async fn health(State(state): State<ApiState>) -> Json<EngineHealth> {
    Json(state.engine.health().await)
}
