use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::models::*;
use super::validation::ValidatedJson;
use crate::{
    error::AppResult,
    settlement::{
        models::{Dispute, Settlement, SettlementSchedule, SettlementStats},
        report, DisputeHandler, QueryService, SettlementOrchestrator, SettlementQuery, SettlementScheduler,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SettlementOrchestrator>,
    pub disputes: Arc<DisputeHandler>,
    pub queries: Arc<QueryService>,
    pub scheduler: Arc<SettlementScheduler>,
}

/// Engine health
/// GET /health
pub async fn health_check(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    let report = state.queries.health_check().await?;
    Ok(Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now(),
        report,
    }))
}

/// Create a PENDING settlement
/// POST /settlements
pub async fn create_settlement(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<CreateSettlementDto>,
) -> AppResult<(StatusCode, Json<Settlement>)> {
    info!("Creating settlement for {} ({} - {})", request.user_id, request.start_date, request.end_date);
    let settlement = state.orchestrator.create_settlement(request.into()).await?;
    Ok((StatusCode::CREATED, Json(settlement)))
}

/// GET /settlements/:id
pub async fn get_settlement(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<Json<Settlement>> {
    Ok(Json(state.queries.get_settlement(id).await?))
}

/// Pay out a PENDING settlement
/// POST /settlements/:id/process
pub async fn process_settlement(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<ProcessSettlementDto>,
) -> AppResult<Json<Settlement>> {
    let settlement = state
        .orchestrator
        .process_settlement(id, request.bank_account.map(Into::into), request.approved_by)
        .await?;
    Ok(Json(settlement))
}

/// Re-drive a FAILED settlement ahead of its queued retry
/// POST /settlements/:id/retry
pub async fn retry_settlement(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<Json<Settlement>> {
    Ok(Json(state.orchestrator.retry_settlement(id).await?))
}

/// POST /settlements/:id/cancel
pub async fn cancel_settlement(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<CancelSettlementDto>,
) -> AppResult<Json<Settlement>> {
    let settlement = state
        .orchestrator
        .cancel_settlement(id, &request.reason, request.cancelled_by)
        .await?;
    Ok(Json(settlement))
}

/// Open a dispute; the settlement moves to DISPUTED
/// POST /settlements/:id/disputes
pub async fn open_dispute(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<CreateDisputeDto>,
) -> AppResult<(StatusCode, Json<Dispute>)> {
    let dispute = state.disputes.open_dispute(id, request.into()).await?;
    Ok((StatusCode::CREATED, Json(dispute)))
}

/// Downloadable statement
/// GET /settlements/:id/report?format=csv|json
pub async fn get_settlement_report(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ReportQuery>,
) -> AppResult<Response> {
    let format = query.format.unwrap_or_default();
    let settlement = state.queries.get_settlement(id).await?;
    let body = report::render(&settlement, format)?;

    let headers = [
        (header::CONTENT_TYPE, format.content_type().to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"settlement-{}.{}\"", id, format.extension()),
        ),
    ];
    Ok((headers, body).into_response())
}

/// GET /users/:user_id/settlements?status&limit&offset
pub async fn get_user_settlements(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<SettlementQuery>,
) -> AppResult<Json<Vec<Settlement>>> {
    Ok(Json(state.queries.get_user_settlements(&user_id, query).await?))
}

/// GET /users/:user_id/settlements/stats
pub async fn get_user_stats(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> AppResult<Json<SettlementStats>> {
    Ok(Json(state.queries.get_settlement_stats(&user_id).await?))
}

/// PUT /users/:user_id/schedule
pub async fn upsert_schedule(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    ValidatedJson(request): ValidatedJson<UpsertScheduleDto>,
) -> AppResult<Json<SettlementSchedule>> {
    Ok(Json(state.scheduler.upsert_schedule(&user_id, request.into()).await?))
}

/// GET /users/:user_id/schedule
pub async fn get_schedule(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> AppResult<Json<SettlementSchedule>> {
    Ok(Json(state.scheduler.get_schedule(&user_id).await?))
}

/// POST /users/:user_id/schedule/enabled
pub async fn set_schedule_enabled(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    ValidatedJson(request): ValidatedJson<SetScheduleEnabledDto>,
) -> AppResult<Json<SettlementSchedule>> {
    Ok(Json(state.scheduler.set_enabled(&user_id, request.enabled).await?))
}

/// GET /disputes/:id
pub async fn get_dispute(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<Json<Dispute>> {
    Ok(Json(state.disputes.get_dispute(id).await?))
}
