//! Sync API endpoints
//!
//! Delta pulls, batch pushes and tombstone maintenance for the workspace
//! named by `X-Workspace-ID`.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    routing::{get, post},
    Json, Router,
};

use crate::config::MAX_RETENTION_DAYS;
use crate::context::WorkspaceContext;
use crate::db::timestamp;
use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::sync::{
    self, retention_cutoff, BatchProcessor, BatchRequest, BatchResponse, CleanupRequest,
    CleanupResponse, DeltaParams, DeltaQuery, SyncResponse, SyncStatus,
};

/// Create the sync router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/delta", get(get_delta))
        .route("/batch", post(post_batch))
        .route("/status", get(get_status))
        .route("/tombstones/cleanup", post(cleanup_tombstones))
}

/// Pull changes since the client's cursor
async fn get_delta(
    State(state): State<AppState>,
    ctx: WorkspaceContext,
    params: std::result::Result<Query<DeltaParams>, QueryRejection>,
) -> Result<Json<SyncResponse>> {
    let Query(params) = params.map_err(|e| AppError::Validation(e.body_text()))?;
    let query = DeltaQuery::from_params(params, &state.config().sync)?;
    let response = sync::get_delta(state.db(), &ctx, &query, &state.config().sync).await?;
    Ok(Json(response))
}

/// Push a batch of offline changes
async fn post_batch(
    State(state): State<AppState>,
    ctx: WorkspaceContext,
    request: std::result::Result<Json<BatchRequest>, JsonRejection>,
) -> Result<Json<BatchResponse>> {
    let Json(request) = request.map_err(|e| AppError::Validation(e.body_text()))?;
    let processor = BatchProcessor::new(state.db(), &state.config().sync);
    let response = processor.process(&ctx, request).await?;
    Ok(Json(response))
}

/// Per-type counts and latest changes
async fn get_status(
    State(state): State<AppState>,
    ctx: WorkspaceContext,
) -> Result<Json<SyncStatus>> {
    let status = sync::get_status(state.db(), &ctx).await?;
    Ok(Json(status))
}

/// Remove this workspace's tombstones older than the given age
async fn cleanup_tombstones(
    State(state): State<AppState>,
    ctx: WorkspaceContext,
    body: Option<Json<CleanupRequest>>,
) -> Result<Json<CleanupResponse>> {
    ctx.require_manage()?;

    let days = body
        .and_then(|Json(req)| req.older_than_days)
        .unwrap_or(state.config().sync.tombstone_retention_days);
    if !(0..=MAX_RETENTION_DAYS).contains(&days) {
        return Err(AppError::Validation(format!(
            "older_than_days must be between 0 and {}",
            MAX_RETENTION_DAYS
        )));
    }

    let cutoff = retention_cutoff(timestamp::now(), days)?;
    let removed = sync::purge_older_than(state.db(), Some(&ctx.workspace_id), cutoff).await?;

    tracing::info!(
        workspace = %ctx.workspace_id,
        user = %ctx.user_id,
        removed,
        "Tombstones cleaned up"
    );

    Ok(Json(CleanupResponse { removed, cutoff }))
}
