//! Workspace and membership API routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use serde::Deserialize;

use crate::context::UserId;
use crate::db::{MemberWorkspace, Role, Workspace, WorkspaceMember, WorkspaceRepository};
use crate::error::{AppError, Result};
use crate::state::AppState;

/// Create the workspace router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_workspace).get(list_workspaces))
        .route("/:workspace_id/members", post(add_member))
}

#[derive(Debug, Deserialize)]
pub struct CreateWorkspace {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct AddMember {
    pub user_id: String,
    pub role: Role,
}

/// Create a workspace owned by the caller
async fn create_workspace(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(body): Json<CreateWorkspace>,
) -> Result<(StatusCode, Json<Workspace>)> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("name cannot be empty".to_string()));
    }

    let workspace = WorkspaceRepository::new(state.db())
        .create(name, &user_id)
        .await?;
    tracing::info!(workspace = %workspace.id, owner = %user_id, "Workspace created");

    Ok((StatusCode::CREATED, Json(workspace)))
}

/// List the caller's workspaces
async fn list_workspaces(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<Json<Vec<MemberWorkspace>>> {
    let workspaces = WorkspaceRepository::new(state.db())
        .list_for_user(&user_id)
        .await?;
    Ok(Json(workspaces))
}

/// Add a member or change their role
async fn add_member(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(workspace_id): Path<String>,
    Json(body): Json<AddMember>,
) -> Result<Json<WorkspaceMember>> {
    let repo = WorkspaceRepository::new(state.db());
    if repo.get(&workspace_id).await?.is_none() {
        return Err(AppError::NotFound(format!("workspace {} not found", workspace_id)));
    }

    match repo.member_role(&workspace_id, &user_id).await? {
        Some(role) if role.can_manage() => {}
        Some(_) => {
            return Err(AppError::Forbidden(
                "only owners and admins can manage members".to_string(),
            ))
        }
        None => {
            return Err(AppError::Forbidden(format!(
                "not a member of workspace {}",
                workspace_id
            )))
        }
    }

    let member_id = body.user_id.trim();
    if member_id.is_empty() {
        return Err(AppError::Validation("user_id cannot be empty".to_string()));
    }

    let member = repo.upsert_member(&workspace_id, member_id, body.role).await?;
    Ok(Json(member))
}
