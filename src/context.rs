//! Caller identity
//!
//! Identity arrives as headers set by an upstream gateway. `UserId` only
//! requires `X-User-ID`; `WorkspaceContext` also resolves the caller's role in
//! the workspace named by `X-Workspace-ID`.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use crate::db::{Role, WorkspaceRepository};
use crate::error::AppError;
use crate::state::AppState;

pub const USER_HEADER: &str = "x-user-id";
pub const WORKSPACE_HEADER: &str = "x-workspace-id";

/// Authenticated user, from `X-User-ID`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserId(pub String);

/// Who is calling, in which workspace, with what role
#[derive(Debug, Clone)]
pub struct WorkspaceContext {
    pub workspace_id: String,
    pub user_id: String,
    pub role: Role,
}

impl WorkspaceContext {
    pub fn require_write(&self) -> Result<(), AppError> {
        if self.role.can_write() {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "role {} cannot modify workspace {}",
                self.role, self.workspace_id
            )))
        }
    }

    pub fn require_manage(&self) -> Result<(), AppError> {
        if self.role.can_manage() {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "role {} cannot manage workspace {}",
                self.role, self.workspace_id
            )))
        }
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        header(parts, USER_HEADER)
            .map(|user| UserId(user.to_string()))
            .ok_or_else(|| AppError::Unauthorized("missing X-User-ID header".to_string()))
    }
}

#[async_trait]
impl FromRequestParts<AppState> for WorkspaceContext {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let UserId(user_id) = UserId::from_request_parts(parts, state).await?;
        let workspace_id = header(parts, WORKSPACE_HEADER)
            .ok_or_else(|| AppError::BadRequest("missing X-Workspace-ID header".to_string()))?
            .to_string();

        let role = WorkspaceRepository::new(state.db())
            .member_role(&workspace_id, &user_id)
            .await?
            .ok_or_else(|| {
                tracing::debug!(user = %user_id, workspace = %workspace_id, "Rejected non-member");
                AppError::Forbidden(format!("not a member of workspace {}", workspace_id))
            })?;

        Ok(Self {
            workspace_id,
            user_id,
            role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(role: Role) -> WorkspaceContext {
        WorkspaceContext {
            workspace_id: "ws-1".to_string(),
            user_id: "alice".to_string(),
            role,
        }
    }

    #[test]
    fn test_role_gates() {
        assert!(ctx(Role::Member).require_write().is_ok());
        assert!(matches!(ctx(Role::Viewer).require_write(), Err(AppError::Forbidden(_))));
        assert!(ctx(Role::Admin).require_manage().is_ok());
        assert!(matches!(ctx(Role::Member).require_manage(), Err(AppError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_blank_user_header_is_unauthorized() {
        let (mut parts, _) = axum::http::Request::builder()
            .header(USER_HEADER, "   ")
            .body(())
            .unwrap()
            .into_parts();

        let result = UserId::from_request_parts(&mut parts, &()).await;
        assert!(matches!(result, Err(AppError::Unauthorized(_))));
    }
}
