//! Workspace and membership database operations

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::timestamp;
use crate::error::{AppError, Result};

/// Membership role within a workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Member,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Member => "member",
            Role::Viewer => "viewer",
        }
    }

    /// Whether the role may mutate workspace data
    pub fn can_write(&self) -> bool {
        !matches!(self, Role::Viewer)
    }

    /// Whether the role may manage members and run maintenance
    pub fn can_manage(&self) -> bool {
        matches!(self, Role::Owner | Role::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "owner" => Ok(Role::Owner),
            "admin" => Ok(Role::Admin),
            "member" => Ok(Role::Member),
            "viewer" => Ok(Role::Viewer),
            other => Err(AppError::Validation(format!("unknown role: {}", other))),
        }
    }
}

/// Workspace record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Workspace as seen by one of its members
#[derive(Debug, Clone, Serialize)]
pub struct MemberWorkspace {
    #[serde(flatten)]
    pub workspace: Workspace,
    pub role: Role,
}

/// Membership record
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceMember {
    pub workspace_id: String,
    pub user_id: String,
    pub role: Role,
    pub created_at: String,
}

/// Workspace repository
pub struct WorkspaceRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> WorkspaceRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a workspace and make `owner_id` its owner
    pub async fn create(&self, name: &str, owner_id: &str) -> Result<Workspace> {
        let now = timestamp::format(&timestamp::now());
        let workspace = Workspace {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: now.clone(),
            updated_at: now.clone(),
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO workspaces (id, name, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&workspace.id)
        .bind(&workspace.name)
        .bind(&workspace.created_at)
        .bind(&workspace.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO workspace_members (workspace_id, user_id, role, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&workspace.id)
        .bind(owner_id)
        .bind(Role::Owner.as_str())
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(workspace)
    }

    /// Get a workspace by ID
    pub async fn get(&self, id: &str) -> Result<Option<Workspace>> {
        let workspace = sqlx::query_as::<_, Workspace>(
            "SELECT id, name, created_at, updated_at FROM workspaces WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        Ok(workspace)
    }

    /// List the workspaces a user belongs to
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<MemberWorkspace>> {
        let rows: Vec<(String, String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT w.id, w.name, w.created_at, w.updated_at, m.role
            FROM workspaces w
            JOIN workspace_members m ON m.workspace_id = w.id
            WHERE m.user_id = ?
            ORDER BY w.name ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, name, created_at, updated_at, role)| {
                Ok(MemberWorkspace {
                    workspace: Workspace {
                        id,
                        name,
                        created_at,
                        updated_at,
                    },
                    role: role.parse()?,
                })
            })
            .collect()
    }

    /// Role of a user in a workspace, `None` when not a member
    pub async fn member_role(&self, workspace_id: &str, user_id: &str) -> Result<Option<Role>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT role FROM workspace_members WHERE workspace_id = ? AND user_id = ?",
        )
        .bind(workspace_id)
        .bind(user_id)
        .fetch_optional(self.pool)
        .await?;

        row.map(|(role,)| role.parse()).transpose()
    }

    /// Add a member, or change the role of an existing one
    pub async fn upsert_member(
        &self,
        workspace_id: &str,
        user_id: &str,
        role: Role,
    ) -> Result<WorkspaceMember> {
        let now = timestamp::format(&timestamp::now());

        sqlx::query(
            r#"
            INSERT INTO workspace_members (workspace_id, user_id, role, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(workspace_id, user_id) DO UPDATE SET
                role = excluded.role
            "#,
        )
        .bind(workspace_id)
        .bind(user_id)
        .bind(role.as_str())
        .bind(&now)
        .execute(self.pool)
        .await?;

        let (created_at,): (String,) = sqlx::query_as(
            "SELECT created_at FROM workspace_members WHERE workspace_id = ? AND user_id = ?",
        )
        .bind(workspace_id)
        .bind(user_id)
        .fetch_one(self.pool)
        .await?;

        Ok(WorkspaceMember {
            workspace_id: workspace_id.to_string(),
            user_id: user_id.to_string(),
            role,
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;

    #[tokio::test]
    async fn test_creator_becomes_owner() {
        let pool = create_test_pool().await;
        let repo = WorkspaceRepository::new(&pool);

        let ws = repo.create("Main warehouse", "alice").await.unwrap();

        assert_eq!(repo.member_role(&ws.id, "alice").await.unwrap(), Some(Role::Owner));
        assert_eq!(repo.member_role(&ws.id, "bob").await.unwrap(), None);
        assert!(repo.get(&ws.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_upsert_member_changes_role() {
        let pool = create_test_pool().await;
        let repo = WorkspaceRepository::new(&pool);
        let ws = repo.create("Garage", "alice").await.unwrap();

        repo.upsert_member(&ws.id, "bob", Role::Viewer).await.unwrap();
        assert_eq!(repo.member_role(&ws.id, "bob").await.unwrap(), Some(Role::Viewer));

        let member = repo.upsert_member(&ws.id, "bob", Role::Member).await.unwrap();
        assert_eq!(member.role, Role::Member);
        assert_eq!(repo.member_role(&ws.id, "bob").await.unwrap(), Some(Role::Member));
    }

    #[tokio::test]
    async fn test_list_for_user() {
        let pool = create_test_pool().await;
        let repo = WorkspaceRepository::new(&pool);
        repo.create("Beta", "alice").await.unwrap();
        let alpha = repo.create("Alpha", "bob").await.unwrap();
        repo.upsert_member(&alpha.id, "alice", Role::Admin).await.unwrap();

        let listed = repo.list_for_user("alice").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].workspace.name, "Alpha");
        assert_eq!(listed[0].role, Role::Admin);
        assert_eq!(listed[1].role, Role::Owner);
    }

    #[test]
    fn test_role_permissions() {
        assert!(Role::Member.can_write());
        assert!(!Role::Viewer.can_write());
        assert!(Role::Admin.can_manage());
        assert!(!Role::Member.can_manage());
        assert!("janitor".parse::<Role>().is_err());
    }
}
