//! Route modules for the Warehouse server

pub mod health;
pub mod sync;
pub mod workspaces;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/health", get(health::health_check))
        .nest("/api/v1/sync", sync::router())
        .nest("/api/v1/workspaces", workspaces::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{create_test_pool, Role, WorkspaceRepository};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use sqlx::SqlitePool;
    use tower::ServiceExt;

    async fn setup() -> (Router, SqlitePool, String) {
        let pool = create_test_pool().await;
        let workspace = WorkspaceRepository::new(&pool)
            .create("Main warehouse", "alice")
            .await
            .unwrap();
        WorkspaceRepository::new(&pool)
            .upsert_member(&workspace.id, "victor", Role::Viewer)
            .await
            .unwrap();

        let app = app(AppState::new(Config::default(), pool.clone()));
        (app, pool, workspace.id)
    }

    fn request(method: &str, uri: &str, user: Option<&str>, workspace: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("X-User-ID", user);
        }
        if let Some(workspace) = workspace {
            builder = builder.header("X-Workspace-ID", workspace);
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _, _) = setup().await;
        let (status, body) = send(&app, request("GET", "/api/v1/health", None, None, None)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "warehouse-server");
    }

    #[tokio::test]
    async fn test_identity_headers() {
        let (app, _, ws) = setup().await;

        let (status, body) = send(&app, request("GET", "/api/v1/sync/delta", None, Some(&ws), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");

        let (status, _) = send(&app, request("GET", "/api/v1/sync/delta", Some("alice"), None, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, request("GET", "/api/v1/sync/delta", Some("mallory"), Some(&ws), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "permission_denied");
    }

    #[tokio::test]
    async fn test_push_then_pull() {
        let (app, _, ws) = setup().await;

        let batch = json!({
            "operations": [
                {"operation": "create", "entity_type": "item", "id": "item-1", "data": {"name": "Drill"}},
                {"operation": "create", "entity_type": "borrower", "id": "b-1", "data": {"name": "Sam"}}
            ]
        });
        let (status, body) = send(&app, request("POST", "/api/v1/sync/batch", Some("alice"), Some(&ws), Some(batch))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["succeeded_count"], 2);

        let (status, body) = send(&app, request("GET", "/api/v1/sync/delta", Some("alice"), Some(&ws), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["items"][0]["id"], "item-1");
        assert_eq!(body["items"][0]["name"], "Drill");
        assert_eq!(body["borrowers"][0]["id"], "b-1");
        assert_eq!(body["metadata"]["has_more"], false);
        assert_eq!(body["metadata"]["full_resync_required"], false);
        assert!(body["metadata"]["next_cursor"].is_string());

        let cursor = body["metadata"]["next_cursor"].as_str().unwrap().replace('+', "%2B");
        let uri = format!("/api/v1/sync/delta?modified_since={}&entity_types=items,borrowers", cursor);
        let (status, body) = send(&app, request("GET", &uri, Some("alice"), Some(&ws), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["items"].as_array().unwrap().len(), 0);
        assert_eq!(body["borrowers"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_delta_rejects_bad_query() {
        let (app, _, ws) = setup().await;

        let (status, body) = send(&app, request("GET", "/api/v1/sync/delta?entity_types=widgets", Some("alice"), Some(&ws), None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation");

        let (status, _) = send(&app, request("GET", "/api/v1/sync/delta?limit=0", Some("alice"), Some(&ws), None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, request("GET", "/api/v1/sync/delta?modified_since=yesterday", Some("alice"), Some(&ws), None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_viewer_batch_is_forbidden() {
        let (app, _, ws) = setup().await;
        let batch = json!({
            "operations": [{"operation": "create", "entity_type": "item", "data": {"name": "Drill"}}]
        });

        let (status, _) = send(&app, request("POST", "/api/v1/sync/batch", Some("victor"), Some(&ws), Some(batch))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send(&app, request("GET", "/api/v1/sync/delta", Some("victor"), Some(&ws), None)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_and_cleanup() {
        let (app, _, ws) = setup().await;
        let batch = json!({
            "operations": [
                {"operation": "create", "entity_type": "location", "id": "loc-1", "data": {"name": "Shelf A"}},
                {"operation": "delete", "entity_type": "location", "id": "loc-1"}
            ],
            "allow_partial": false
        });
        let (_, body) = send(&app, request("POST", "/api/v1/sync/batch", Some("alice"), Some(&ws), Some(batch))).await;
        assert_eq!(body["success"], true);

        let (status, body) = send(&app, request("GET", "/api/v1/sync/status", Some("alice"), Some(&ws), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tombstones"], 1);

        let (status, _) = send(
            &app,
            request("POST", "/api/v1/sync/tombstones/cleanup", Some("victor"), Some(&ws), Some(json!({}))),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(
            &app,
            request("POST", "/api/v1/sync/tombstones/cleanup", Some("alice"), Some(&ws), Some(json!({"older_than_days": 0}))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], 1);
    }

    #[tokio::test]
    async fn test_workspace_management() {
        let (app, _, ws) = setup().await;

        let (status, body) = send(&app, request("POST", "/api/v1/workspaces", Some("bob"), None, Some(json!({"name": "Annex"})))).await;
        assert_eq!(status, StatusCode::CREATED);
        let annex = body["id"].as_str().unwrap().to_string();

        let (status, body) = send(&app, request("GET", "/api/v1/workspaces", Some("bob"), None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], annex.as_str());
        assert_eq!(body[0]["role"], "owner");

        let uri = format!("/api/v1/workspaces/{}/members", ws);
        let (status, _) = send(&app, request("POST", &uri, Some("victor"), None, Some(json!({"user_id": "bob", "role": "member"})))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(&app, request("POST", &uri, Some("alice"), None, Some(json!({"user_id": "bob", "role": "member"})))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["role"], "member");

        let (status, _) = send(&app, request("GET", "/api/v1/sync/status", Some("bob"), Some(&ws), None)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_batch_body_errors_are_json_validation() {
        let (app, _, ws) = setup().await;

        let malformed = Request::builder()
            .method("POST")
            .uri("/api/v1/sync/batch")
            .header("X-User-ID", "alice")
            .header("X-Workspace-ID", &ws)
            .header("content-type", "application/json")
            .body(Body::from(r#"{"operations": ["#))
            .unwrap();
        let (status, body) = send(&app, malformed).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation");

        let batch = json!({
            "operations": [
                {"operation": "create", "entity_type": "item", "id": "item-1", "data": {"name": "Drill"}},
                {"operation": "upsert", "entity_type": "item", "id": "item-2", "data": {"name": "Saw"}},
                {"operation": "update", "entity_type": "item", "id": "item-1", "data": {"name": "Saw"}, "expected_updated_at": 7}
            ]
        });
        let (status, body) = send(&app, request("POST", "/api/v1/sync/batch", Some("alice"), Some(&ws), Some(batch))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"][0]["success"], true);
        assert_eq!(body["results"][1]["error_code"], "VALIDATION");
        assert_eq!(body["results"][1]["id"], "item-2");
        assert_eq!(body["results"][2]["error_code"], "VALIDATION");
        assert_eq!(body["succeeded_count"], 1);
    }

    #[tokio::test]
    async fn test_cleanup_rejects_out_of_range_age() {
        let (app, _, ws) = setup().await;

        for days in [json!(-1), json!(1_000_000_000_i64), json!(i64::MAX)] {
            let (status, body) = send(
                &app,
                request("POST", "/api/v1/sync/tombstones/cleanup", Some("alice"), Some(&ws), Some(json!({"older_than_days": days}))),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "older_than_days = {}", days);
            assert_eq!(body["error"], "validation");
        }
    }
}
