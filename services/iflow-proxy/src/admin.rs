//! Admin API for account management
//!
//! Runs on a separate listener (`admin_addr`) and is never routed through
//! the gateway port. Onboarding flows that obtain credentials elsewhere hand
//! the finished account to `POST /admin/accounts`.
//!
//! Endpoints:
//! - GET    /admin/accounts       list accounts with status (no secrets)
//! - POST   /admin/accounts       add a static-key or OAuth account
//! - DELETE /admin/accounts/{id}  remove an account
//! - GET    /admin/pool           pool status summary

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use common::Secret;
use iflow_auth::{Account, AuthMethod, decode_refresh_parts};
use iflow_pool::Pool;
use serde::Deserialize;
use tracing::{info, warn};

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<Pool>,
}

impl AdminState {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool }
    }
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/accounts", get(list_accounts).post(add_account))
        .route("/admin/accounts/{id}", delete(delete_account))
        .route("/admin/pool", get(pool_status))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (status, [(CONTENT_TYPE, "application/json")], body.to_string())
}

/// GET /admin/accounts
async fn list_accounts(State(state): State<AdminState>) -> impl IntoResponse {
    let health = state.pool.health().await;
    let accounts = health
        .get("accounts")
        .cloned()
        .unwrap_or(serde_json::json!([]));
    json_response(StatusCode::OK, serde_json::json!({ "accounts": accounts }))
}

/// Credentials for a new account. A `refresh_token` makes it token-based.
///
/// `legacy_refresh` accepts the packed base64 blob older clients stored in
/// place of the separate refresh token and auth method fields.
#[derive(Deserialize)]
struct AddAccountRequest {
    #[serde(default)]
    label: String,
    api_key: String,
    refresh_token: Option<String>,
    access_token: Option<String>,
    /// Access token expiry, unix milliseconds
    expires_at: Option<u64>,
    legacy_refresh: Option<String>,
}

impl AddAccountRequest {
    fn into_account(self) -> iflow_auth::Result<Account> {
        let mut account = Account::new_api_key(self.label, self.api_key);
        if let Some(refresh_token) = self.refresh_token {
            account.auth = AuthMethod::OAuth {
                refresh_token: Some(Secret::new(refresh_token)),
                access_token: self.access_token.map(Secret::new),
                expires_at: self.expires_at,
            };
        } else if let Some(encoded) = self.legacy_refresh {
            account.auth = match decode_refresh_parts(&encoded)? {
                // The blob carries no access token; expire at once so the
                // first request refreshes.
                AuthMethod::OAuth { refresh_token, .. } => AuthMethod::OAuth {
                    refresh_token,
                    access_token: self.access_token.map(Secret::new),
                    expires_at: Some(self.expires_at.unwrap_or(0)),
                },
                AuthMethod::ApiKey => AuthMethod::ApiKey,
            };
        }
        Ok(account)
    }
}

/// POST /admin/accounts
async fn add_account(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<AddAccountRequest>,
) -> impl IntoResponse {
    if body.api_key.trim().is_empty() {
        return json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "api_key must not be empty" }),
        );
    }

    let account = match body.into_account() {
        Ok(account) => account,
        Err(e) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": e.to_string() }),
            );
        }
    };
    let account_id = account.id.clone();
    let auth_method = account.auth.label();
    state.pool.add(account).await;

    if let Err(e) = state.pool.save().await {
        warn!(account_id, error = %e, "account added but not persisted");
        return json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": format!("failed to persist account: {e}") }),
        );
    }

    info!(account_id, auth_method, "account added to pool");
    json_response(
        StatusCode::CREATED,
        serde_json::json!({
            "account_id": account_id,
            "auth_method": auth_method,
            "status": "added",
        }),
    )
}

/// DELETE /admin/accounts/{id}
async fn delete_account(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if !state.pool.remove(&id).await {
        return json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": format!("no account with id {id}") }),
        );
    }

    if let Err(e) = state.pool.save().await {
        warn!(account_id = id, error = %e, "account removed but not persisted");
        return json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": format!("failed to persist removal: {e}") }),
        );
    }

    info!(account_id = id, "account removed");
    json_response(
        StatusCode::OK,
        serde_json::json!({ "account_id": id, "status": "removed" }),
    )
}

/// GET /admin/pool
async fn pool_status(State(state): State<AdminState>) -> impl IntoResponse {
    json_response(StatusCode::OK, state.pool.health().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use iflow_auth::{AccountStore, Persistence};
    use iflow_pool::{SelectionStrategy, SystemClock};
    use tower::ServiceExt;

    fn test_pool(dir: &std::path::Path, accounts: Vec<Account>) -> (Arc<Pool>, Arc<AccountStore>) {
        let store = Arc::new(AccountStore::new(dir.join("accounts.json")));
        let pool = Arc::new(Pool::new(
            accounts,
            SelectionStrategy::RoundRobin,
            store.clone(),
            Arc::new(SystemClock),
        ));
        (pool, store)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn list_accounts_empty_pool() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = test_pool(dir.path(), vec![]);
        let app = build_admin_router(AdminState::new(pool));

        let response = app
            .oneshot(Request::builder().uri("/admin/accounts").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["accounts"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn list_accounts_never_exposes_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let account = Account::new_oauth("dev@example.com", "sk-live", "rt-live", "at-live", u64::MAX);
        let id = account.id.clone();
        let (pool, _) = test_pool(dir.path(), vec![account]);
        let app = build_admin_router(AdminState::new(pool));

        let response = app
            .oneshot(Request::builder().uri("/admin/accounts").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let accounts = json["accounts"].as_array().unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0]["id"], id.as_str());
        assert_eq!(accounts[0]["label"], "dev@example.com");
        assert_eq!(accounts[0]["status"], "available");
        let text = json.to_string();
        assert!(!text.contains("sk-live"));
        assert!(!text.contains("rt-live"));
        assert!(!text.contains("at-live"));
    }

    #[tokio::test]
    async fn add_static_key_account_persists() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, store) = test_pool(dir.path(), vec![]);
        let app = build_admin_router(AdminState::new(pool.clone()));

        let response = app
            .oneshot(post_json(
                "/admin/accounts",
                serde_json::json!({ "label": "ci", "api_key": "sk-ci" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["status"], "added");
        assert_eq!(json["auth_method"], pool.list().await[0].auth.label());

        let stored = store.load().await.unwrap();
        assert_eq!(stored.accounts.len(), 1);
        assert_eq!(stored.accounts[0].id, json["account_id"].as_str().unwrap());
        assert_eq!(stored.accounts[0].static_key.expose(), "sk-ci");
        assert_eq!(stored.accounts[0].auth, AuthMethod::ApiKey);
    }

    #[tokio::test]
    async fn add_oauth_account_keeps_token_fields() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = test_pool(dir.path(), vec![]);
        let app = build_admin_router(AdminState::new(pool.clone()));

        let response = app
            .oneshot(post_json(
                "/admin/accounts",
                serde_json::json!({
                    "label": "dev@example.com",
                    "api_key": "sk-dev",
                    "refresh_token": "rt-dev",
                    "access_token": "at-dev",
                    "expires_at": 1_900_000_000_000u64,
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let account = pool.list().await.remove(0);
        assert!(account.is_token_based());
        assert_eq!(account.expires_at(), Some(1_900_000_000_000));
        assert_eq!(account.refresh_token().unwrap().expose(), "rt-dev");
    }

    #[tokio::test]
    async fn add_account_imports_legacy_refresh_blob() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = test_pool(dir.path(), vec![]);
        let app = build_admin_router(AdminState::new(pool.clone()));

        // {"refreshToken":"rt-legacy","authMethod":"oauth"}
        let blob = "eyJyZWZyZXNoVG9rZW4iOiJydC1sZWdhY3kiLCJhdXRoTWV0aG9kIjoib2F1dGgifQ==";
        let response = app
            .oneshot(post_json(
                "/admin/accounts",
                serde_json::json!({
                    "label": "old@example.com",
                    "api_key": "sk-old",
                    "legacy_refresh": blob,
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["auth_method"], "oauth");
        let account = pool.list().await.remove(0);
        assert_eq!(account.refresh_token().unwrap().expose(), "rt-legacy");
        assert_eq!(account.expires_at(), Some(0));
    }

    #[tokio::test]
    async fn add_account_rejects_corrupt_legacy_blob() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = test_pool(dir.path(), vec![]);
        let app = build_admin_router(AdminState::new(pool.clone()));

        let response = app
            .oneshot(post_json(
                "/admin/accounts",
                serde_json::json!({
                    "label": "old@example.com",
                    "api_key": "sk-old",
                    "legacy_refresh": "!!!not-base64!!!",
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("base64"));
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn add_account_rejects_empty_key() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = test_pool(dir.path(), vec![]);
        let app = build_admin_router(AdminState::new(pool.clone()));

        let response = app
            .oneshot(post_json(
                "/admin/accounts",
                serde_json::json!({ "label": "ci", "api_key": "  " }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn delete_account_removes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let keep = Account::new_api_key("keep", "sk-keep");
        let drop = Account::new_api_key("drop", "sk-drop");
        let drop_id = drop.id.clone();
        let (pool, store) = test_pool(dir.path(), vec![keep.clone(), drop]);
        let app = build_admin_router(AdminState::new(pool.clone()));

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/admin/accounts/{drop_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "removed");
        assert_eq!(pool.count().await, 1);

        let stored = store.load().await.unwrap();
        assert_eq!(stored.accounts.len(), 1);
        assert_eq!(stored.accounts[0].id, keep.id);
    }

    #[tokio::test]
    async fn delete_unknown_account_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _) = test_pool(dir.path(), vec![Account::new_api_key("a", "sk-a")]);
        let app = build_admin_router(AdminState::new(pool.clone()));

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/admin/accounts/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(pool.count().await, 1);
    }

    #[tokio::test]
    async fn pool_status_reports_summary() {
        let dir = tempfile::tempdir().unwrap();
        let mut limited = Account::new_api_key("limited", "sk-b");
        limited.rate_limit_reset_time = u64::MAX;
        let (pool, _) = test_pool(dir.path(), vec![Account::new_api_key("a", "sk-a"), limited]);
        let app = build_admin_router(AdminState::new(pool));

        let response = app
            .oneshot(Request::builder().uri("/admin/pool").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["strategy"], "round-robin");
        assert_eq!(json["accounts_total"], 2);
        assert_eq!(json["accounts_available"], 1);
        assert_eq!(json["accounts_rate_limited"], 1);
    }
}
