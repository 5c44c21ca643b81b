//! HTTP surface: link flow, account management, schedules.

use crate::config::LinkConfig;
use crate::handshake::{HandshakeOutcome, HandshakeReceiver};
use crate::store::{LinkStore, LinkedAccount, RenameOutcome, StoreSchedule};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// Longest accepted account alias.
const MAX_NICKNAME_LEN: usize = 50;

/// Signature header on inbound link events.
pub const SIGNATURE_HEADER: &str = "X-Link-Signature";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<LinkStore>,
    pub receiver: Arc<HandshakeReceiver>,
    pub link: LinkConfig,
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Deserialize)]
struct StartLinkRequest {
    requester_id: i64,
}

#[derive(Serialize)]
struct StartLinkResponse {
    auth_url: String,
    state_token: String,
    expires_at: DateTime<Utc>,
}

/// Accounts as exposed over HTTP. Secrets and tokens never leave the
/// process.
#[derive(Serialize)]
struct AccountView {
    id: i64,
    nickname: String,
    riot_id: String,
    puuid: String,
    shard: String,
    created_at: DateTime<Utc>,
}

impl From<LinkedAccount> for AccountView {
    fn from(a: LinkedAccount) -> Self {
        Self {
            id: a.id,
            nickname: a.nickname,
            riot_id: a.riot_id,
            puuid: a.puuid,
            shard: a.shard,
            created_at: a.created_at,
        }
    }
}

#[derive(Deserialize)]
struct RenameRequest {
    new_name: String,
}

#[derive(Deserialize)]
struct ScheduleRequest {
    requester_id: i64,
    account_id: i64,
    guild_id: i64,
    channel_id: i64,
    /// `HH:MM`, 24-hour
    schedule_time: String,
}

#[derive(Serialize)]
struct ScheduleView {
    id: i64,
    account_id: i64,
    guild_id: i64,
    channel_id: i64,
    schedule_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    nickname: Option<String>,
}

impl ScheduleView {
    fn new(s: StoreSchedule, nickname: Option<String>) -> Self {
        Self {
            id: s.id,
            account_id: s.account_id,
            guild_id: s.guild_id,
            channel_id: s.channel_id,
            schedule_time: s.schedule_time,
            nickname,
        }
    }
}

/// Create the link-service router.
pub fn create_link_router(state: AppState) -> Router {
    Router::new()
        .route("/api/link/start", post(start_link))
        .route("/api/link/event", post(receive_link_event))
        .route("/api/accounts/:requester_id", get(list_accounts))
        .route(
            "/api/accounts/:requester_id/:account_id",
            delete(unlink_account),
        )
        .route(
            "/api/accounts/:requester_id/:account_id/rename",
            post(rename_account),
        )
        .route("/api/schedules", post(upsert_schedule))
        .route("/api/schedules/:requester_id/:guild_id", get(list_schedules))
        .route(
            "/api/schedules/:requester_id/by-id/:schedule_id",
            delete(delete_schedule),
        )
        .with_state(Arc::new(state))
}

/// POST /api/link/start - Issue a one-time challenge and build the auth URL
async fn start_link(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartLinkRequest>,
) -> Result<Json<StartLinkResponse>, AppError> {
    let (state_token, expires_at) = state
        .store
        .issue_challenge(request.requester_id)
        .map_err(AppError::Storage)?;

    let auth_url = format!(
        "https://{}/auth?state={}&client_id={}",
        state.link.auth_domain,
        urlencoding::encode(&state_token),
        urlencoding::encode(&state.link.client_app_id),
    );

    info!(requester_id = request.requester_id, "Issued link challenge");

    Ok(Json(StartLinkResponse {
        auth_url,
        state_token,
        expires_at,
    }))
}

/// POST /api/link/event - Webhook receiver for extension link events
///
/// Answers 202 whether the event was linked or dropped, so a prober cannot
/// tell a forged signature from an already-consumed token. Only storage
/// faults surface as 500.
async fn receive_link_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let outcome = state
        .receiver
        .process_event(&body, signature)
        .await
        .map_err(AppError::Storage)?;

    if let HandshakeOutcome::Linked { account_id, .. } = outcome {
        info!(account_id, "Link event accepted");
    }

    Ok(StatusCode::ACCEPTED)
}

/// GET /api/accounts/:requester_id - List linked accounts
async fn list_accounts(
    State(state): State<Arc<AppState>>,
    Path(requester_id): Path<i64>,
) -> Result<Json<Vec<AccountView>>, AppError> {
    let accounts = state
        .store
        .list_accounts(requester_id)
        .map_err(AppError::Storage)?
        .into_iter()
        .map(AccountView::from)
        .collect();
    Ok(Json(accounts))
}

/// DELETE /api/accounts/:requester_id/:account_id - Unlink an account
///
/// Schedules tied to the account go with it.
async fn unlink_account(
    State(state): State<Arc<AppState>>,
    Path((requester_id, account_id)): Path<(i64, i64)>,
) -> Result<StatusCode, AppError> {
    let deleted = state
        .store
        .delete_account(requester_id, account_id)
        .map_err(AppError::Storage)?;
    if deleted {
        info!(requester_id, account_id, "Unlinked account");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("account not found".to_string()))
    }
}

/// POST /api/accounts/:requester_id/:account_id/rename - Change the alias
async fn rename_account(
    State(state): State<Arc<AppState>>,
    Path((requester_id, account_id)): Path<(i64, i64)>,
    Json(request): Json<RenameRequest>,
) -> Result<StatusCode, AppError> {
    let name = request.new_name.trim();
    if name.is_empty() || name.chars().count() > MAX_NICKNAME_LEN {
        return Err(AppError::ValidationError(format!(
            "nickname must be 1-{} characters",
            MAX_NICKNAME_LEN
        )));
    }

    match state
        .store
        .rename_account(requester_id, account_id, name)
        .map_err(AppError::Storage)?
    {
        RenameOutcome::Renamed => Ok(StatusCode::NO_CONTENT),
        RenameOutcome::NameTaken => Err(AppError::Conflict(format!(
            "nickname '{}' is already in use",
            name
        ))),
        RenameOutcome::NotFound => Err(AppError::NotFound("account not found".to_string())),
    }
}

/// POST /api/schedules - Create or replace a channel's daily store post
async fn upsert_schedule(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ScheduleRequest>,
) -> Result<Json<ScheduleView>, AppError> {
    if NaiveTime::parse_from_str(&request.schedule_time, "%H:%M").is_err() {
        return Err(AppError::ValidationError(
            "schedule_time must be HH:MM (24-hour)".to_string(),
        ));
    }

    // The schedule must point at an account the requester owns
    let owns = state
        .store
        .get_account(request.account_id)
        .map_err(AppError::Storage)?
        .map(|a| a.requester_id == request.requester_id)
        .unwrap_or(false);
    if !owns {
        return Err(AppError::NotFound("account not found".to_string()));
    }

    let schedule = state
        .store
        .upsert_schedule(
            request.requester_id,
            request.account_id,
            request.guild_id,
            request.channel_id,
            &request.schedule_time,
        )
        .map_err(AppError::Storage)?;

    info!(
        requester_id = request.requester_id,
        schedule_id = schedule.id,
        time = %schedule.schedule_time,
        "Schedule stored"
    );

    Ok(Json(ScheduleView::new(schedule, None)))
}

/// GET /api/schedules/:requester_id/:guild_id - List the requester's
/// schedules in a guild
async fn list_schedules(
    State(state): State<Arc<AppState>>,
    Path((requester_id, guild_id)): Path<(i64, i64)>,
) -> Result<Json<Vec<ScheduleView>>, AppError> {
    let schedules = state
        .store
        .list_schedules(requester_id, guild_id)
        .map_err(AppError::Storage)?
        .into_iter()
        .map(|(s, nickname)| ScheduleView::new(s, Some(nickname)))
        .collect();
    Ok(Json(schedules))
}

/// DELETE /api/schedules/:requester_id/by-id/:schedule_id - Remove a schedule
async fn delete_schedule(
    State(state): State<Arc<AppState>>,
    Path((requester_id, schedule_id)): Path<(i64, i64)>,
) -> Result<StatusCode, AppError> {
    let deleted = state
        .store
        .delete_schedule(requester_id, schedule_id)
        .map_err(AppError::Storage)?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("schedule not found".to_string()))
    }
}

/// Application error types
enum AppError {
    ValidationError(String),
    NotFound(String),
    Conflict(String),
    Storage(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Storage(e) => {
                error!(error = %e, "Storage failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        let body = Json(ErrorResponse {
            error: error_message,
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::credentials::SecretBox;
    use crate::handshake::{signature, LogNotifier};
    use crate::riot::{IdentityProvider, PlayerIdentity, RiotError, SessionTokens};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use base64::{engine::general_purpose::URL_SAFE as BASE64_URL, Engine};
    use chrono::Duration;
    use tower::ServiceExt;

    const HMAC_SECRET: &str = "api-test-secret";

    struct StubProvider;

    #[async_trait]
    impl IdentityProvider for StubProvider {
        async fn tokens_from_cookies(&self, _: &str) -> Result<SessionTokens, RiotError> {
            Ok(SessionTokens {
                access_token: "access".to_string(),
                entitlement_token: "ent".to_string(),
            })
        }

        async fn entitlement_from_access_token(&self, _: &str) -> Result<String, RiotError> {
            Ok("ent".to_string())
        }

        async fn player_identity(&self, _: &str) -> Result<PlayerIdentity, RiotError> {
            Ok(PlayerIdentity {
                puuid: "puuid-api".to_string(),
                riot_id: "Viper#NA1".to_string(),
            })
        }
    }

    fn test_app() -> (Router, Arc<LinkStore>) {
        let store = Arc::new(LinkStore::new(":memory:", Duration::minutes(10)).unwrap());
        let secrets = SecretBox::from_key(&BASE64_URL.encode([3u8; 32])).unwrap();
        let receiver = Arc::new(HandshakeReceiver::new(
            Arc::clone(&store),
            secrets,
            Arc::new(StubProvider),
            Arc::new(LogNotifier),
            HMAC_SECRET.to_string(),
        ));
        let app = create_link_router(AppState {
            store: Arc::clone(&store),
            receiver,
            link: LinkConfig {
                auth_domain: "link.example.com".to_string(),
                client_app_id: "spike-bot".to_string(),
                challenge_ttl_minutes: 10,
            },
        });
        (app, store)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Drives the full flow: challenge, signed event, linked account.
    async fn link_account(app: &Router, store: &LinkStore, requester_id: i64) -> i64 {
        let (token, _) = store.issue_challenge(requester_id).unwrap();
        let payload = serde_json::json!({
            "state_token": token,
            "cookies_str": "ssid=abc",
        })
        .to_string();
        let sig = signature::sign(payload.as_bytes(), HMAC_SECRET);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/link/event")
                    .header(SIGNATURE_HEADER, sig)
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        store.list_accounts(requester_id).unwrap()[0].id
    }

    #[tokio::test]
    async fn test_start_link_builds_auth_url() {
        let (app, store) = test_app();

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/link/start",
                serde_json::json!({"requester_id": 42}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        let token = body["state_token"].as_str().unwrap();
        assert_eq!(
            body["auth_url"].as_str().unwrap(),
            format!(
                "https://link.example.com/auth?state={}&client_id=spike-bot",
                token
            )
        );
        assert!(body["expires_at"].is_string());
        assert_eq!(store.challenge_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_signed_event_links_and_account_is_listed() {
        let (app, store) = test_app();
        link_account(&app, &store, 42).await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/accounts/42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["riot_id"], "Viper#NA1");
        assert_eq!(body[0]["puuid"], "puuid-api");
        // No secret or token fields in the view
        assert!(body[0].get("encrypted_secret").is_none());
        assert!(body[0].get("access_token").is_none());
    }

    #[tokio::test]
    async fn test_forged_event_still_returns_202() {
        let (app, store) = test_app();
        let (token, _) = store.issue_challenge(42).unwrap();
        let payload = serde_json::json!({
            "state_token": token,
            "cookies_str": "ssid=abc",
        })
        .to_string();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/link/event")
                    .header(SIGNATURE_HEADER, "not-a-signature")
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();

        // Indistinguishable from success on the wire
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(store.list_accounts(42).unwrap().is_empty());
        // The challenge survives for a genuine event
        assert_eq!(store.challenge_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_event_without_signature_header_is_dropped() {
        let (app, store) = test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/link/event")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(store.list_accounts(42).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unlink_account() {
        let (app, store) = test_app();
        let account_id = link_account(&app, &store, 42).await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/accounts/42/{}", account_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(store.list_accounts(42).unwrap().is_empty());

        // Second delete finds nothing
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/accounts/42/{}", account_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unlink_is_owner_scoped() {
        let (app, store) = test_app();
        let account_id = link_account(&app, &store, 42).await;

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/accounts/99/{}", account_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(store.list_accounts(42).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rename_account() {
        let (app, store) = test_app();
        let account_id = link_account(&app, &store, 42).await;

        let response = app
            .oneshot(json_request(
                "POST",
                &format!("/api/accounts/42/{}/rename", account_id),
                serde_json::json!({"new_name": "Main"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(store.list_accounts(42).unwrap()[0].nickname, "Main");
    }

    #[tokio::test]
    async fn test_rename_rejects_overlong_name() {
        let (app, store) = test_app();
        let account_id = link_account(&app, &store, 42).await;

        let response = app
            .oneshot(json_request(
                "POST",
                &format!("/api/accounts/42/{}/rename", account_id),
                serde_json::json!({"new_name": "x".repeat(51)}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_schedule_lifecycle() {
        let (app, store) = test_app();
        let account_id = link_account(&app, &store, 42).await;

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/schedules",
                serde_json::json!({
                    "requester_id": 42,
                    "account_id": account_id,
                    "guild_id": 100,
                    "channel_id": 200,
                    "schedule_time": "09:30",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let schedule_id = json_body(response).await["id"].as_i64().unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/schedules/42/100")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body[0]["schedule_time"], "09:30");
        assert_eq!(body[0]["nickname"], "Viper#NA1");

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/schedules/42/by-id/{}", schedule_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(store.list_schedules(42, 100).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_schedule_rejects_bad_time() {
        let (app, store) = test_app();
        let account_id = link_account(&app, &store, 42).await;

        for bad in ["24:00", "9am", "12:61", ""] {
            let response = app
                .clone()
                .oneshot(json_request(
                    "POST",
                    "/api/schedules",
                    serde_json::json!({
                        "requester_id": 42,
                        "account_id": account_id,
                        "guild_id": 100,
                        "channel_id": 200,
                        "schedule_time": bad,
                    }),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "time {:?}", bad);
        }
    }

    #[tokio::test]
    async fn test_schedule_rejects_foreign_account() {
        let (app, store) = test_app();
        let account_id = link_account(&app, &store, 42).await;

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/schedules",
                serde_json::json!({
                    "requester_id": 99,
                    "account_id": account_id,
                    "guild_id": 100,
                    "channel_id": 200,
                    "schedule_time": "09:30",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
