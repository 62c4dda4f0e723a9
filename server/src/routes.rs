//! HTTP route handlers for the Parley server.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `GET /ws` - WebSocket chat endpoint (token via query parameter or cookie)
//! - `POST /auth/chat-token` - Exchange a resolved user id for a chat session
//! - `POST /auth/logout` - Revoke the user's session
//! - `GET /health` - Health check endpoint
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`]: configuration,
//! the connection hub, the session validator, and the user directory. The
//! WebSocket handler authenticates *before* accepting the connection into
//! the hub; a missing or invalid token upgrades and immediately closes with
//! a policy-violation code, so the connection never reaches CONNECTED.
//!
//! Credential verification (passwords, registration, activation) lives in
//! the external user CRUD service; `/auth/chat-token` is the boundary where
//! an already-resolved user id is traded for a chat session.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::directory::{DirectoryError, UserDirectory};
use crate::hub::{ConnectionHub, ConnectionId};
use crate::keepalive::spawn_keepalive;
use crate::protocol::{ClientAction, Outbound, CLOSE_POLICY_VIOLATION};
use crate::session::SessionValidator;
use crate::types::Identity;

/// Name of the cookie that may carry the session token.
const SESSION_COOKIE: &str = "session";

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
///
/// This struct is cloned for each request handler, enabling efficient
/// shared access to server-wide resources.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// The connection hub.
    pub hub: Arc<ConnectionHub>,

    /// Session validator backing both the handshake and the keepalive loop.
    pub validator: Arc<SessionValidator>,

    /// Identity resolution at connect time.
    pub directory: Arc<dyn UserDirectory>,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates a new application state from its collaborators.
    #[must_use]
    pub fn new(
        config: Config,
        hub: Arc<ConnectionHub>,
        validator: Arc<SessionValidator>,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            hub,
            validator,
            directory,
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"<Config>")
            .field("hub", &self.hub)
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(get_ws))
        .route("/auth/chat-token", post(post_chat_token))
        .route("/auth/logout", post(post_logout))
        .route("/health", get(get_health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Error Response Types
// ============================================================================

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

// ============================================================================
// GET /ws - WebSocket chat endpoint
// ============================================================================

/// Query parameters for the WebSocket endpoint.
#[derive(Debug, Deserialize)]
pub struct WsQueryParams {
    /// Session token; may instead arrive in the `session` cookie.
    pub token: Option<String>,
}

/// GET /ws - WebSocket chat endpoint.
///
/// # Authentication
///
/// The session token is read from the `token` query parameter or the
/// `session` cookie. Authentication happens before the connection is
/// accepted into the hub: on failure the socket is upgraded and then
/// immediately closed with a policy-violation code, so no frames are
/// exchanged and the connection never reaches CONNECTED.
async fn get_ws(
    State(state): State<AppState>,
    Query(params): Query<WsQueryParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params
        .token
        .filter(|t| !t.is_empty())
        .or_else(|| session_cookie(&headers));

    let Some(token) = token else {
        debug!("WebSocket request without token");
        return close_before_accept(ws, "missing token");
    };

    let (claims, valid) = state.validator.check(&token).await;
    let Some(claims) = claims.filter(|_| valid) else {
        debug!("WebSocket request with invalid or expired session");
        return close_before_accept(ws, "invalid or expired session");
    };

    // Resolve the authoritative identity snapshot; the token's username may
    // be stale.
    let identity = match state.directory.get_by_id(claims.user_id).await {
        Ok(identity) => identity,
        Err(err) => {
            warn!(user_id = %claims.user_id, error = %err, "Identity resolution failed");
            return close_before_accept(ws, "unknown user");
        }
    };

    info!(
        user_id = %identity.user_id,
        username = %identity.username,
        "WebSocket connection authenticated"
    );

    ws.on_upgrade(move |socket| run_connection(socket, state, identity, token))
}

/// Upgrades the socket only to close it with a policy-violation code.
///
/// The close code cannot be delivered without completing the upgrade.
fn close_before_accept(ws: WebSocketUpgrade, reason: &'static str) -> Response {
    ws.on_upgrade(move |mut socket| async move {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_POLICY_VIOLATION,
                reason: reason.into(),
            })))
            .await;
    })
}

/// Extracts the session token from the `Cookie` header, if present.
fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("cookie")?.to_str().ok()?;

    raw.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        if name == SESSION_COOKIE && !value.is_empty() {
            Some(value.to_string())
        } else {
            None
        }
    })
}

/// Runs an authenticated connection to completion.
///
/// Three tasks cooperate per connection:
/// - the writer task owns the socket sink and drains the outbound channel
/// - this receive loop translates inbound frames into hub operations
/// - the keepalive loop re-validates the session on an interval
///
/// When the receive loop exits for any reason, the keepalive task is
/// aborted and the connection is removed from the hub before returning, so
/// nothing leaks past teardown.
async fn run_connection(socket: WebSocket, state: AppState, identity: Identity, token: String) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();

    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    let connection_id: ConnectionId = Uuid::new_v4();

    if let Err(err) = state
        .hub
        .connect(connection_id, identity.clone(), tx.clone())
        .await
    {
        error!(error = %err, "Failed to register connection");
        writer_handle.abort();
        return;
    }

    state
        .hub
        .broadcast_system(
            &format!("{} joined the chat", identity.username),
            Some(connection_id),
        )
        .await;

    let keepalive_handle = spawn_keepalive(
        Arc::clone(&state.validator),
        token,
        tx.clone(),
        state.config.keepalive_interval,
    );

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match ClientAction::parse(&text) {
                Some(action) => dispatch(&state.hub, connection_id, action).await,
                None => {
                    trace!(connection_id = %connection_id, "Dropped inbound frame");
                }
            },
            Ok(Message::Close(_)) => {
                debug!(connection_id = %connection_id, "Client sent close frame");
                break;
            }
            Ok(Message::Ping(_)) => {
                // axum replies with pong automatically
            }
            Ok(_) => {
                // Binary and pong frames are ignored.
            }
            Err(err) => {
                debug!(connection_id = %connection_id, error = %err, "WebSocket error");
                break;
            }
        }
    }

    // Teardown: the keepalive must not outlive the receive loop.
    keepalive_handle.abort();
    writer_handle.abort();

    if let Some(identity) = state.hub.disconnect(connection_id).await {
        state
            .hub
            .broadcast_system(&format!("{} left the chat", identity.username), None)
            .await;
    }

    info!(connection_id = %connection_id, "Connection closed");
}

/// Routes one decoded client action to its hub operation.
async fn dispatch(hub: &ConnectionHub, id: ConnectionId, action: ClientAction) {
    match action {
        ClientAction::SendMessage { content } => {
            if let Err(err) = hub.send_and_persist(id, &content).await {
                warn!(error = %err, "send_message failed");
            }
        }
        ClientAction::Typing => hub.typing(id).await,
        ClientAction::StopTyping => hub.stop_typing(id).await,
        ClientAction::LoadMoreMessages => hub.load_more(id).await,
    }
}

/// Writer task: serializes outbound items onto the socket sink.
///
/// Terminates when the channel closes, a send fails, or a close
/// instruction is drained.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Frame(frame) => match serde_json::to_string(&frame) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    error!(error = %err, "Failed to serialize outbound frame");
                }
            },
            Outbound::Close { code, reason } => {
                let _ = ws_sender
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

// ============================================================================
// POST /auth/chat-token - Session issuance
// ============================================================================

/// Request body for session issuance.
#[derive(Debug, Deserialize)]
pub struct ChatTokenRequest {
    /// The user id resolved by the external login flow.
    pub user_id: Uuid,
}

/// Response body carrying the issued token.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatTokenResponse {
    /// The signed session token.
    pub chat_token: String,
}

/// POST /auth/chat-token - Issues a chat session for a known user.
///
/// Issuing a session deletes any prior session for the same identity:
/// logging in again logs the previous session out.
///
/// # Responses
///
/// - `200 OK` with `{chat_token}` on success
/// - `401 Unauthorized` if the user id is unknown
/// - `503 Service Unavailable` if the session store or directory is down
async fn post_chat_token(
    State(state): State<AppState>,
    Json(request): Json<ChatTokenRequest>,
) -> Response {
    let identity = match state.directory.get_by_id(request.user_id).await {
        Ok(identity) => identity,
        Err(DirectoryError::NotFound(user_id)) => {
            debug!(user_id = %user_id, "Chat token requested for unknown user");
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new("user not found").with_code("unknown_user")),
            )
                .into_response();
        }
        Err(err) => {
            error!(error = %err, "User directory unavailable");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse::new("user directory unavailable").with_code("upstream")),
            )
                .into_response();
        }
    };

    match state
        .validator
        .issue_session(&identity, state.config.token_ttl)
        .await
    {
        Ok(chat_token) => {
            info!(user_id = %identity.user_id, "Chat session issued");
            (StatusCode::OK, Json(ChatTokenResponse { chat_token })).into_response()
        }
        Err(err) => {
            error!(error = %err, "Failed to issue session");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse::new("session store unavailable").with_code("upstream")),
            )
                .into_response()
        }
    }
}

// ============================================================================
// POST /auth/logout - Session revocation
// ============================================================================

/// Request body for logout.
#[derive(Debug, Deserialize)]
pub struct LogoutRequest {
    /// The user whose session should be revoked.
    pub user_id: Uuid,
}

/// POST /auth/logout - Revokes the user's session.
///
/// Any live connection held by the user is closed by its keepalive loop on
/// the next re-validation.
///
/// # Responses
///
/// - `204 No Content` on success (revoking a non-existent session succeeds)
/// - `503 Service Unavailable` if the session store is down
async fn post_logout(
    State(state): State<AppState>,
    Json(request): Json<LogoutRequest>,
) -> Response {
    let identity = Identity::new(request.user_id, String::new());

    match state.validator.revoke(&identity).await {
        Ok(()) => {
            info!(user_id = %request.user_id, "Session revoked");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => {
            error!(error = %err, "Failed to revoke session");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse::new("session store unavailable").with_code("upstream")),
            )
                .into_response()
        }
    }
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of active WebSocket connections.
    pub connections: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint.
///
/// Returns server health status and statistics. No authentication required.
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = state.start_time.elapsed();

    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.hub.connection_count().await,
        uptime_seconds: uptime.as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenAlgorithm;
    use crate::directory::{ConnectionHistory, MemoryConnectionHistory, MemoryUserDirectory};
    use crate::store::{MemoryMessageLog, MemorySessionStore, MessageLog, SessionStore};
    use crate::token::TokenCodec;
    use axum::body::Body;
    use axum::http::Request;
    use jsonwebtoken::Algorithm;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_config() -> Config {
        Config {
            secret_key: Some("routes-test-secret".to_string()),
            algorithm: TokenAlgorithm::Hs256,
            rsa_private_key_pem: None,
            rsa_public_key_pem: None,
            token_ttl: Duration::from_secs(1800),
            message_window: 100,
            page_size: 20,
            keepalive_interval: Duration::from_secs(10),
            broadcast_include_sender: false,
            users: std::collections::HashMap::new(),
            port: 8080,
        }
    }

    fn test_state() -> (AppState, Arc<MemoryUserDirectory>) {
        let config = test_config();
        let store = Arc::new(MemorySessionStore::new()) as Arc<dyn SessionStore>;
        let codec = TokenCodec::hmac(b"routes-test-secret", Algorithm::HS256);
        let validator = Arc::new(SessionValidator::new(codec, store));

        let log = Arc::new(MemoryMessageLog::new(config.message_window)) as Arc<dyn MessageLog>;
        let history = Arc::new(MemoryConnectionHistory::new()) as Arc<dyn ConnectionHistory>;
        let hub = Arc::new(ConnectionHub::new(log, history, config.page_size));

        let directory = Arc::new(MemoryUserDirectory::new());
        let state = AppState::new(
            config,
            hub,
            validator,
            Arc::clone(&directory) as Arc<dyn UserDirectory>,
        );
        (state, directory)
    }

    #[tokio::test]
    async fn health_returns_ok_status() {
        let (state, _) = test_state();
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();

        assert_eq!(health.status, "ok");
        assert_eq!(health.connections, 0);
    }

    #[tokio::test]
    async fn chat_token_issued_for_known_user() {
        let (state, directory) = test_state();
        let identity = Identity::new(Uuid::new_v4(), "alice");
        directory.insert(identity.clone());
        let validator = Arc::clone(&state.validator);
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/chat-token")
                    .header("Content-Type", "application/json")
                    .body(Body::from(
                        serde_json::json!({ "user_id": identity.user_id }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let issued: ChatTokenResponse = serde_json::from_slice(&body).unwrap();

        let (resolved, valid) = validator.check(&issued.chat_token).await;
        assert!(valid);
        assert_eq!(resolved.unwrap().user_id, identity.user_id);
    }

    #[tokio::test]
    async fn chat_token_rejected_for_unknown_user() {
        let (state, _) = test_state();
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/chat-token")
                    .header("Content-Type", "application/json")
                    .body(Body::from(
                        serde_json::json!({ "user_id": Uuid::new_v4() }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn logout_revokes_session() {
        let (state, directory) = test_state();
        let identity = Identity::new(Uuid::new_v4(), "alice");
        directory.insert(identity.clone());

        let token = state
            .validator
            .issue_session(&identity, Duration::from_secs(1800))
            .await
            .unwrap();
        assert!(state.validator.check(&token).await.1);

        let validator = Arc::clone(&state.validator);
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/logout")
                    .header("Content-Type", "application/json")
                    .body(Body::from(
                        serde_json::json!({ "user_id": identity.user_id }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(!validator.check(&token).await.1);
    }

    #[test]
    fn session_cookie_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("cookie", "theme=dark; session=tok123; lang=en".parse().unwrap());
        assert_eq!(session_cookie(&headers), Some("tok123".to_string()));

        let mut headers = HeaderMap::new();
        headers.insert("cookie", "theme=dark".parse().unwrap());
        assert_eq!(session_cookie(&headers), None);

        let mut headers = HeaderMap::new();
        headers.insert("cookie", "session=".parse().unwrap());
        assert_eq!(session_cookie(&headers), None);

        assert_eq!(session_cookie(&HeaderMap::new()), None);
    }

    #[test]
    fn error_response_serializes_with_and_without_code() {
        let json = serde_json::to_string(&ErrorResponse::new("boom")).unwrap();
        assert!(json.contains("boom"));
        assert!(!json.contains("code"));

        let json = serde_json::to_string(&ErrorResponse::new("boom").with_code("upstream")).unwrap();
        assert!(json.contains("upstream"));
    }
}
