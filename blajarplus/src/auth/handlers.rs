//! HTTP handlers for sign-in and the caller's account.

use super::middleware::SessionUser;
use super::service::{ClientInfo, ProfileChanges, RegisterRequest, SessionGrant};
use crate::server::state::AppState;
use crate::types::User;
use axum::{extract::State, http::StatusCode, Json};
use blajarplus_web::{ApiJson, ClientIp, UserAgent, WebResult};
use serde::{Deserialize, Serialize};

/// Request to send a magic link.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SendMagicLinkRequest {
    /// Email address to send magic link to.
    pub email: String,
}

/// Response after requesting a magic link.
///
/// The same message is returned whether or not the email has an account.
#[derive(Debug, Clone, Serialize)]
pub struct SendMagicLinkResponse {
    /// Confirmation message.
    pub message: String,

    /// **TESTING ONLY**: the magic link token, present only when
    /// `AUTH_EXPOSE_MAGIC_LINKS_FOR_TESTING=true` and the account exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub magic_link_token: Option<String>,
}

/// Request to exchange a magic link for a session.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyMagicLinkRequest {
    /// `<id>.<secret>` from the link
    pub token: String,
}

/// Create an account.
///
/// ```text
/// POST /api/auth/register
/// {"email": "siti@example.com", "name": "Siti", "role": "student"}
/// ```
pub async fn register(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<RegisterRequest>,
) -> WebResult<(StatusCode, Json<User>)> {
    let user = state.auth.register(request).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// Send a sign-in link by email.
///
/// ```text
/// POST /api/auth/magic-link
/// {"email": "siti@example.com"}
/// ```
pub async fn send_magic_link(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<SendMagicLinkRequest>,
) -> WebResult<Json<SendMagicLinkResponse>> {
    let issued = state.auth.request_magic_link(&request.email).await?;
    let magic_link_token = issued
        .filter(|_| state.auth.exposes_magic_links())
        .map(|link| link.token);
    Ok(Json(SendMagicLinkResponse {
        message: "If the email is registered, a sign-in link is on its way.".to_string(),
        magic_link_token,
    }))
}

/// Exchange a magic link for a bearer session token.
pub async fn verify_magic_link(
    State(state): State<AppState>,
    client_ip: ClientIp,
    user_agent: UserAgent,
    ApiJson(request): ApiJson<VerifyMagicLinkRequest>,
) -> WebResult<Json<SessionGrant>> {
    let client = ClientInfo {
        ip_address: Some(client_ip.0.to_string()),
        user_agent: Some(user_agent.0),
    };
    Ok(Json(state.auth.verify(&request.token, client).await?))
}

/// End the current session.
pub async fn logout(State(state): State<AppState>, session: SessionUser) -> WebResult<StatusCode> {
    state.auth.logout(session.session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// The signed-in account.
#[allow(clippy::unused_async)]
pub async fn me(session: SessionUser) -> Json<User> {
    Json(session.user)
}

/// Update the signed-in account.
pub async fn update_me(
    State(state): State<AppState>,
    session: SessionUser,
    ApiJson(changes): ApiJson<ProfileChanges>,
) -> WebResult<Json<User>> {
    Ok(Json(state.auth.update_profile(&session.user, changes).await?))
}
