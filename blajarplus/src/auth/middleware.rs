//! Authentication extractors.
//!
//! - [`BearerToken`]: raw `Authorization: Bearer <token>` value
//! - [`SessionUser`]: resolves the token to an account (401 otherwise)
//! - [`MaybeUser`]: like `SessionUser`, but anonymous requests are allowed
//! - [`RequireAdmin`], [`RequireTutor`]: role gates (403 otherwise)
//!
//! ```rust,ignore
//! async fn earnings(RequireTutor(tutor): RequireTutor, State(state): State<AppState>) -> ... {
//!     state.tutors.earnings(&tutor).await
//! }
//! ```

use crate::server::state::AppState;
use crate::types::{Role, SessionId, User};
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use blajarplus_web::AppError;

/// Bearer token extracted from `Authorization: Bearer <token>` header.
#[derive(Debug, Clone)]
pub struct BearerToken(pub String);

impl BearerToken {
    fn from_parts(parts: &Parts) -> Result<Option<Self>, AppError> {
        let Some(header) = parts.headers.get("authorization") else {
            return Ok(None);
        };
        let header = header
            .to_str()
            .map_err(|_| AppError::unauthorized("Invalid authorization header"))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| {
                AppError::unauthorized("Invalid authorization format. Expected 'Bearer <token>'")
            })?
            .trim();
        if token.is_empty() {
            return Err(AppError::unauthorized("Empty bearer token"));
        }
        Ok(Some(Self(token.to_string())))
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for BearerToken
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Self::from_parts(parts)?.ok_or_else(|| AppError::unauthorized("Missing authorization header"))
    }
}

/// Authenticated account.
#[derive(Debug, Clone)]
pub struct SessionUser {
    /// The signed-in user
    pub user: User,
    /// Session the token belongs to
    pub session_id: SessionId,
}

#[async_trait]
impl FromRequestParts<AppState> for SessionUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let BearerToken(token) = BearerToken::from_request_parts(parts, state).await?;
        let (user, session_id) = state.auth.authenticate(&token).await?;
        Ok(Self { user, session_id })
    }
}

/// The signed-in account, if the request carries a token.
#[derive(Debug, Clone)]
pub struct MaybeUser(pub Option<User>);

#[async_trait]
impl FromRequestParts<AppState> for MaybeUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        match BearerToken::from_parts(parts)? {
            Some(BearerToken(token)) => {
                let (user, _) = state.auth.authenticate(&token).await?;
                Ok(Self(Some(user)))
            }
            None => Ok(Self(None)),
        }
    }
}

/// Require admin role.
#[derive(Debug, Clone)]
pub struct RequireAdmin(pub User);

#[async_trait]
impl FromRequestParts<AppState> for RequireAdmin {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let SessionUser { user, .. } = SessionUser::from_request_parts(parts, state).await?;
        if user.role == Role::Admin {
            Ok(Self(user))
        } else {
            Err(AppError::forbidden("Admin role required"))
        }
    }
}

/// Require tutor role.
#[derive(Debug, Clone)]
pub struct RequireTutor(pub User);

#[async_trait]
impl FromRequestParts<AppState> for RequireTutor {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let SessionUser { user, .. } = SessionUser::from_request_parts(parts, state).await?;
        if user.role == Role::Tutor {
            Ok(Self(user))
        } else {
            Err(AppError::forbidden("Tutor role required"))
        }
    }
}
