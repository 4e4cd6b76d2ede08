//! Passwordless sign-in: registration, magic links and sessions.

use super::tokens;
use crate::config::AuthConfig;
use crate::notify::{EmailError, EmailProvider};
use crate::services::{optional_text, text_field, ServiceError};
use crate::stores::{SessionRepository, StoreError, Stores, UserRepository};
use crate::types::{MagicLink, MagicLinkId, Role, Session, SessionId, User, UserId};
use blajarplus_core::environment::Clock;
use blajarplus_web::AppError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why an auth call failed.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Email address is malformed
    #[error("invalid email address")]
    InvalidEmail,

    /// Other input failed validation
    #[error("{0}")]
    Validation(String),

    /// An account with this email exists
    #[error("an account with this email already exists")]
    EmailTaken,

    /// Link unknown, used, expired or forged
    #[error("invalid or expired sign-in link")]
    InvalidLink,

    /// Session token unknown, expired or forged
    #[error("invalid or expired session")]
    InvalidSession,

    /// The sign-in email could not be sent
    #[error(transparent)]
    Email(#[from] EmailError),

    /// Storage backend failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ServiceError> for AuthError {
    fn from(e: ServiceError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        let message = e.to_string();
        match e {
            AuthError::InvalidEmail | AuthError::Validation(_) => Self::validation(message),
            AuthError::EmailTaken => Self::conflict(message),
            AuthError::InvalidLink | AuthError::InvalidSession => Self::unauthorized(message),
            AuthError::Email(source) => {
                Self::bad_gateway("could not send the sign-in email").with_source(source.into())
            }
            AuthError::Store(source) => ServiceError::from(source).into(),
        }
    }
}

/// Body of `POST /api/auth/register`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegisterRequest {
    /// Login email
    pub email: String,
    /// Display name
    pub name: String,
    /// `student` (default) or `tutor`
    #[serde(default)]
    pub role: Option<Role>,
    /// Contact phone
    #[serde(default)]
    pub phone: Option<String>,
}

/// Body of `PUT /api/users/me`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProfileChanges {
    /// New display name
    pub name: Option<String>,
    /// New phone; empty clears it
    pub phone: Option<String>,
    /// New avatar URL; empty clears it
    pub avatar_url: Option<String>,
}

/// A magic link that was just stored and mailed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedLink {
    /// `<id>.<secret>`
    pub token: String,
    /// Full URL sent by email
    pub url: String,
    /// Expiry
    pub expires_at: DateTime<Utc>,
}

/// A new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionGrant {
    /// Bearer token (`<id>.<secret>`)
    pub token: String,
    /// Expiry
    pub expires_at: DateTime<Utc>,
    /// Signed-in account
    pub user: User,
}

/// Where a sign-in came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    /// Client address
    pub ip_address: Option<String>,
    /// Client user agent
    pub user_agent: Option<String>,
}

/// Validate email address format.
///
/// One `@`, non-empty local part, a dotted domain without empty labels, and
/// 3..=255 characters drawn from a conservative set.
#[must_use]
pub fn is_valid_email(email: &str) -> bool {
    if email.len() < 3 || email.len() > 255 {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.is_empty() || domain.contains('@') || !domain.contains('.') {
        return false;
    }
    let local_ok = local
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '+' | '_'));
    let domain_ok = domain
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '.' | '-'));
    local_ok && domain_ok && domain.split('.').all(|label| !label.is_empty())
}

fn normalize_email(email: &str) -> Result<String, AuthError> {
    let email = email.trim().to_lowercase();
    if is_valid_email(&email) {
        Ok(email)
    } else {
        Err(AuthError::InvalidEmail)
    }
}

fn seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

/// Account and session operations.
#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn UserRepository>,
    sessions: Arc<dyn SessionRepository>,
    email: Arc<dyn EmailProvider>,
    clock: Arc<dyn Clock>,
    config: AuthConfig,
}

impl AuthService {
    /// Create the service.
    #[must_use]
    pub fn new(
        stores: &Stores,
        email: Arc<dyn EmailProvider>,
        clock: Arc<dyn Clock>,
        config: AuthConfig,
    ) -> Self {
        Self {
            users: Arc::clone(&stores.users),
            sessions: Arc::clone(&stores.sessions),
            email,
            clock,
            config,
        }
    }

    /// Whether magic links are echoed in API responses.
    #[must_use]
    pub const fn exposes_magic_links(&self) -> bool {
        self.config.expose_magic_links_for_testing
    }

    /// Create an account. Emails listed in `ADMIN_EMAILS` become admins.
    ///
    /// # Errors
    ///
    /// `InvalidEmail`, `Validation` for names and the admin role,
    /// `EmailTaken`.
    pub async fn register(&self, request: RegisterRequest) -> Result<User, AuthError> {
        let email = normalize_email(&request.email)?;
        let name = text_field("name", &request.name, 1, 100)?;
        let phone = validate_phone(request.phone.as_deref())?;
        let requested = request.role.unwrap_or(Role::Student);
        if requested == Role::Admin {
            return Err(AuthError::Validation(
                "role must be student or tutor".to_string(),
            ));
        }
        let role = if self.config.admin_emails.contains(&email) {
            Role::Admin
        } else {
            requested
        };

        let now = self.clock.now();
        let user = User {
            id: UserId::new(),
            email,
            name,
            role,
            phone,
            avatar_url: None,
            created_at: now,
            updated_at: now,
        };
        self.users.insert_user(&user).await.map_err(|e| match e {
            StoreError::Conflict(_) => AuthError::EmailTaken,
            other => other.into(),
        })?;
        info!(user_id = %user.id, role = %user.role, "User registered");
        Ok(user)
    }

    /// Store and mail a sign-in link.
    ///
    /// Returns `None` for unknown emails so callers cannot probe which
    /// addresses have accounts.
    ///
    /// # Errors
    ///
    /// `InvalidEmail`, `Email` when delivery fails.
    pub async fn request_magic_link(&self, email: &str) -> Result<Option<IssuedLink>, AuthError> {
        let email = normalize_email(email)?;
        if self.users.find_user_by_email(&email).await?.is_none() {
            debug!("Magic link requested for unknown email");
            return Ok(None);
        }

        let now = self.clock.now();
        let issued = tokens::issue();
        let link = MagicLink {
            id: MagicLinkId::from_uuid(issued.id),
            email: email.clone(),
            secret_hash: issued.secret_hash,
            created_at: now,
            expires_at: now + seconds(self.config.magic_link_ttl),
            consumed_at: None,
        };
        self.sessions.insert_magic_link(&link).await?;

        let url = format!(
            "{}/auth/verify?token={}",
            self.config.base_url.trim_end_matches('/'),
            issued.token
        );
        self.email
            .send_magic_link(&email, &url, link.expires_at)
            .await
            .inspect_err(|e| warn!(error = %e, "Failed to send magic link"))?;
        info!(link_id = %link.id, "Magic link issued");

        Ok(Some(IssuedLink {
            token: issued.token,
            url,
            expires_at: link.expires_at,
        }))
    }

    /// Exchange a magic link for a session. Each link works once.
    ///
    /// # Errors
    ///
    /// `InvalidLink` for unknown, consumed, expired or forged links.
    pub async fn verify(&self, token: &str, client: ClientInfo) -> Result<SessionGrant, AuthError> {
        let (id, secret) = tokens::parse(token).ok_or(AuthError::InvalidLink)?;
        let link_id = MagicLinkId::from_uuid(id);
        let link = self
            .sessions
            .get_magic_link(link_id)
            .await?
            .ok_or(AuthError::InvalidLink)?;
        let now = self.clock.now();
        if !tokens::secret_matches(secret, &link.secret_hash) {
            warn!(link_id = %link_id, "Magic link secret mismatch");
            return Err(AuthError::InvalidLink);
        }
        if link.consumed_at.is_some() || now >= link.expires_at {
            return Err(AuthError::InvalidLink);
        }
        if !self.sessions.consume_magic_link(link_id, now).await? {
            return Err(AuthError::InvalidLink);
        }
        let user = self
            .users
            .find_user_by_email(&link.email)
            .await?
            .ok_or(AuthError::InvalidLink)?;

        let issued = tokens::issue();
        let session = Session {
            id: SessionId::from_uuid(issued.id),
            user_id: user.id,
            secret_hash: issued.secret_hash,
            created_at: now,
            expires_at: now + seconds(self.config.session_ttl),
            ip_address: client.ip_address,
            user_agent: client.user_agent,
        };
        self.sessions.insert_session(&session).await?;
        info!(user_id = %user.id, session_id = %session.id, "Session created");

        Ok(SessionGrant {
            token: issued.token,
            expires_at: session.expires_at,
            user,
        })
    }

    /// Resolve a bearer token to its account.
    ///
    /// # Errors
    ///
    /// `InvalidSession` for unknown, expired or forged tokens.
    pub async fn authenticate(&self, token: &str) -> Result<(User, SessionId), AuthError> {
        let (id, secret) = tokens::parse(token).ok_or(AuthError::InvalidSession)?;
        let session_id = SessionId::from_uuid(id);
        let session = self
            .sessions
            .get_session(session_id)
            .await?
            .ok_or(AuthError::InvalidSession)?;
        if !tokens::secret_matches(secret, &session.secret_hash)
            || self.clock.now() >= session.expires_at
        {
            return Err(AuthError::InvalidSession);
        }
        let user = self
            .users
            .get_user(session.user_id)
            .await?
            .ok_or(AuthError::InvalidSession)?;
        Ok((user, session_id))
    }

    /// End a session.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn logout(&self, session: SessionId) -> Result<(), AuthError> {
        self.sessions.delete_session(session).await?;
        info!(session_id = %session, "Session ended");
        Ok(())
    }

    /// Change the caller's name, phone or avatar.
    ///
    /// # Errors
    ///
    /// `Validation`.
    pub async fn update_profile(&self, user: &User, changes: ProfileChanges) -> Result<User, AuthError> {
        let mut updated = user.clone();
        if let Some(name) = changes.name {
            updated.name = text_field("name", &name, 1, 100)?;
        }
        if let Some(phone) = changes.phone {
            updated.phone = validate_phone(Some(&phone))?;
        }
        if let Some(url) = changes.avatar_url {
            let url = optional_text("avatar_url", Some(&url), 500)?;
            if url
                .as_deref()
                .is_some_and(|u| !(u.starts_with("https://") || u.starts_with("http://")))
            {
                return Err(AuthError::Validation(
                    "avatar_url must be an http(s) URL".to_string(),
                ));
            }
            updated.avatar_url = url;
        }
        updated.updated_at = self.clock.now();
        self.users.update_user(&updated).await?;
        Ok(updated)
    }

    /// Drop expired sessions and links.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn purge_expired(&self) -> Result<u64, AuthError> {
        Ok(self.sessions.purge_expired(self.clock.now()).await?)
    }
}

fn validate_phone(phone: Option<&str>) -> Result<Option<String>, AuthError> {
    let phone = optional_text("phone", phone, 20)?;
    if phone.as_deref().is_some_and(|p| {
        !p.chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | ' '))
    }) {
        return Err(AuthError::Validation(
            "phone may only contain digits, spaces, '+' and '-'".to_string(),
        ));
    }
    Ok(phone)
}

impl std::fmt::Debug for AuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthService")
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::notify::ConsoleEmailProvider;
    use blajarplus_testing::{test_clock, ManualClock};

    fn service(clock: &ManualClock) -> AuthService {
        let (stores, _) = Stores::memory();
        let mut config = Config::from_lookup(|_| None).auth;
        config.admin_emails = vec!["ops@blajarplus.id".to_string()];
        AuthService::new(
            &stores,
            Arc::new(ConsoleEmailProvider::new()),
            Arc::new(clock.clone()),
            config,
        )
    }

    fn registration(email: &str, role: Option<Role>) -> RegisterRequest {
        RegisterRequest {
            email: email.to_string(),
            name: "Siti Rahma".to_string(),
            role,
            phone: Some("+62 812-3456".to_string()),
        }
    }

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("user@example.com"));
        assert!(is_valid_email("user+tag@sub.example.co.id"));
        assert!(!is_valid_email("invalid"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("user@"));
        assert!(!is_valid_email("user@localhost"));
        assert!(!is_valid_email("user@example..com"));
        assert!(!is_valid_email("a@b@example.com"));
    }

    #[tokio::test]
    async fn test_register_rules() {
        let clock = ManualClock::new(test_clock().now());
        let auth = service(&clock);

        let user = auth
            .register(registration(" Siti@Example.com ", None))
            .await
            .unwrap();
        assert_eq!(user.email, "siti@example.com");
        assert_eq!(user.role, Role::Student);

        assert!(matches!(
            auth.register(registration("siti@example.com", Some(Role::Tutor))).await,
            Err(AuthError::EmailTaken)
        ));
        assert!(matches!(
            auth.register(registration("x@example.com", Some(Role::Admin))).await,
            Err(AuthError::Validation(_))
        ));
        assert!(matches!(
            auth.register(registration("nope", None)).await,
            Err(AuthError::InvalidEmail)
        ));

        let admin = auth.register(registration("ops@blajarplus.id", None)).await.unwrap();
        assert_eq!(admin.role, Role::Admin);
    }

    #[tokio::test]
    async fn test_magic_link_is_single_use() {
        let clock = ManualClock::new(test_clock().now());
        let auth = service(&clock);
        let user = auth.register(registration("siti@example.com", None)).await.unwrap();

        let link = auth.request_magic_link("SITI@example.com").await.unwrap().unwrap();
        assert!(link.url.ends_with(&link.token));

        let grant = auth.verify(&link.token, ClientInfo::default()).await.unwrap();
        assert_eq!(grant.user.id, user.id);
        assert!(matches!(
            auth.verify(&link.token, ClientInfo::default()).await,
            Err(AuthError::InvalidLink)
        ));

        let (me, session) = auth.authenticate(&grant.token).await.unwrap();
        assert_eq!(me.id, user.id);
        auth.logout(session).await.unwrap();
        assert!(matches!(
            auth.authenticate(&grant.token).await,
            Err(AuthError::InvalidSession)
        ));
    }

    #[tokio::test]
    async fn test_expired_and_forged_tokens() {
        let clock = ManualClock::new(test_clock().now());
        let auth = service(&clock);
        auth.register(registration("siti@example.com", None)).await.unwrap();

        assert!(auth.request_magic_link("ghost@example.com").await.unwrap().is_none());

        let link = auth.request_magic_link("siti@example.com").await.unwrap().unwrap();
        let (id, _) = tokens::parse(&link.token).unwrap();
        assert!(matches!(
            auth.verify(&format!("{id}.forged"), ClientInfo::default()).await,
            Err(AuthError::InvalidLink)
        ));

        clock.advance(Duration::minutes(16));
        assert!(matches!(
            auth.verify(&link.token, ClientInfo::default()).await,
            Err(AuthError::InvalidLink)
        ));

        let fresh = auth.request_magic_link("siti@example.com").await.unwrap().unwrap();
        let grant = auth.verify(&fresh.token, ClientInfo::default()).await.unwrap();
        clock.advance(Duration::days(8));
        assert!(matches!(
            auth.authenticate(&grant.token).await,
            Err(AuthError::InvalidSession)
        ));
    }

    #[tokio::test]
    async fn test_update_profile() {
        let clock = ManualClock::new(test_clock().now());
        let auth = service(&clock);
        let user = auth.register(registration("siti@example.com", None)).await.unwrap();

        let changes = ProfileChanges {
            name: Some("Siti R.".to_string()),
            phone: Some(String::new()),
            avatar_url: Some("https://cdn.example.com/siti.png".to_string()),
        };
        let updated = auth.update_profile(&user, changes).await.unwrap();
        assert_eq!(updated.name, "Siti R.");
        assert_eq!(updated.phone, None);

        let bad = ProfileChanges {
            avatar_url: Some("javascript:alert(1)".to_string()),
            ..ProfileChanges::default()
        };
        assert!(matches!(
            auth.update_profile(&user, bad).await,
            Err(AuthError::Validation(_))
        ));
    }
}
