//! Passwordless authentication.
//!
//! Users sign in with single-use magic links; a verified link becomes a
//! bearer session. Both are `<id>.<secret>` tokens whose secrets are only
//! stored as SHA-256 hashes.

pub mod handlers;
pub mod middleware;
pub mod service;
pub mod tokens;

pub use middleware::{MaybeUser, RequireAdmin, RequireTutor, SessionUser};
pub use service::{AuthError, AuthService, ClientInfo, ProfileChanges, RegisterRequest, SessionGrant};
