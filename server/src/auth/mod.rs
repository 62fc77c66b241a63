pub mod jwt;
pub mod middleware;

use std::sync::Arc;

use crate::db::models::UserId;

pub use jwt::JwtIdentityProvider;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("credential missing")]
    Missing,

    #[error("credential expired")]
    Expired,

    #[error("credential invalid: {0}")]
    Invalid(String),
}

/// Resolves an opaque credential into a user identity.
pub trait IdentityProvider: Send + Sync + 'static {
    fn authenticate(&self, credential: &str) -> Result<UserId, AuthError>;
}

pub type SharedIdentity = Arc<dyn IdentityProvider>;
