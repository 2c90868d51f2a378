pub mod jwt;
pub mod password;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::{error::AppError, state::AppState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub email: String,
    pub plan: String,
}

/// The identity a request acts as. The service principal bypasses per-user row filters.
#[derive(Debug, Clone)]
pub enum Principal {
    User(AuthenticatedUser),
    Service,
}

impl Principal {
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Principal::User(user) => Some(user.user_id),
            Principal::Service => None,
        }
    }

    pub fn is_service(&self) -> bool {
        matches!(self, Principal::Service)
    }

    pub fn can_access(&self, owner_id: Uuid) -> bool {
        match self {
            Principal::User(user) => user.user_id == owner_id,
            Principal::Service => true,
        }
    }

    pub fn require_user(&self) -> Result<&AuthenticatedUser, AppError> {
        match self {
            Principal::User(user) => Ok(user),
            Principal::Service => Err(AppError::forbidden()),
        }
    }

    pub fn require_service(&self) -> Result<(), AppError> {
        if self.is_service() {
            Ok(())
        } else {
            Err(AppError::forbidden())
        }
    }
}

/// Compares fixed-size digests so the time taken does not depend on where the
/// token first differs from the key.
fn service_key_matches(token: &str, service_key: &str) -> bool {
    let presented = Sha256::digest(token.as_bytes());
    let expected = Sha256::digest(service_key.as_bytes());
    presented
        .iter()
        .zip(expected.iter())
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

/// Resolves a raw bearer token into a principal.
pub fn resolve_principal(state: &AppState, token: &str) -> Result<Principal, AppError> {
    if let Some(service_key) = state.config.service_role_key.as_deref() {
        if service_key_matches(token, service_key) {
            return Ok(Principal::Service);
        }
    }

    let claims = state
        .jwt
        .verify_token(token)
        .map_err(|_| AppError::unauthorized())?;

    Ok(Principal::User(AuthenticatedUser {
        user_id: claims.sub,
        email: claims.email,
        plan: claims.plan,
    }))
}

#[async_trait]
impl FromRequestParts<AppState> for Principal {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::unauthorized())?;

        resolve_principal(state, bearer.token())
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        match Principal::from_request_parts(parts, state).await? {
            Principal::User(user) => Ok(user),
            Principal::Service => {
                warn!(path = %parts.uri.path(), "service principal used on a user-only route");
                Err(AppError::forbidden())
            }
        }
    }
}
