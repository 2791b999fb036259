//! The technician a request acts on behalf of.
//!
//! Sign-in sits in front of this service, which passes the technician's id
//! in the `X-User-Id` header. Requests without it act anonymously.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use std::sync::Arc;

use super::error::ApiError;
use crate::db::User;
use crate::AppState;

pub const ACTOR_HEADER: &str = "x-user-id";

#[derive(Debug, Clone, Default)]
pub struct Actor(pub Option<User>);

impl Actor {
    pub fn id(&self) -> Option<i64> {
        self.0.as_ref().map(|u| u.id)
    }

    pub fn is_admin(&self) -> bool {
        self.0.as_ref().is_some_and(User::is_admin)
    }

    pub fn user(&self) -> Option<&User> {
        self.0.as_ref()
    }

    /// Require an identified technician
    pub fn require(&self) -> Result<&User, ApiError> {
        self.0
            .as_ref()
            .ok_or_else(|| ApiError::bad_request("X-User-Id header is required"))
    }

    pub fn require_admin(&self, message: &str) -> Result<&User, ApiError> {
        let user = self.require()?;
        if !user.is_admin() {
            return Err(ApiError::forbidden(message));
        }
        Ok(user)
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Actor {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(raw) = parts.headers.get(ACTOR_HEADER) else {
            return Ok(Actor(None));
        };
        let id: i64 = raw
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| ApiError::bad_request("Invalid X-User-Id header"))?;
        let user = User::find(&state.db, id)
            .await?
            .filter(|u| u.is_active)
            .ok_or_else(|| ApiError::bad_request("Unknown or inactive technician"))?;
        Ok(Actor(Some(user)))
    }
}
