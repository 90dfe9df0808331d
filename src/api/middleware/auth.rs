use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::api::error::ApiError;
use crate::core::UserId;

/// Header the upstream gateway sets after validating the caller's token.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Id of the calling user, taken from [`USER_ID_HEADER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor(pub UserId);

impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| ApiError::Unauthenticated(format!("missing {USER_ID_HEADER} header")))?;
        raw.to_str()
            .ok()
            .and_then(|v| v.trim().parse::<UserId>().ok())
            .map(Actor)
            .ok_or_else(|| ApiError::Unauthenticated(format!("malformed {USER_ID_HEADER} header")))
    }
}
