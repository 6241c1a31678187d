//! Bearer-token authentication (spec.md §4.9: "all endpoints other than
//! `/auth/register` and `/health` require a valid, unexpired bearer token
//! whose associated PeerId matches when that PeerId appears in the path").

use crate::{ApiError, AppState};
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use meshnet_model::PeerId;
use rand::RngCore;

/// Default token lifetime, per spec.md §4.9 "default TTL 24 hours".
pub const DEFAULT_TOKEN_TTL: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Extractor proving the request carried a valid bearer token. Handlers
/// whose path names a `peer_id` compare it against `self.0` themselves and
/// return [`ApiError::Forbidden`] on mismatch, since only the handler
/// knows which path segment is the relevant one.
pub struct AuthenticatedPeer(pub PeerId);

impl FromRequestParts<AppState> for AuthenticatedPeer {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or(ApiError::Unauthorized)?;
        let value = header.to_str().map_err(|_| ApiError::Unauthorized)?;
        let token = value.strip_prefix("Bearer ").ok_or(ApiError::Unauthorized)?;

        let peer_id = crate::db::lookup_token(&state.pool, token)
            .await?
            .ok_or(ApiError::Unauthorized)?;

        Ok(AuthenticatedPeer(peer_id))
    }
}

impl AuthenticatedPeer {
    /// Fails with `Forbidden` unless the authenticated peer matches the
    /// peer named in the request path.
    pub fn require_matches(&self, path_peer_id: PeerId) -> Result<(), ApiError> {
        if self.0 == path_peer_id {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }
}
