//! `POST /api/claim` — the dashboard's pairing-code redemption endpoint
//! (spec §3: "EntryKeys are created by the pairing endpoint, redeemed by
//! the dashboard"). Translates `pairing::claim_entry_key`'s `ClaimError`
//! taxonomy onto the control API's error responses.

use axum::extract::State;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::control::ApiKeyAuth;
use crate::error::{Error, Result};
use crate::pairing::ClaimError;

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub serial: String,
    pub claimed_at: Option<i64>,
}

impl From<ClaimError> for Error {
    fn from(err: ClaimError) -> Self {
        match err {
            ClaimError::NotFound => Error::NotFound("pairing code not found".into()),
            ClaimError::Expired => Error::NotFound("pairing code expired".into()),
            ClaimError::AlreadyClaimedByOther => {
                Error::Conflict("pairing code already claimed by another user".into())
            }
            ClaimError::AlreadyLinked => {
                Error::Conflict("device already linked to another user".into())
            }
            ClaimError::Store(err) => Error::StoreUnavailable(err.to_string()),
        }
    }
}

pub async fn claim(
    State(state): State<AppState>,
    ApiKeyAuth(caller): ApiKeyAuth,
    axum::Json(body): axum::Json<ClaimRequest>,
) -> Result<axum::Json<ClaimResponse>> {
    let claimed = crate::pairing::claim_entry_key(state.store.as_ref(), &body.code, &caller.user_id)
        .await?;

    Ok(axum::Json(ClaimResponse {
        serial: claimed.serial,
        claimed_at: claimed.claimed_at,
    }))
}
