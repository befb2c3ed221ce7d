//! Authentication seam. The capture core only needs "who is calling"; how
//! credentials are checked is up to the injected [`Authenticator`].

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use subtle::ConstantTimeEq;

use crate::{api::AppState, errors::AppError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AppError>;
}

/// Single operator account checked against HTTP Basic credentials.
pub struct BasicAuthenticator {
    user: String,
    pass: String,
}

impl BasicAuthenticator {
    pub fn new(user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            pass: pass.into(),
        }
    }
}

#[async_trait]
impl Authenticator for BasicAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AppError> {
        let unauthorized =
            || AppError::Unauthorized("Missing or invalid authorization header".into());

        let encoded = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Basic "))
            .ok_or_else(unauthorized)?;
        let decoded = BASE64.decode(encoded.trim()).map_err(|_| unauthorized())?;
        let decoded = String::from_utf8(decoded).map_err(|_| unauthorized())?;
        let (user, pass) = decoded.split_once(':').ok_or_else(unauthorized)?;

        // Both comparisons always run so timing does not reveal which one failed.
        let user_ok = user.as_bytes().ct_eq(self.user.as_bytes());
        let pass_ok = pass.as_bytes().ct_eq(self.pass.as_bytes());
        if bool::from(user_ok & pass_ok) {
            Ok(Principal { id: user.to_owned() })
        } else {
            Err(AppError::Unauthorized("Invalid credentials".into()))
        }
    }
}

/// Extractor yielding the authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthPrincipal(pub Principal);

impl FromRequestParts<AppState> for AuthPrincipal {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let principal = state.auth.authenticate(&parts.headers).await?;
        Ok(AuthPrincipal(principal))
    }
}
