//! Per-call authentication and role checks.
//!
//! [`authenticate`] wraps every route. Paths on the public allow-list pass through untouched;
//! everything else needs `Authorization: Bearer <token>`, which is validated before the handler
//! body runs. The resulting [`CallContext`] lives in the request extensions for exactly one call
//! and handlers obtain it through the [`Caller`] extractor.

use crate::{ApiError, AppState};
use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use grid_core::auth::AuthError;
use grid_core::role::Capability;
use grid_core::{Principal, Role};

#[derive(Debug, Clone)]
pub struct CallContext {
    pub principal: Principal,
}

impl CallContext {
    pub fn role(&self) -> Role {
        self.principal.role
    }

    pub fn has_role(&self, required: &[Role]) -> bool {
        required.contains(&self.principal.role)
    }

    /// `PermissionDenied` naming the roles that would have been accepted.
    pub fn require_role(&self, required: &[Role]) -> Result<(), ApiError> {
        if self.has_role(required) {
            return Ok(());
        }
        tracing::info!(
            event = "grid.interceptor.permission_denied",
            subject = %self.principal.subject,
            role = %self.principal.role,
            required = ?required,
            "permission denied"
        );
        Err(ApiError::permission_denied(required.to_vec()))
    }

    pub fn require(&self, capability: Capability) -> Result<(), ApiError> {
        self.require_role(&capability.granted_to())
    }
}

/// Handler-side access to the current [`CallContext`].
///
/// A missing context means a route was mounted outside [`authenticate`] or is public; that is a
/// wiring bug, reported as a 500 rather than treated as "no role".
#[derive(Debug, Clone)]
pub struct Caller(pub CallContext);

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts.extensions.get::<CallContext>() {
            Some(ctx) => Ok(Caller(ctx.clone())),
            None => {
                tracing::error!(
                    event = "grid.interceptor.context_missing",
                    path = %parts.uri.path(),
                    "role check without an active call context"
                );
                Err(ApiError::internal("missing call context"))
            }
        }
    }
}

pub async fn authenticate(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let path = req.uri().path();
    if state.public_methods.iter().any(|p| p == path) {
        return next.run(req).await;
    }

    let token = match bearer_token(req.headers()) {
        Ok(token) => token.to_string(),
        Err(err) => {
            tracing::info!(
                event = "grid.interceptor.unauthenticated",
                path = %path,
                reason = err.message(),
                "rejected call without bearer token"
            );
            return err.into_response();
        }
    };

    match state.validator.validate_bearer(&token).await {
        Ok(principal) => {
            tracing::debug!(
                event = "grid.interceptor.authenticated",
                path = %req.uri().path(),
                subject = %principal.subject,
                issuer = %principal.issuer,
                role = %principal.role,
                "call authenticated"
            );
            req.extensions_mut().insert(CallContext { principal });
            next.run(req).await
        }
        Err(err) => {
            if err.is_configuration() {
                tracing::warn!(
                    event = "grid.interceptor.untrusted_issuer",
                    path = %req.uri().path(),
                    error = %err,
                    "token from an issuer this grid does not trust"
                );
            } else {
                tracing::info!(
                    event = "grid.interceptor.unauthenticated",
                    path = %req.uri().path(),
                    error = %err,
                    "token rejected"
                );
            }
            ApiError::unauthorized(auth_message(&err)).into_response()
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing authorization"))?;

    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::unauthorized("invalid authorization"))
}

fn auth_message(err: &AuthError) -> &'static str {
    match err {
        AuthError::Expired => "token expired",
        AuthError::NotYetValid => "token not yet valid",
        AuthError::UnknownIssuer(_) => "untrusted token issuer",
        AuthError::KeySourceUnavailable(_) => "identity provider unavailable",
        AuthError::Malformed(_) | AuthError::Signature(_) | AuthError::Claims(_) => {
            "invalid token"
        }
    }
}
