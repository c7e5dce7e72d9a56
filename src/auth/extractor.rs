use actix_web::{dev::Payload, http::header, web, FromRequest, HttpRequest};
use futures::future::LocalBoxFuture;
use uuid::Uuid;

use crate::error::{AppError, AuthError};
use crate::AppState;

/// Caller identity proven by a verified, unrevoked access token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
}

/// Token from an `Authorization: Bearer <token>` header.
fn bearer_token(req: &HttpRequest) -> Result<String, AuthError> {
    let value = req
        .headers()
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::Unauthorized)?
        .to_str()
        .map_err(|_| AuthError::Unauthorized)?;

    let mut parts = value.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") => Ok(token.to_string()),
        _ => Err(AuthError::Unauthorized),
    }
}

impl FromRequest for AuthUser {
    type Error = AppError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let req = req.clone();

        Box::pin(async move {
            let token = bearer_token(&req)?;
            let state = req
                .app_data::<web::Data<AppState>>()
                .ok_or_else(|| AppError::InternalError("application state is not configured".into()))?;

            let claims = state.session.verify_token(&token).await?;
            Ok(AuthUser {
                user_id: claims.user_id,
            })
        })
    }
}
