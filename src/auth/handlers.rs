use actix_web::{web, HttpResponse};
use serde::Deserialize;
use tracing::info;

use crate::auth::extractor::AuthUser;
use crate::auth::service::Credentials;
use crate::auth::token::TokenPair;
use crate::error::AppError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

pub async fn login(
    req: web::Json<Credentials>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let pair = state.session.authenticate(&req).await?;
    Ok(HttpResponse::Ok().json(pair))
}

pub async fn refresh(
    req: web::Json<RefreshRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let pair = state.session.refresh_token(&req.refresh_token).await?;
    Ok(HttpResponse::Ok().json(pair))
}

pub async fn logout(
    user: AuthUser,
    req: web::Json<TokenPair>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    info!(user_id = %user.user_id, "Received logout request");
    state.session.logout(user.user_id, &req).await?;
    Ok(HttpResponse::Ok().finish())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/auth")
            .route("/login", web::post().to(login))
            .route("/refresh", web::post().to(refresh))
            .route("/logout", web::post().to(logout)),
    );
}
