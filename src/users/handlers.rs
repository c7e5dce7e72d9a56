use actix_web::{web, HttpResponse};
use serde_json::json;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::{AppError, AuthError};
use crate::users::service::{AvailabilityQuery, DeleteRequest, NewAccount, UpdateRequest};
use crate::AppState;

pub async fn registration(
    req: web::Json<NewAccount>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    state.users.register(req.into_inner()).await?;
    Ok(HttpResponse::Created().json(json!({ "msg": "successful" })))
}

pub async fn verify(
    path: web::Path<(Uuid, String)>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let (user_id, code) = path.into_inner();
    state.users.verify_email(user_id, &code).await?;
    Ok(HttpResponse::Ok().json(json!({ "msg": "email verified" })))
}

pub async fn available(
    req: web::Json<AvailabilityQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    if state.users.available(&req).await? {
        return Ok(HttpResponse::Ok().json(json!({ "msg": "available" })));
    }
    match req.into_inner() {
        AvailabilityQuery::Email { .. } => Err(AuthError::EmailBusy.into()),
        AvailabilityQuery::Username { .. } => Err(AuthError::UsernameBusy.into()),
    }
}

pub async fn me(user: AuthUser, state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let profile = state.users.me(user.user_id).await?;
    Ok(HttpResponse::Ok().json(profile))
}

pub async fn update(
    user: AuthUser,
    req: web::Json<UpdateRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let profile = state.users.update(user.user_id, req.into_inner()).await?;
    Ok(HttpResponse::Ok().json(profile))
}

pub async fn delete(
    user: AuthUser,
    req: web::Json<DeleteRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    state.users.delete(user.user_id, &req).await?;
    Ok(HttpResponse::NoContent().finish())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/user")
            .route("/registration", web::post().to(registration))
            .route("/registration/verify/{user_id}/{code}", web::get().to(verify))
            .route("/available", web::post().to(available))
            .route("/me", web::get().to(me))
            .route("/update", web::patch().to(update))
            .route("/delete", web::delete().to(delete)),
    );
}
