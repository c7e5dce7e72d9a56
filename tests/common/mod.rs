#![allow(dead_code)]

use std::sync::Arc;

use account_service::auth::RateLimit;
use account_service::cache::{Cache, MemoryCache};
use account_service::db::{MemoryUserRepository, UserFilter, UserRepository};
use account_service::users::{LogNotifier, VerificationCode};
use account_service::{configure, AppState, Settings};
use actix_http::Request;
use actix_web::body::MessageBody;
use actix_web::dev::{Service, ServiceFactory, ServiceRequest, ServiceResponse};
use actix_web::http::{header, StatusCode};
use actix_web::{test, web, App};
use serde_json::{json, Value};
use uuid::Uuid;

pub const PASSWORD: &str = "pw123456";

/// In-memory backends plus handles to inspect them.
pub struct TestContext {
    pub state: AppState,
    pub cache: MemoryCache,
    pub repository: MemoryUserRepository,
}

pub fn context() -> TestContext {
    context_with(Settings::new_for_test().expect("Failed to load test config"))
}

pub fn context_with(settings: Settings) -> TestContext {
    let cache = MemoryCache::new();
    let repository = MemoryUserRepository::new();
    let state = AppState::from_parts(
        settings,
        Arc::new(cache.clone()),
        Arc::new(repository.clone()),
        Arc::new(LogNotifier),
    )
    .expect("Failed to build app state");

    TestContext {
        state,
        cache,
        repository,
    }
}

pub fn build_app(
    state: AppState,
) -> App<
    impl ServiceFactory<
        ServiceRequest,
        Config = (),
        Response = ServiceResponse<impl MessageBody>,
        Error = actix_web::Error,
        InitError = (),
    >,
> {
    let limiter = state.rate_limiter.clone();
    App::new()
        .wrap(RateLimit::new(limiter))
        .app_data(web::Data::new(state))
        .configure(configure)
}

/// Send a request, turning middleware errors into their HTTP responses.
pub async fn call<S, B>(app: &S, req: Request) -> (StatusCode, Value)
where
    S: Service<Request, Response = ServiceResponse<B>, Error = actix_web::Error>,
    B: MessageBody + 'static,
{
    let response = match app.call(req).await {
        Ok(resp) => resp.map_into_boxed_body(),
        Err(err) => ServiceResponse::new(
            test::TestRequest::default().to_http_request(),
            err.as_response_error().error_response(),
        ),
    };
    let status = response.status();
    let body = test::read_body(response).await;
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

pub fn error_code(body: &Value) -> &str {
    body["error"]["code"].as_str().unwrap_or_default()
}

pub fn post(uri: &str, body: Value, bearer: Option<&str>) -> Request {
    with_bearer(test::TestRequest::post().uri(uri).set_json(body), bearer).to_request()
}

pub fn get(uri: &str, bearer: Option<&str>) -> Request {
    with_bearer(test::TestRequest::get().uri(uri), bearer).to_request()
}

pub fn patch(uri: &str, body: Value, bearer: Option<&str>) -> Request {
    with_bearer(test::TestRequest::patch().uri(uri).set_json(body), bearer).to_request()
}

pub fn delete(uri: &str, body: Value, bearer: Option<&str>) -> Request {
    with_bearer(test::TestRequest::delete().uri(uri).set_json(body), bearer).to_request()
}

fn with_bearer(req: test::TestRequest, bearer: Option<&str>) -> test::TestRequest {
    match bearer {
        Some(token) => req.insert_header((header::AUTHORIZATION, format!("Bearer {}", token))),
        None => req,
    }
}

pub async fn register<S, B>(app: &S, username: &str, email: &str) -> (StatusCode, Value)
where
    S: Service<Request, Response = ServiceResponse<B>, Error = actix_web::Error>,
    B: MessageBody + 'static,
{
    let body = json!({ "username": username, "email": email, "password": PASSWORD, "is_superuser": false });
    call(app, post("/v1/user/registration", body, None)).await
}

pub async fn user_id(ctx: &TestContext, username: &str) -> Uuid {
    let mut uow = ctx.repository.begin().await.unwrap();
    let user = uow
        .find_one(&UserFilter::Username(username.to_string()))
        .await
        .unwrap()
        .expect("user exists");
    uow.rollback().await.unwrap();
    user.id
}

pub async fn pending_code(ctx: &TestContext, user_id: Uuid) -> VerificationCode {
    let raw = ctx
        .cache
        .get(&user_id.simple().to_string())
        .await
        .unwrap()
        .expect("verification code stored");
    serde_json::from_str(&raw).unwrap()
}

pub fn verify_uri(user_id: Uuid, code: &str) -> String {
    format!("/v1/user/registration/verify/{}/{}", user_id.simple(), code)
}

/// Register and verify a user; returns its id.
pub async fn verified_user<S, B>(app: &S, ctx: &TestContext, username: &str, email: &str) -> Uuid
where
    S: Service<Request, Response = ServiceResponse<B>, Error = actix_web::Error>,
    B: MessageBody + 'static,
{
    let (status, _) = register(app, username, email).await;
    assert_eq!(status, StatusCode::CREATED);

    let id = user_id(ctx, username).await;
    let code = pending_code(ctx, id).await.code;
    let (status, _) = call(app, get(&verify_uri(id, &code), None)).await;
    assert_eq!(status, StatusCode::OK);
    id
}

pub struct Tokens {
    pub access: String,
    pub refresh: String,
}

impl Tokens {
    pub fn from_body(body: &Value) -> Self {
        Self {
            access: body["access_token"].as_str().expect("access_token").to_string(),
            refresh: body["refresh_token"].as_str().expect("refresh_token").to_string(),
        }
    }

    pub fn pair(&self) -> Value {
        json!({ "access_token": self.access, "refresh_token": self.refresh })
    }
}

pub async fn login<S, B>(app: &S, username: &str, password: &str) -> (StatusCode, Value)
where
    S: Service<Request, Response = ServiceResponse<B>, Error = actix_web::Error>,
    B: MessageBody + 'static,
{
    let body = json!({ "username": username, "password": password });
    call(app, post("/v1/auth/login", body, None)).await
}

pub async fn logged_in<S, B>(app: &S, username: &str) -> Tokens
where
    S: Service<Request, Response = ServiceResponse<B>, Error = actix_web::Error>,
    B: MessageBody + 'static,
{
    let (status, body) = login(app, username, PASSWORD).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    Tokens::from_body(&body)
}
