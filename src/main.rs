use std::net::TcpListener;

use account_service::auth::RateLimit;
use account_service::{configure, AppError, AppState, Settings};
use actix_cors::Cors;
use actix_web::middleware::Logger;
use actix_web::{web, App, HttpServer};
use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[actix_web::main]
async fn main() -> account_service::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    // Load configuration
    let config = Settings::new()?;
    info!(environment = %config.environment, debug = config.debug, "Configuration loaded successfully");

    let state = AppState::new(config.clone()).await?;
    let rate_limiter = state.rate_limiter.clone();
    if !rate_limiter.is_enabled() {
        info!("Rate limiter disabled in debug mode");
    }
    let state = web::Data::new(state);

    let listener = TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))?;
    info!("Starting server at {}:{}", config.server.host, config.server.port);

    HttpServer::new(move || {
        let cors = if config.cors.enabled {
            let cors_config = Cors::default();

            let cors_config = if config.cors.allow_any_origin {
                cors_config
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header()
                    .expose_any_header()
            } else {
                cors_config
                    .allowed_origin(&config.server.public_url)
                    .allowed_methods(vec!["GET", "POST", "PATCH", "DELETE"])
                    .allowed_headers(vec!["Authorization", "Content-Type"])
            };

            cors_config.max_age(config.cors.max_age as usize)
        } else {
            Cors::default()
        };

        App::new()
            .wrap(RateLimit::new(rate_limiter.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .app_data(state.clone())
            .configure(configure)
    })
    .listen(listener)?
    .workers(config.server.workers as usize)
    .run()
    .await
    .map_err(|e| AppError::InternalError(e.to_string()))?;

    Ok(())
}
