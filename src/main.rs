use actix_web::{middleware::Compress, App, HttpServer};
use actix_cors::Cors;
use utoipa_swagger_ui::SwaggerUi;

mod auth;
mod cascade;
mod counters;
mod error;
mod identity;
mod models;
mod openapi;
mod rate_limit;
mod repo;
mod routes;
mod security;
mod storage;

use counters::{counter_channel, CounterWorker};
use identity::build_identity_directory;
use openapi::ApiDoc;
use rate_limit::{InMemoryRateLimiter, RateLimitConfig, RateLimiterFacade};
use repo::inmem::InMemRepo;
use repo::PostRepo;
use routes::{config, AppState};
use security::SecurityHeaders;
use std::sync::Arc;
use storage::build_photo_store;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;
use tracing_actix_web::TracingLogger;
use utoipa::OpenApi; // bring trait into scope for ApiDoc::openapi()

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Environment variables must be set externally (shell, systemd, Docker).
    // Load .env automatically only in debug builds to reduce setup overhead.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    validate_env_vars();

    // Structured logging initialisation
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Bootstrapping sonet server");

    // Store + counter trigger worker. Reaction/comment writes commit without
    // touching the post document; the worker applies the counter deltas.
    let (tx, rx) = counter_channel();
    let repo = InMemRepo::new().with_events(tx);
    let worker = CounterWorker::new(Arc::new(repo.clone()) as Arc<dyn PostRepo>, rx);
    tokio::spawn(worker.run());
    info!("Counter trigger worker running");

    let photo_store = build_photo_store().await;
    let identity = build_identity_directory();
    let limiter = RateLimiterFacade::new(
        InMemoryRateLimiter::new(
            std::env::var("RL_DISABLED").map(|v| v != "1").unwrap_or(true),
        ),
        RateLimitConfig::from_env(),
    );

    let openapi = ApiDoc::openapi();
    info!("OpenAPI spec generated");

    let app_state = AppState {
        repo: Arc::new(repo),
        photo_store,
        identity,
        limiter,
    };

    let server = HttpServer::new(move || {
        let cors = {
            let mut c = Cors::default()
                // local dev frontend ports
                .allowed_origin("http://localhost:5173")
                .allowed_origin("http://127.0.0.1:5173")
                .allowed_origin("http://localhost:3000")
                .allowed_origin("http://127.0.0.1:3000")
                .allow_any_header()
                .allowed_methods(["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"])
                .supports_credentials()
                .max_age(3600);
            if let Ok(front) = std::env::var("FRONTEND_URL") {
                c = c.allowed_origin(&front);
            }
            c
        };

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(SecurityHeaders::from_env())
            .wrap(cors)
            .configure(config)
            .service(SwaggerUi::new("/docs/{_:.*}").url("/docs/openapi.json", openapi.clone()))
            .app_data(actix_web::web::Data::new(app_state.clone()))
    })
    .bind(("0.0.0.0", 8080))?;

    info!("Listening on http://0.0.0.0:8080 (all interfaces)");

    server.run().await
}

/// Validate that required environment variables are set
fn validate_env_vars() {
    use std::env;

    let required = vec!["JWT_SECRET"];

    let mut missing = Vec::new();
    for var in required {
        if env::var(var).is_err() {
            missing.push(var);
        }
    }

    if !missing.is_empty() {
        eprintln!("Missing required environment variables: {missing:?}");
        eprintln!("Please copy .env.example to .env and configure it");
        std::process::exit(1);
    }

    if let Ok(secret) = env::var("JWT_SECRET") {
        if secret.len() < 32 {
            eprintln!("JWT_SECRET must be at least 32 characters long for security");
            std::process::exit(1);
        }
    }

    if env::var("IDENTITY_URL").is_err() {
        eprintln!("Warning: IDENTITY_URL not set; account deletion will skip identity revocation");
    }
    if env::var("S3_ENDPOINT").is_err() {
        eprintln!("Warning: S3_ENDPOINT not set; photo storage will fail to initialize");
    }
}
