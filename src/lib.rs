#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod metrics;
pub mod migrator;
pub mod notifications;
pub mod openapi;
pub mod payments;
pub mod services;
pub mod tracing;

use axum::{
    http::HeaderValue,
    routing::{get, post, put},
    Extension, Router,
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::auth::{AuthRouterExt, AuthService, ADMIN_ROLE};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: events::EventSender,
    pub services: handlers::AppServices,
    pub auth: Arc<AuthService>,
}

pub fn api_v1_routes() -> Router<AppState> {
    let checkout = Router::new()
        .route("/checkout", post(handlers::checkout::create_checkout))
        .with_optional_auth();

    // Payment confirmation paths: the webhook is signature-verified and the
    // verifier only accepts well-formed session ids.
    let confirmation = Router::new()
        .route("/checkout/verify", post(handlers::checkout::verify_session))
        .route(
            "/webhooks/payments",
            post(handlers::webhooks::payment_webhook),
        );

    let customer_orders = Router::new()
        .route("/orders/cancel", post(handlers::orders::cancel_order))
        .route("/orders/returns", post(handlers::orders::request_return))
        .with_auth();

    let admin = Router::new()
        .route(
            "/orders/:id/refund",
            post(handlers::admin::refund_order),
        )
        .route(
            "/orders/:id/status",
            put(handlers::admin::update_order_status),
        )
        .route("/returns", post(handlers::admin::manage_return))
        .with_role(ADMIN_ROLE);

    Router::new()
        .merge(checkout)
        .merge(confirmation)
        .merge(customer_orders)
        .nest("/admin", admin)
}

fn cors_layer(cfg: &config::AppConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = cfg
        .cors_origins()
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    if origins.is_empty() {
        if cfg.is_production() {
            ::tracing::warn!("no CORS origins configured; browser clients will be refused");
            CorsLayer::new()
        } else {
            CorsLayer::permissive()
        }
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Full HTTP surface: health, metrics, docs and the v1 API.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);
    let auth = state.auth.clone();

    Router::<AppState>::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(metrics::metrics_handler))
        .nest("/api/v1", api_v1_routes())
        .merge(openapi::swagger_ui())
        // HTTP tracing layer for consistent request/response telemetry
        .layer(crate::tracing::configure_http_tracing())
        .layer(cors)
        // Inject AuthService into request extensions for auth middleware
        .layer(Extension(auth))
        // Ensure every request carries a request id for traceability
        .layer(axum::middleware::from_fn(
            crate::tracing::request_id_middleware,
        ))
        .with_state(state)
}
