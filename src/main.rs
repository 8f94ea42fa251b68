//! # Idempotency Gateway - Demo Server
//!
//! Serves a payment endpoint behind the idempotency layer.
//!
//! ```text
//! curl -X POST http://localhost:8080/api/payment \
//!   -H "Content-Type: application/json" \
//!   -H "Idempotency-Key: payment-123" \
//!   -d '{"amount":1000,"currency":"USD"}'
//! ```
//!
//! Sending the same command again returns the first response with
//! `X-Idempotency-Cached: true`.
//!
//! Configuration comes from the YAML file named by `IDEMPOTENCY_CONFIG` (or the
//! first argument) plus `IDEMPOTENCY_*` environment overrides.

use std::time::Duration;

use anyhow::Context;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use idempotency_gateway::observability::init_logging;
use idempotency_gateway::{AppConfig, IdempotencyLayer};

#[derive(Debug, Deserialize)]
struct PaymentRequest {
    amount: u64,
    currency: String,
}

#[derive(Debug, Serialize)]
struct PaymentResponse {
    id: String,
    amount: u64,
    currency: String,
    status: &'static str,
    timestamp: DateTime<Utc>,
}

/// Pretends to charge a card
async fn handle_payment(Json(request): Json<PaymentRequest>) -> (StatusCode, Json<PaymentResponse>) {
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = PaymentResponse {
        id: format!("pay_{}", Uuid::new_v4().simple()),
        amount: request.amount,
        currency: request.currency,
        status: "completed",
        timestamp: Utc::now(),
    };
    info!(payment_id = %response.id, amount = response.amount, "Payment processed");

    (StatusCode::OK, Json(response))
}

async fn load_config() -> anyhow::Result<AppConfig> {
    let path = std::env::var("IDEMPOTENCY_CONFIG")
        .ok()
        .or_else(|| std::env::args().nth(1));

    let config = match path {
        Some(path) => AppConfig::load_from_file(&path)
            .await
            .with_context(|| format!("loading configuration from {}", path))?,
        None => AppConfig::load_from_env().context("loading configuration from environment")?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().await?;
    init_logging(&config.logging)?;

    info!("Starting idempotency gateway {}", env!("CARGO_PKG_VERSION"));

    let store = config.store.build_store().await.context("building idempotency store")?;
    if !store.health_check().await? {
        warn!(store = store.name(), "Idempotency store failed its health check");
    }

    let layer = IdempotencyLayer::from_config(store, &config.idempotency)?;
    let app = Router::new()
        .route("/api/payment", post(handle_payment))
        .layer(layer)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("binding {}", config.server.bind_address))?;
    info!("Listening on {}", config.server.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    info!("Idempotency gateway shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
