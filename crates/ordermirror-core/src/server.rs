// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP read surface.
//!
//! Routes:
//! - `GET /order/{id}` - the stored JSON document, 404 when unknown
//! - `GET /order/`, `GET /order` - 400, the id is required
//! - `GET /health` - store connectivity and cache size
//! - `GET /` - a small page for looking orders up by hand

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument};

use crate::cache::MirrorCache;
use crate::persistence::OrderStore;
use crate::query::{Lookup, QueryService};

/// Shared state for HTTP handlers.
pub struct AppState {
    /// Cache-aside lookups.
    pub query: Arc<QueryService>,
    /// The mirror, for reporting its size.
    pub cache: Arc<MirrorCache>,
    /// The store, for health checks.
    pub store: Arc<dyn OrderStore>,
    /// When the server started (for uptime calculation).
    pub start_time: Instant,
    /// Server version string.
    pub version: String,
}

impl AppState {
    /// Create handler state.
    pub fn new(
        query: Arc<QueryService>,
        cache: Arc<MirrorCache>,
        store: Arc<dyn OrderStore>,
    ) -> Self {
        Self {
            query,
            cache,
            store,
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Get uptime in milliseconds.
    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }
}

/// Health check response body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok` or `degraded`.
    pub status: &'static str,
    /// Crate version.
    pub version: String,
    /// Milliseconds since the server started.
    pub uptime_ms: u64,
    /// Entries currently in the mirror.
    pub cached_orders: usize,
    /// `up` or `down`.
    pub database: &'static str,
}

/// Build the router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/order", get(missing_id))
        .route("/order/", get(missing_id))
        .route("/order/{id}", get(get_order))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve HTTP on `listener` until `shutdown` resolves.
///
/// In-flight requests are allowed to complete after the signal.
#[instrument(skip_all, fields(addr = ?listener.local_addr().ok()))]
pub async fn run_http_server<F>(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("HTTP server starting");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

async fn get_order(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    if id.is_empty() {
        return missing_id().await.into_response();
    }

    match state.query.lookup(&id).await {
        Lookup::Cache(payload) | Lookup::Store(payload) => {
            ([(header::CONTENT_TYPE, "application/json")], payload).into_response()
        }
        Lookup::NotFound => {
            debug!(order_uid = %id, "Order not found");
            (StatusCode::NOT_FOUND, "order not found").into_response()
        }
    }
}

async fn missing_id() -> impl IntoResponse {
    (StatusCode::BAD_REQUEST, "missing id")
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let db_healthy = state.store.health_check_db().await.unwrap_or(false);

    let (code, status, database) = if db_healthy {
        (StatusCode::OK, "ok", "up")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded", "down")
    };

    (
        code,
        Json(HealthResponse {
            status,
            version: state.version.clone(),
            uptime_ms: state.uptime_ms(),
            cached_orders: state.cache.len(),
            database,
        }),
    )
}

async fn index() -> Html<&'static str> {
    Html(INDEX_PAGE)
}

const INDEX_PAGE: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>Order lookup</title>
  <style>
    body { font-family: sans-serif; margin: 2rem; }
    pre { background: #f4f4f4; padding: 1rem; white-space: pre-wrap; }
  </style>
</head>
<body>
  <h1>Order lookup</h1>
  <form id="lookup">
    <input id="uid" placeholder="order_uid" autofocus>
    <button type="submit">Find</button>
  </form>
  <pre id="result"></pre>
  <script>
    document.getElementById("lookup").addEventListener("submit", async (event) => {
      event.preventDefault();
      const uid = document.getElementById("uid").value.trim();
      const out = document.getElementById("result");
      if (!uid) { out.textContent = "Enter an order uid."; return; }
      const res = await fetch("/order/" + encodeURIComponent(uid));
      if (!res.ok) { out.textContent = res.status + " " + await res.text(); return; }
      out.textContent = JSON.stringify(await res.json(), null, 2);
    });
  </script>
</body>
</html>
"#;
