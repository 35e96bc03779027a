// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! OrderMirror - order ingestion and lookup service
//!
//! Consumes orders from the durable channel, persists them, mirrors them in
//! memory and serves `GET /order/{id}` until interrupted.

use std::sync::Arc;

use anyhow::{Result, bail};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use ordermirror_core::channel::PgChannel;
use ordermirror_core::config::Config;
use ordermirror_core::migrations;
use ordermirror_core::persistence::{OrderStore, PostgresOrderStore, SqliteOrderStore};
use ordermirror_core::runtime::MirrorRuntime;

/// Open connection pool behind the order store, closed last on shutdown.
enum StorePool {
    Postgres(sqlx::PgPool),
    Sqlite(sqlx::SqlitePool),
}

impl StorePool {
    async fn close(&self) {
        match self {
            Self::Postgres(pool) => pool.close().await,
            Self::Sqlite(pool) => pool.close().await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ordermirror_core=info".parse()?),
        )
        .init();

    info!("Starting OrderMirror");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        http_addr = %config.http_addr,
        subject = %config.subject,
        durable_name = %config.durable_name,
        ack_wait_secs = config.ack_wait.as_secs(),
        sqlite_store = config.uses_sqlite_store(),
        "Configuration loaded"
    );

    if !config.channel_url.starts_with("postgres") {
        bail!("ORDERMIRROR_CHANNEL_URL must be a PostgreSQL URL");
    }

    info!("Opening order store...");
    let (store, pool): (Arc<dyn OrderStore>, StorePool) = if config.uses_sqlite_store() {
        let store = SqliteOrderStore::connect(&config.database_url).await?;
        let pool = store.pool().clone();
        (Arc::new(store), StorePool::Sqlite(pool))
    } else {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await?;

        info!("Running database migrations...");
        migrations::run_postgres(&pool).await?;
        info!("Migrations completed");

        (
            Arc::new(PostgresOrderStore::new(pool.clone())),
            StorePool::Postgres(pool),
        )
    };
    info!("Order store ready");

    let channel = match PgChannel::connect(&config.channel_url, &config.cluster_id).await {
        Ok(channel) => channel,
        Err(e) => {
            pool.close().await;
            return Err(e.into());
        }
    };

    let runtime = MirrorRuntime::builder()
        .store(store)
        .channel(Arc::new(channel))
        .subscription(config.subscription_options())
        .http_addr(config.http_addr)
        .ingest(config.ingest_config())
        .build()?
        .start()
        .await;

    let runtime = match runtime {
        Ok(runtime) => runtime,
        Err(e) => {
            pool.close().await;
            return Err(e);
        }
    };

    info!(addr = %runtime.http_addr(), "OrderMirror initialized successfully");

    // Wait for shutdown signal
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutting down...");

    let result = runtime.shutdown().await;
    pool.close().await;
    info!("Shutdown complete");

    result
}
