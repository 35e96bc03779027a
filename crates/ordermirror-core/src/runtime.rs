// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the order mirror.
//!
//! [`MirrorRuntime`] wires a store, a durable channel, the cache, the ingest
//! worker and the HTTP server together, starting them in dependency order:
//!
//! 1. load every stored order and seed the cache
//! 2. open the durable subscription
//! 3. start the ingest worker
//! 4. bind the HTTP listener
//!
//! The store is expected to be open and migrated before it is handed in.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ordermirror_core::channel::{MemoryChannel, SubscriptionOptions};
//! use ordermirror_core::persistence::SqliteOrderStore;
//! use ordermirror_core::runtime::MirrorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteOrderStore::connect("sqlite::memory:").await?);
//!
//!     let runtime = MirrorRuntime::builder()
//!         .store(store)
//!         .channel(Arc::new(MemoryChannel::new()))
//!         .subscription(SubscriptionOptions::new("orders", "order-durable"))
//!         .http_addr("127.0.0.1:8080".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... serve until asked to stop ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cache::MirrorCache;
use crate::channel::{DurableChannel, SubscriptionOptions};
use crate::ingest::{IngestConfig, IngestWorker, IngestionPipeline};
use crate::persistence::OrderStore;
use crate::query::QueryService;
use crate::server::{AppState, run_http_server};

/// Builder for creating a [`MirrorRuntime`].
pub struct MirrorRuntimeBuilder {
    store: Option<Arc<dyn OrderStore>>,
    channel: Option<Arc<dyn DurableChannel>>,
    subscription: SubscriptionOptions,
    http_addr: SocketAddr,
    ingest: IngestConfig,
}

impl std::fmt::Debug for MirrorRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorRuntimeBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("channel", &self.channel.as_ref().map(|_| "..."))
            .field("subscription", &self.subscription)
            .field("http_addr", &self.http_addr)
            .field("ingest", &self.ingest)
            .finish()
    }
}

impl Default for MirrorRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            channel: None,
            subscription: SubscriptionOptions::new("orders", "order-durable"),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            ingest: IngestConfig::default(),
        }
    }
}

impl MirrorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the order store (required).
    pub fn store(mut self, store: Arc<dyn OrderStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the durable channel (required).
    pub fn channel(mut self, channel: Arc<dyn DurableChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Set the subscription to consume.
    ///
    /// Default: subject `orders`, durable `order-durable`.
    pub fn subscription(mut self, options: SubscriptionOptions) -> Self {
        self.subscription = options;
        self
    }

    /// Set the HTTP bind address. Port 0 picks a free port.
    ///
    /// Default: `0.0.0.0:8080`
    pub fn http_addr(mut self, addr: SocketAddr) -> Self {
        self.http_addr = addr;
        self
    }

    /// Set ingestion settings.
    pub fn ingest(mut self, config: IngestConfig) -> Self {
        self.ingest = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<MirrorRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let channel = self
            .channel
            .ok_or_else(|| anyhow::anyhow!("channel is required"))?;

        Ok(MirrorRuntimeConfig {
            store,
            channel,
            subscription: self.subscription,
            http_addr: self.http_addr,
            ingest: self.ingest,
        })
    }
}

/// Configuration for a [`MirrorRuntime`].
pub struct MirrorRuntimeConfig {
    store: Arc<dyn OrderStore>,
    channel: Arc<dyn DurableChannel>,
    subscription: SubscriptionOptions,
    http_addr: SocketAddr,
    ingest: IngestConfig,
}

impl std::fmt::Debug for MirrorRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorRuntimeConfig")
            .field("store", &"...")
            .field("channel", &"...")
            .field("subscription", &self.subscription)
            .field("http_addr", &self.http_addr)
            .field("ingest", &self.ingest)
            .finish()
    }
}

impl MirrorRuntimeConfig {
    /// Start the runtime.
    ///
    /// Fails if the subscription cannot be opened or the HTTP address cannot
    /// be bound; the channel is closed before the error is returned. A failure to load stored orders is logged and startup
    /// continues with an empty cache; reads fall back to the store.
    pub async fn start(self) -> Result<MirrorRuntime> {
        let cache = Arc::new(MirrorCache::new());

        match self.store.load_all_orders().await {
            Ok(orders) => {
                let loaded = cache.seed(orders);
                info!(loaded, "Cache restored from store");
            }
            Err(e) => {
                warn!(error = %e, "Failed to restore cache, starting empty");
            }
        }

        let subscription = match self.channel.subscribe(&self.subscription).await {
            Ok(subscription) => subscription,
            Err(e) => {
                if let Err(close_err) = self.channel.close().await {
                    warn!(error = %close_err, "Failed to close channel");
                }
                return Err(e).context("failed to open durable subscription");
            }
        };

        let pipeline = Arc::new(IngestionPipeline::new(
            self.store.clone(),
            cache.clone(),
            self.ingest.store_timeout,
        ));
        let worker = IngestWorker::new(pipeline, Arc::from(subscription), self.ingest.clone());
        let worker_shutdown = worker.shutdown_handle();
        let worker_handle = tokio::spawn(worker.run());

        let listener = match TcpListener::bind(self.http_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                worker_shutdown.notify_one();
                let _ = worker_handle.await;
                if let Err(close_err) = self.channel.close().await {
                    warn!(error = %close_err, "Failed to close channel");
                }
                return Err(e).with_context(|| format!("failed to bind {}", self.http_addr));
            }
        };
        let http_addr = listener.local_addr()?;

        let query = Arc::new(QueryService::new(
            cache.clone(),
            self.store.clone(),
            self.ingest.store_timeout,
        ));
        let state = Arc::new(AppState::new(query, cache.clone(), self.store.clone()));

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(run_http_server(listener, state, async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
        }));

        info!(addr = %http_addr, "MirrorRuntime started");

        Ok(MirrorRuntime {
            server_handle,
            shutdown_tx,
            worker_handle,
            worker_shutdown,
            channel: self.channel,
            store: self.store,
            cache,
            http_addr,
        })
    }
}

/// A running order mirror.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct MirrorRuntime {
    server_handle: JoinHandle<Result<()>>,
    shutdown_tx: watch::Sender<bool>,
    worker_handle: JoinHandle<()>,
    worker_shutdown: Arc<Notify>,
    channel: Arc<dyn DurableChannel>,
    store: Arc<dyn OrderStore>,
    cache: Arc<MirrorCache>,
    http_addr: SocketAddr,
}

impl MirrorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> MirrorRuntimeBuilder {
        MirrorRuntimeBuilder::new()
    }

    /// The address the HTTP server is listening on.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// The in-memory mirror.
    pub fn cache(&self) -> &Arc<MirrorCache> {
        &self.cache
    }

    /// The order store.
    pub fn store(&self) -> &Arc<dyn OrderStore> {
        &self.store
    }

    /// Check if both the HTTP server and the ingest worker are still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished() && !self.worker_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the HTTP server, then the ingest worker (which closes its
    /// subscription), then closes the channel. Every step runs even if an
    /// earlier one failed; the first error is returned.
    pub async fn shutdown(self) -> Result<()> {
        info!("MirrorRuntime shutting down...");

        let _ = self.shutdown_tx.send(true);
        let server_result = match self.server_handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("HTTP server task panicked: {}", e)),
        };
        if let Err(e) = &server_result {
            error!(error = %e, "HTTP server error during shutdown");
        }

        self.worker_shutdown.notify_one();
        let worker_result = self
            .worker_handle
            .await
            .map_err(|e| anyhow::anyhow!("ingest worker task panicked: {}", e));
        if let Err(e) = &worker_result {
            error!(error = %e, "Ingest worker error during shutdown");
        }

        let channel_result = self.channel.close().await.map_err(anyhow::Error::from);
        if let Err(e) = &channel_result {
            error!(error = %e, "Failed to close channel");
        }

        server_result.and(worker_result).and(channel_result)?;
        info!("MirrorRuntime shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MemoryChannel, StartPosition};
    use crate::persistence::MemoryOrderStore;
    use bytes::Bytes;

    fn local() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[test]
    fn test_build_requires_store_and_channel() {
        let err = MirrorRuntime::builder().build().unwrap_err();
        assert!(err.to_string().contains("store"));

        let err = MirrorRuntime::builder()
            .store(Arc::new(MemoryOrderStore::new()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("channel"));
    }

    #[tokio::test]
    async fn test_start_seeds_cache_and_binds() {
        let store = Arc::new(MemoryOrderStore::new());
        store.insert_raw("A1", Bytes::from_static(b"{}")).await;
        store.insert_raw("A2", Bytes::from_static(b"{}")).await;

        let runtime = MirrorRuntime::builder()
            .store(store)
            .channel(Arc::new(MemoryChannel::new()))
            .http_addr(local())
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert_ne!(runtime.http_addr().port(), 0);
        assert!(runtime.cache().contains("A1"));
        assert!(runtime.cache().contains("A2"));
        assert!(runtime.is_running());

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_restore_still_starts() {
        let store = Arc::new(MemoryOrderStore::new());
        store.set_fail_reads(true);

        let runtime = MirrorRuntime::builder()
            .store(store)
            .channel(Arc::new(MemoryChannel::new()))
            .http_addr(local())
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(runtime.cache().is_empty());
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_channel() {
        let channel = MemoryChannel::new();
        let runtime = MirrorRuntime::builder()
            .store(Arc::new(MemoryOrderStore::new()))
            .channel(Arc::new(channel.clone()))
            .subscription(
                SubscriptionOptions::new("orders", "d1").start(StartPosition::AllAvailable),
            )
            .http_addr(local())
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        runtime.shutdown().await.unwrap();
        assert!(channel.publish("orders", b"{}").await.is_err());
    }

    #[tokio::test]
    async fn test_closed_channel_fails_start() {
        let channel = MemoryChannel::new();
        channel.close().await.unwrap();

        let result = MirrorRuntime::builder()
            .store(Arc::new(MemoryOrderStore::new()))
            .channel(Arc::new(channel))
            .http_addr(local())
            .build()
            .unwrap()
            .start()
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_failed_subscribe_closes_channel() {
        let channel = MemoryChannel::new();
        // Bind the durable to another subject so the runtime's subscribe is rejected.
        channel
            .subscribe(&SubscriptionOptions::new("payments", "d1"))
            .await
            .unwrap();

        let result = MirrorRuntime::builder()
            .store(Arc::new(MemoryOrderStore::new()))
            .channel(Arc::new(channel.clone()))
            .subscription(SubscriptionOptions::new("orders", "d1"))
            .http_addr(local())
            .build()
            .unwrap()
            .start()
            .await;

        let err = result.err().unwrap();
        assert!(err.to_string().contains("subscription"));
        assert!(channel.publish("orders", b"{}").await.is_err());
    }
}
