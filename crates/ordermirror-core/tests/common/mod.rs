// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for ordermirror-core integration tests.
//!
//! Provides [`WorkerContext`] for driving the ingest worker over an in-memory
//! channel, and [`PgContext`] for tests against a real PostgreSQL database.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use ordermirror_core::cache::MirrorCache;
use ordermirror_core::channel::{
    DurableChannel, MemoryChannel, StartPosition, Subscription, SubscriptionOptions,
};
use ordermirror_core::ingest::{IngestConfig, IngestWorker, IngestionPipeline};
use ordermirror_core::migrations;
use ordermirror_core::persistence::OrderStore;

pub const SUBJECT: &str = "orders";
pub const DURABLE: &str = "order-durable";
pub const ACK_WAIT: Duration = Duration::from_secs(60);

/// Subscription options used by most tests: replay everything, 60s ack wait.
pub fn options() -> SubscriptionOptions {
    SubscriptionOptions::new(SUBJECT, DURABLE)
        .ack_wait(ACK_WAIT)
        .start(StartPosition::AllAvailable)
}

/// JSON order body with the given uid and track number.
pub fn order_json(order_uid: &str, track_number: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "order_uid": order_uid,
        "track_number": track_number,
        "entry": "WBIL",
        "delivery": { "name": "Test Testov", "city": "Kiryat Mozkin" },
        "items": [{ "chrt_id": 9934930, "price": 453 }],
    }))
    .unwrap()
}

/// Parse a cached or stored payload.
pub fn parse(payload: &[u8]) -> serde_json::Value {
    serde_json::from_slice(payload).unwrap()
}

/// Poll `condition` every 10ms until it holds, panicking after `timeout`.
///
/// Works on a paused clock: the sleeps auto-advance time.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A running ingest worker over a [`MemoryChannel`].
pub struct WorkerContext {
    pub channel: MemoryChannel,
    pub store: Arc<dyn OrderStore>,
    pub cache: Arc<MirrorCache>,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl WorkerContext {
    /// Subscribe with [`options`] and start a worker writing to `store`.
    pub async fn start(
        channel: MemoryChannel,
        store: Arc<dyn OrderStore>,
        cache: Arc<MirrorCache>,
    ) -> Self {
        Self::start_with(channel, store, cache, options(), IngestConfig::default()).await
    }

    /// Start a worker with explicit subscription and ingest settings.
    pub async fn start_with(
        channel: MemoryChannel,
        store: Arc<dyn OrderStore>,
        cache: Arc<MirrorCache>,
        options: SubscriptionOptions,
        config: IngestConfig,
    ) -> Self {
        let subscription: Arc<dyn Subscription> =
            Arc::from(channel.subscribe(&options).await.unwrap());
        let pipeline = Arc::new(IngestionPipeline::new(
            store.clone(),
            cache.clone(),
            config.store_timeout,
        ));
        let worker = IngestWorker::new(pipeline, subscription, config);
        let shutdown = worker.shutdown_handle();
        let handle = tokio::spawn(worker.run());

        Self {
            channel,
            store,
            cache,
            shutdown,
            handle,
        }
    }

    /// Publish a message on [`SUBJECT`].
    pub async fn publish(&self, body: &[u8]) -> u64 {
        self.channel.publish(SUBJECT, body).await.unwrap()
    }

    /// Wait until `sequence` is acknowledged by [`DURABLE`].
    pub async fn wait_acked(&self, sequence: u64) {
        let channel = self.channel.clone();
        eventually(Duration::from_secs(5), move || {
            let channel = channel.clone();
            async move { channel.is_acked(DURABLE, sequence).await }
        })
        .await;
    }

    /// Wait until `sequence` has been handed out at least `count` times.
    pub async fn wait_delivered(&self, sequence: u64, count: u32) {
        let channel = self.channel.clone();
        eventually(Duration::from_secs(5), move || {
            let channel = channel.clone();
            async move { channel.delivery_count(DURABLE, sequence).await >= count }
        })
        .await;
    }

    /// Stop the worker and wait for it to exit.
    pub async fn stop(self) -> MemoryChannel {
        self.shutdown.notify_one();
        self.handle.await.unwrap();
        self.channel
    }
}

/// Test context backed by the database in `TEST_DATABASE_URL`.
pub struct PgContext {
    pub pool: PgPool,
}

impl PgContext {
    /// Connect and migrate, or `None` when no database is configured.
    pub async fn new() -> Option<Self> {
        let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&database_url).await.ok()?;
        migrations::run_postgres(&pool).await.ok()?;
        Some(Self { pool })
    }

    /// A name unique to this test run, so tests sharing a database don't collide.
    pub fn unique(prefix: &str) -> String {
        format!("{}-{}", prefix, Uuid::new_v4())
    }

    /// Remove orders written by a test.
    pub async fn cleanup_orders(&self, order_uids: &[&str]) {
        for uid in order_uids {
            sqlx::query("DELETE FROM orders WHERE order_uid = $1")
                .bind(*uid)
                .execute(&self.pool)
                .await
                .ok();
        }
    }

    /// Remove all channel state for a cluster.
    pub async fn cleanup_cluster(&self, cluster_id: &str) {
        sqlx::query(
            "DELETE FROM channel_deliveries WHERE sequence IN \
             (SELECT sequence FROM channel_messages WHERE cluster_id = $1)",
        )
        .bind(cluster_id)
        .execute(&self.pool)
        .await
        .ok();
        sqlx::query("DELETE FROM channel_messages WHERE cluster_id = $1")
            .bind(cluster_id)
            .execute(&self.pool)
            .await
            .ok();
        sqlx::query("DELETE FROM channel_subscriptions WHERE cluster_id = $1")
            .bind(cluster_id)
            .execute(&self.pool)
            .await
            .ok();
    }
}

/// Helper macro to skip tests if TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}
