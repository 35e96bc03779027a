// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory order store for testing.
//!
//! Behaves like the SQL stores but can be told to fail or stall, and counts
//! calls so tests can prove whether a read reached the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::OrderError;
use crate::models::Order;

use super::{OrderRecord, OrderStore, sequence_to_db};

#[derive(Debug, Clone)]
struct StoredOrder {
    track_number: String,
    data: Bytes,
    received_sequence: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// In-memory store with failure injection.
#[derive(Debug, Default)]
pub struct MemoryOrderStore {
    orders: RwLock<HashMap<String, StoredOrder>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    /// Artificial latency added to every call, in milliseconds.
    latency_ms: AtomicU64,
    /// Extra delay on point reads, after the row has been read.
    read_latency_ms: AtomicU64,
    /// Extra upsert delay keyed by track number.
    track_latency: RwLock<HashMap<String, Duration>>,
    upserts: AtomicUsize,
    gets: AtomicUsize,
}

impl MemoryOrderStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent upsert fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent read fail (or succeed again).
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay point reads by `latency` after the row is read, so the caller
    /// receives a snapshot that may be stale by the time it returns.
    pub fn set_read_latency(&self, latency: Duration) {
        self.read_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay upserts of orders carrying `track_number` by `latency`.
    /// A zero latency removes the delay.
    pub async fn set_track_latency(&self, track_number: &str, latency: Duration) {
        let mut delays = self.track_latency.write().await;
        if latency.is_zero() {
            delays.remove(track_number);
        } else {
            delays.insert(track_number.to_string(), latency);
        }
    }

    /// Number of upsert calls that reached the store.
    pub fn upsert_calls(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Number of point reads that reached the store.
    pub fn get_calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Insert a raw document directly, bypassing counters and failure flags.
    pub async fn insert_raw(&self, order_uid: &str, data: impl Into<Bytes>) {
        let now = Utc::now();
        self.orders.write().await.insert(
            order_uid.to_string(),
            StoredOrder {
                track_number: String::new(),
                data: data.into(),
                received_sequence: None,
                created_at: now,
                updated_at: now,
            },
        );
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn check_reads(&self, operation: &str) -> Result<(), OrderError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(OrderError::database(operation, "injected read failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn upsert_order(&self, order: &Order) -> Result<(), OrderError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let delay = self
            .track_latency
            .read()
            .await
            .get(&order.track_number)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(OrderError::database("upsert_order", "injected write failure"));
        }

        let data = order.to_json_bytes()?;
        let now = Utc::now();
        let mut orders = self.orders.write().await;
        let created_at = orders
            .get(&order.order_uid)
            .map(|existing| existing.created_at)
            .unwrap_or(now);
        orders.insert(
            order.order_uid.clone(),
            StoredOrder {
                track_number: order.track_number.clone(),
                data,
                received_sequence: sequence_to_db(order.received_sequence),
                created_at,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn get_order(&self, order_uid: &str) -> Result<Option<Bytes>, OrderError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.check_reads("get_order")?;

        let snapshot = self
            .orders
            .read()
            .await
            .get(order_uid)
            .map(|stored| stored.data.clone());

        let ms = self.read_latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        Ok(snapshot)
    }

    async fn load_all_orders(&self) -> Result<HashMap<String, Bytes>, OrderError> {
        self.simulate_latency().await;
        self.check_reads("load_all_orders")?;

        Ok(self
            .orders
            .read()
            .await
            .iter()
            .map(|(uid, stored)| (uid.clone(), stored.data.clone()))
            .collect())
    }

    async fn get_order_record(
        &self,
        order_uid: &str,
    ) -> Result<Option<OrderRecord>, OrderError> {
        self.check_reads("get_order_record")?;

        Ok(self
            .orders
            .read()
            .await
            .get(order_uid)
            .map(|stored| OrderRecord {
                order_uid: order_uid.to_string(),
                track_number: stored.track_number.clone(),
                received_sequence: stored.received_sequence,
                created_at: stored.created_at,
                updated_at: stored.updated_at,
            }))
    }

    async fn count_orders(&self) -> Result<i64, OrderError> {
        self.check_reads("count_orders")?;
        Ok(self.orders.read().await.len() as i64)
    }

    async fn health_check_db(&self) -> Result<bool, OrderError> {
        Ok(!self.fail_reads.load(Ordering::SeqCst))
    }
}
