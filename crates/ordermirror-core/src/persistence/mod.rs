// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for ordermirror-core.
//!
//! The store is the source of truth: the ingestion pipeline writes here before
//! touching the cache, and the query path falls back here on a cache miss.

pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use self::memory::MemoryOrderStore;
pub use self::postgres::PostgresOrderStore;
pub use self::sqlite::SqliteOrderStore;

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::OrderError;
use crate::models::Order;

/// Order row as stored, without the document body.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OrderRecord {
    /// Primary key.
    pub order_uid: String,
    /// Secondary index.
    pub track_number: String,
    /// Sequence of the delivery that last wrote the row.
    pub received_sequence: Option<i64>,
    /// When the row was first written.
    pub created_at: DateTime<Utc>,
    /// When the row was last replaced.
    pub updated_at: DateTime<Utc>,
}

/// Storage contract consumed by the ingestion and query paths.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert or fully replace the order keyed by `order.order_uid`.
    ///
    /// Must be idempotent: writing the same order twice leaves one row.
    async fn upsert_order(&self, order: &Order) -> Result<(), OrderError>;

    /// Fetch the stored JSON document.
    ///
    /// `Ok(None)` means the order does not exist; `Err` is a transient failure.
    async fn get_order(&self, order_uid: &str) -> Result<Option<Bytes>, OrderError>;

    /// Load every stored document, used once at startup to seed the cache.
    async fn load_all_orders(&self) -> Result<HashMap<String, Bytes>, OrderError>;

    /// Fetch row metadata for an order.
    async fn get_order_record(&self, order_uid: &str)
    -> Result<Option<OrderRecord>, OrderError>;

    /// Count stored orders.
    async fn count_orders(&self) -> Result<i64, OrderError>;

    /// Whether the backing database answers.
    async fn health_check_db(&self) -> Result<bool, OrderError>;
}

pub(crate) fn sequence_to_db(sequence: Option<u64>) -> Option<i64> {
    sequence.and_then(|s| i64::try_from(s).ok())
}
