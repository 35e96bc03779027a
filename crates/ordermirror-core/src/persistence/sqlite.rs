// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed order store.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::OrderError;
use crate::migrations;
use crate::models::Order;

use super::{OrderRecord, OrderStore, sequence_to_db};

/// SQLite-backed order store.
#[derive(Clone)]
pub struct SqliteOrderStore {
    pool: SqlitePool,
}

impl SqliteOrderStore {
    /// Create a new SQLite store from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a SQLite store from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs all migrations.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let store = SqliteOrderStore::from_path(".data/orders.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, OrderError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                OrderError::database(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Connect to a `sqlite:` URL and run migrations.
    pub async fn connect(url: &str) -> Result<Self, OrderError> {
        // In-memory databases are per-connection, so they get exactly one.
        let in_memory = url.contains(":memory:");
        let mut options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            // Dropping the only connection would drop the database with it.
            options = options.idle_timeout(None).max_lifetime(None);
        }

        let pool = options
            .connect(url)
            .await
            .map_err(|e| {
                OrderError::database("connect", format!("Failed to connect to {}: {}", url, e))
            })?;

        migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl OrderStore for SqliteOrderStore {
    async fn upsert_order(&self, order: &Order) -> Result<(), OrderError> {
        let data = serde_json::to_string(&order.payload)?;

        sqlx::query(
            r#"
            INSERT INTO orders (order_uid, track_number, data, received_sequence)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (order_uid) DO UPDATE SET
                track_number = excluded.track_number,
                data = excluded.data,
                received_sequence = excluded.received_sequence,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&order.order_uid)
        .bind(&order.track_number)
        .bind(data)
        .bind(sequence_to_db(order.received_sequence))
        .execute(&self.pool)
        .await
        .map_err(|e| OrderError::database("upsert_order", e))?;

        Ok(())
    }

    async fn get_order(&self, order_uid: &str) -> Result<Option<Bytes>, OrderError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT data FROM orders WHERE order_uid = ?")
            .bind(order_uid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| OrderError::database("get_order", e))?;

        Ok(row.map(|(data,)| Bytes::from(data)))
    }

    async fn load_all_orders(&self) -> Result<HashMap<String, Bytes>, OrderError> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT order_uid, data FROM orders")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OrderError::database("load_all_orders", e))?;

        Ok(rows
            .into_iter()
            .map(|(uid, data)| (uid, Bytes::from(data)))
            .collect())
    }

    async fn get_order_record(
        &self,
        order_uid: &str,
    ) -> Result<Option<OrderRecord>, OrderError> {
        let record = sqlx::query_as::<_, OrderRecord>(
            r#"
            SELECT order_uid, track_number, received_sequence, created_at, updated_at
            FROM orders
            WHERE order_uid = ?
            "#,
        )
        .bind(order_uid)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn count_orders(&self) -> Result<i64, OrderError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    async fn health_check_db(&self) -> Result<bool, OrderError> {
        let result: Result<(i32,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}
