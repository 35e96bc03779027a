// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL order store.
//!
//! Documents live in a JSONB column; conflicts on `order_uid` replace the
//! whole row so redelivered messages are harmless.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::PgPool;

use crate::error::OrderError;
use crate::models::Order;

use super::{OrderRecord, OrderStore, sequence_to_db};

/// PostgreSQL-backed order store.
#[derive(Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    /// Create a new Postgres-backed store from an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Order Operations
// ============================================================================

/// Insert an order or replace the existing row with the same uid.
pub async fn upsert_order(pool: &PgPool, order: &Order) -> Result<(), OrderError> {
    let data = serde_json::to_string(&order.payload)?;

    sqlx::query(
        r#"
        INSERT INTO orders (order_uid, track_number, data, received_sequence)
        VALUES ($1, $2, $3::jsonb, $4)
        ON CONFLICT (order_uid) DO UPDATE SET
            track_number = EXCLUDED.track_number,
            data = EXCLUDED.data,
            received_sequence = EXCLUDED.received_sequence,
            updated_at = NOW()
        "#,
    )
    .bind(&order.order_uid)
    .bind(&order.track_number)
    .bind(data)
    .bind(sequence_to_db(order.received_sequence))
    .execute(pool)
    .await
    .map_err(|e| OrderError::database("upsert_order", e))?;

    Ok(())
}

/// Get an order document by uid.
pub async fn get_order(pool: &PgPool, order_uid: &str) -> Result<Option<Bytes>, OrderError> {
    let row: Option<(String,)> =
        sqlx::query_as(r#"SELECT data::text FROM orders WHERE order_uid = $1"#)
            .bind(order_uid)
            .fetch_optional(pool)
            .await
            .map_err(|e| OrderError::database("get_order", e))?;

    Ok(row.map(|(data,)| Bytes::from(data)))
}

/// Load every order document keyed by uid.
pub async fn load_all_orders(pool: &PgPool) -> Result<HashMap<String, Bytes>, OrderError> {
    let rows: Vec<(String, String)> =
        sqlx::query_as(r#"SELECT order_uid, data::text FROM orders"#)
            .fetch_all(pool)
            .await
            .map_err(|e| OrderError::database("load_all_orders", e))?;

    Ok(rows
        .into_iter()
        .map(|(uid, data)| (uid, Bytes::from(data)))
        .collect())
}

/// Get row metadata for an order.
pub async fn get_order_record(
    pool: &PgPool,
    order_uid: &str,
) -> Result<Option<OrderRecord>, OrderError> {
    let record = sqlx::query_as::<_, OrderRecord>(
        r#"
        SELECT order_uid, track_number, received_sequence, created_at, updated_at
        FROM orders
        WHERE order_uid = $1
        "#,
    )
    .bind(order_uid)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Count stored orders.
pub async fn count_orders(pool: &PgPool) -> Result<i64, OrderError> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders")
        .fetch_one(pool)
        .await?;

    Ok(row.0)
}

/// Check database connectivity.
pub async fn health_check_db(pool: &PgPool) -> Result<bool, OrderError> {
    let result: Result<(i32,), _> = sqlx::query_as("SELECT 1").fetch_one(pool).await;
    Ok(result.is_ok())
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn upsert_order(&self, order: &Order) -> Result<(), OrderError> {
        upsert_order(&self.pool, order).await
    }

    async fn get_order(&self, order_uid: &str) -> Result<Option<Bytes>, OrderError> {
        get_order(&self.pool, order_uid).await
    }

    async fn load_all_orders(&self) -> Result<HashMap<String, Bytes>, OrderError> {
        load_all_orders(&self.pool).await
    }

    async fn get_order_record(
        &self,
        order_uid: &str,
    ) -> Result<Option<OrderRecord>, OrderError> {
        get_order_record(&self.pool, order_uid).await
    }

    async fn count_orders(&self) -> Result<i64, OrderError> {
        count_orders(&self.pool).await
    }

    async fn health_check_db(&self) -> Result<bool, OrderError> {
        health_check_db(&self.pool).await
    }
}
