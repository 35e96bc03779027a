// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed durable channel.
//!
//! Messages are rows in `channel_messages`; each durable subscription keeps
//! its own bookkeeping in `channel_deliveries` (delivery count, redelivery
//! deadline, ack time). A message is due for a durable when it has no
//! delivery row yet, or its row is unacknowledged and past `redeliver_at`.
//!
//! Claims for one durable are serialized with a transaction-scoped advisory
//! lock, so two consumers sharing a durable never claim the same message
//! inside one ack wait.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{debug, info};

use crate::error::OrderError;
use crate::migrations;

use super::{Delivery, DurableChannel, StartPosition, Subscription, SubscriptionOptions};

/// Durable channel stored in PostgreSQL.
#[derive(Clone)]
pub struct PgChannel {
    pool: PgPool,
    cluster_id: String,
}

impl PgChannel {
    /// Create a channel over an existing pool. Migrations must already be applied.
    pub fn new(pool: PgPool, cluster_id: impl Into<String>) -> Self {
        Self {
            pool,
            cluster_id: cluster_id.into(),
        }
    }

    /// Connect to `url`, apply migrations and return the channel.
    pub async fn connect(url: &str, cluster_id: impl Into<String>) -> Result<Self, OrderError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| OrderError::channel("connect", e))?;

        migrations::run_postgres(&pool)
            .await
            .map_err(|e| OrderError::channel("migrate", e))?;

        let channel = Self::new(pool, cluster_id);
        info!(cluster_id = %channel.cluster_id, "Durable channel connected");
        Ok(channel)
    }

    /// Cluster this channel publishes into.
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Messages on `subject` that `durable_name` has not acknowledged.
    ///
    /// Returns 0 for a durable that was never created.
    pub async fn pending_count(&self, subject: &str, durable_name: &str) -> Result<i64, OrderError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM channel_messages m
            JOIN channel_subscriptions s
              ON s.cluster_id = m.cluster_id
             AND s.subject = m.subject
             AND s.durable_name = $3
            LEFT JOIN channel_deliveries d
              ON d.durable_name = $3
             AND d.sequence = m.sequence
            WHERE m.cluster_id = $1
              AND m.subject = $2
              AND m.sequence >= s.start_sequence
              AND d.acked_at IS NULL
            "#,
        )
        .bind(&self.cluster_id)
        .bind(subject)
        .bind(durable_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| OrderError::channel("pending_count", e))?;

        Ok(row.0)
    }
}

#[async_trait]
impl DurableChannel for PgChannel {
    async fn publish(&self, subject: &str, data: &[u8]) -> Result<u64, OrderError> {
        let (sequence,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO channel_messages (cluster_id, subject, payload)
            VALUES ($1, $2, $3)
            RETURNING sequence
            "#,
        )
        .bind(&self.cluster_id)
        .bind(subject)
        .bind(data)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| OrderError::channel("publish", e))?;

        debug!(subject, sequence, "Message published");
        Ok(sequence as u64)
    }

    async fn subscribe(
        &self,
        options: &SubscriptionOptions,
    ) -> Result<Box<dyn Subscription>, OrderError> {
        // First subscriber fixes the start position; later ones resume.
        sqlx::query(
            r#"
            INSERT INTO channel_subscriptions (cluster_id, subject, durable_name, start_sequence)
            VALUES (
                $1, $2, $3,
                CASE WHEN $4 THEN 1
                     ELSE (SELECT COALESCE(MAX(sequence), 0) + 1 FROM channel_messages)
                END
            )
            ON CONFLICT (cluster_id, subject, durable_name) DO NOTHING
            "#,
        )
        .bind(&self.cluster_id)
        .bind(&options.subject)
        .bind(&options.durable_name)
        .bind(options.start == StartPosition::AllAvailable)
        .execute(&self.pool)
        .await
        .map_err(|e| OrderError::channel("subscribe", e))?;

        let (start_sequence,): (i64,) = sqlx::query_as(
            r#"
            SELECT start_sequence
            FROM channel_subscriptions
            WHERE cluster_id = $1 AND subject = $2 AND durable_name = $3
            "#,
        )
        .bind(&self.cluster_id)
        .bind(&options.subject)
        .bind(&options.durable_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| OrderError::channel("subscribe", e))?;

        info!(
            cluster_id = %self.cluster_id,
            subject = %options.subject,
            durable_name = %options.durable_name,
            start_sequence,
            ack_wait_secs = options.ack_wait.as_secs(),
            "Durable subscription opened"
        );

        Ok(Box::new(PgSubscription {
            pool: self.pool.clone(),
            cluster_id: self.cluster_id.clone(),
            options: options.clone(),
            start_sequence,
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), OrderError> {
        self.pool.close().await;
        info!(cluster_id = %self.cluster_id, "Durable channel closed");
        Ok(())
    }
}

/// Subscription handle for [`PgChannel`].
pub struct PgSubscription {
    pool: PgPool,
    cluster_id: String,
    options: SubscriptionOptions,
    start_sequence: i64,
    closed: AtomicBool,
}

#[async_trait]
impl Subscription for PgSubscription {
    async fn fetch(&self, max: usize) -> Result<Vec<Delivery>, OrderError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OrderError::channel("fetch", "subscription is closed"));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| OrderError::channel("fetch", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!(
                "{}/{}/{}",
                self.cluster_id, self.options.subject, self.options.durable_name
            ))
            .execute(&mut *tx)
            .await
            .map_err(|e| OrderError::channel("fetch", e))?;

        let rows: Vec<(String, i64, Vec<u8>, i32)> = sqlx::query_as(
            r#"
            WITH due AS (
                SELECT m.sequence
                FROM channel_messages m
                LEFT JOIN channel_deliveries d
                  ON d.durable_name = $3
                 AND d.sequence = m.sequence
                WHERE m.cluster_id = $1
                  AND m.subject = $2
                  AND m.sequence >= $4
                  AND (d.sequence IS NULL
                       OR (d.acked_at IS NULL AND d.redeliver_at <= NOW()))
                ORDER BY m.sequence
                LIMIT $5
            ),
            claimed AS (
                INSERT INTO channel_deliveries
                    (durable_name, sequence, client_id, delivery_count, redeliver_at)
                SELECT $3, sequence, $6, 1, NOW() + make_interval(secs => $7)
                FROM due
                ON CONFLICT (durable_name, sequence) DO UPDATE SET
                    delivery_count = channel_deliveries.delivery_count + 1,
                    redeliver_at = EXCLUDED.redeliver_at,
                    client_id = EXCLUDED.client_id
                RETURNING sequence, delivery_count
            )
            SELECT m.subject, m.sequence, m.payload, c.delivery_count
            FROM claimed c
            JOIN channel_messages m ON m.sequence = c.sequence
            ORDER BY m.sequence
            "#,
        )
        .bind(&self.cluster_id)
        .bind(&self.options.subject)
        .bind(&self.options.durable_name)
        .bind(self.start_sequence)
        .bind(max as i64)
        .bind(&self.options.client_id)
        .bind(self.options.ack_wait.as_secs_f64())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| OrderError::channel("fetch", e))?;

        tx.commit()
            .await
            .map_err(|e| OrderError::channel("fetch", e))?;

        Ok(rows
            .into_iter()
            .map(|(subject, sequence, payload, delivery_count)| Delivery {
                subject,
                sequence: sequence as u64,
                data: Bytes::from(payload),
                delivery_count: delivery_count.max(1) as u32,
            })
            .collect())
    }

    async fn ack(&self, sequence: u64) -> Result<(), OrderError> {
        let result = sqlx::query(
            r#"
            UPDATE channel_deliveries
            SET acked_at = COALESCE(acked_at, NOW())
            WHERE durable_name = $1 AND sequence = $2
            "#,
        )
        .bind(&self.options.durable_name)
        .bind(sequence as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| OrderError::channel("ack", e))?;

        if result.rows_affected() == 0 {
            return Err(OrderError::channel(
                "ack",
                format!("sequence {} was never delivered", sequence),
            ));
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), OrderError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(
                durable_name = %self.options.durable_name,
                "Durable subscription closed"
            );
        }
        Ok(())
    }

    fn options(&self) -> &SubscriptionOptions {
        &self.options
    }
}
