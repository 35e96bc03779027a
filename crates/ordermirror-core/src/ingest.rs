// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Order ingestion.
//!
//! [`IngestionPipeline`] decides what happens to a single delivery:
//!
//! | Step | Failure | Outcome |
//! |------|---------|---------|
//! | decode bytes as a JSON object | malformed body | `Deferred` (no ack, redelivered) |
//! | validate `order_uid` | missing / empty | `Discarded` (acked, dropped) |
//! | upsert into the store (with timeout) | error or timeout | `Deferred` |
//! | mirror into the cache | serialization error | still `Processed` |
//!
//! [`IngestWorker`] is the long-lived loop that pulls deliveries from a
//! [`Subscription`], runs them through the pipeline concurrently and
//! acknowledges according to the outcome. Deliveries for the same order uid
//! run one at a time, in sequence order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cache::MirrorCache;
use crate::channel::{Delivery, Subscription};
use crate::error::OrderError;
use crate::models::Order;
use crate::persistence::OrderStore;

/// What to do with a delivery after one processing attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Stored and mirrored; acknowledge.
    Processed {
        /// The order that was written.
        order_uid: String,
    },
    /// Permanently unprocessable; acknowledge so it is never redelivered.
    Discarded {
        /// Why the message was dropped.
        reason: OrderError,
    },
    /// Transient failure; leave unacknowledged for redelivery.
    Deferred {
        /// What went wrong.
        reason: OrderError,
    },
}

impl IngestOutcome {
    /// Whether the delivery should be acknowledged.
    pub fn should_ack(&self) -> bool {
        !matches!(self, Self::Deferred { .. })
    }
}

/// Ingestion settings.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Deadline for each store write.
    pub store_timeout: Duration,
    /// Maximum deliveries processed at once.
    pub max_in_flight: usize,
    /// Sleep between fetches when nothing is due.
    pub poll_interval: Duration,
    /// Maximum deliveries claimed per fetch.
    pub batch_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(5),
            max_in_flight: 16,
            poll_interval: Duration::from_millis(500),
            batch_size: 64,
        }
    }
}

/// Per-delivery decode → validate → persist → mirror.
pub struct IngestionPipeline {
    store: Arc<dyn OrderStore>,
    cache: Arc<MirrorCache>,
    store_timeout: Duration,
}

impl IngestionPipeline {
    /// Create a pipeline writing to `store` and then `cache`.
    pub fn new(
        store: Arc<dyn OrderStore>,
        cache: Arc<MirrorCache>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            store_timeout,
        }
    }

    /// Process one delivery and decide whether it should be acknowledged.
    ///
    /// Calls for distinct order uids may run concurrently. Calls for the same
    /// uid must not overlap, or the store and cache may finish on different
    /// payloads; [`IngestWorker`] orders them.
    pub async fn process(&self, delivery: &Delivery) -> IngestOutcome {
        let sequence = delivery.sequence;

        let document = match Order::decode(&delivery.data, sequence) {
            Ok(document) => document,
            Err(e) => {
                warn!(sequence, error = %e, "Invalid JSON, leaving message for redelivery");
                return IngestOutcome::Deferred { reason: e };
            }
        };

        let order = match Order::from_document(document, Some(sequence)) {
            Ok(order) => order,
            Err(e) => {
                warn!(sequence, error = %e, "Missing order_uid, discarding message");
                return IngestOutcome::Discarded { reason: e };
            }
        };

        let write = tokio::time::timeout(self.store_timeout, self.store.upsert_order(&order)).await;
        let write = write.unwrap_or_else(|_| {
            Err(OrderError::StoreTimeout {
                operation: "upsert_order".to_string(),
                after: self.store_timeout,
            })
        });
        if let Err(e) = write {
            error!(
                order_uid = %order.order_uid,
                sequence,
                error = %e,
                "Store upsert failed, leaving message for redelivery"
            );
            return IngestOutcome::Deferred { reason: e };
        }

        // The row is committed; only now may the cache see it.
        match order.to_json_bytes() {
            Ok(payload) => self.cache.set(order.order_uid.clone(), payload),
            Err(e) => warn!(
                order_uid = %order.order_uid,
                sequence,
                error = %e,
                "Cache write failed, order remains available from the store"
            ),
        }

        IngestOutcome::Processed {
            order_uid: order.order_uid,
        }
    }
}

/// Background worker that drains a subscription through an [`IngestionPipeline`].
pub struct IngestWorker {
    pipeline: Arc<IngestionPipeline>,
    subscription: Arc<dyn Subscription>,
    config: IngestConfig,
    shutdown: Arc<Notify>,
}

impl IngestWorker {
    /// Create a worker over an open subscription.
    pub fn new(
        pipeline: Arc<IngestionPipeline>,
        subscription: Arc<dyn Subscription>,
        config: IngestConfig,
    ) -> Self {
        Self {
            pipeline,
            subscription,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    ///
    /// Signal with `notify_one` so a shutdown requested while the worker is
    /// busy is not lost.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the worker loop until the shutdown signal is received.
    ///
    /// In-flight deliveries are allowed to finish before the subscription is
    /// closed; nothing new is fetched after the signal.
    pub async fn run(self) {
        let options = self.subscription.options();
        info!(
            subject = %options.subject,
            durable_name = %options.durable_name,
            max_in_flight = self.config.max_in_flight,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Ingest worker started"
        );

        let permits = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let mut in_flight = JoinSet::new();
        // Completion signal of the last dispatched delivery per order uid.
        let mut lanes: HashMap<String, oneshot::Receiver<()>> = HashMap::new();

        'outer: loop {
            while in_flight.try_join_next().is_some() {}
            lanes.retain(|_, done| matches!(done.try_recv(), Err(TryRecvError::Empty)));

            let fetched = tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Ingest worker received shutdown signal");
                    break;
                }

                fetched = self.subscription.fetch(self.config.batch_size.max(1)) => fetched,
            };

            let batch = match fetched {
                Ok(batch) if !batch.is_empty() => batch,
                Ok(_) => {
                    if self.idle().await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Failed to fetch deliveries");
                    if self.idle().await {
                        break;
                    }
                    continue;
                }
            };

            debug!(count = batch.len(), "Fetched deliveries");

            for delivery in batch {
                let permit = tokio::select! {
                    biased;

                    _ = self.shutdown.notified() => {
                        info!("Ingest worker received shutdown signal");
                        break 'outer;
                    }

                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'outer,
                    },
                };

                let (done_tx, done_rx) = oneshot::channel();
                let previous = Order::peek_uid(&delivery.data)
                    .and_then(|order_uid| lanes.insert(order_uid, done_rx));

                let pipeline = self.pipeline.clone();
                let subscription = self.subscription.clone();
                in_flight.spawn(async move {
                    if let Some(previous) = previous {
                        // Err means the earlier task is gone; either way it is done.
                        let _ = previous.await;
                    }
                    handle_delivery(&pipeline, subscription.as_ref(), delivery).await;
                    let _ = done_tx.send(());
                    drop(permit);
                });
            }
        }

        while in_flight.join_next().await.is_some() {}

        if let Err(e) = self.subscription.close().await {
            warn!(error = %e, "Failed to close subscription");
        }

        info!("Ingest worker stopped");
    }

    /// Sleep for the poll interval. Returns `true` if shutdown was signalled.
    async fn idle(&self) -> bool {
        tokio::select! {
            biased;

            _ = self.shutdown.notified() => {
                info!("Ingest worker received shutdown signal");
                true
            }

            _ = tokio::time::sleep(self.config.poll_interval) => false,
        }
    }
}

async fn handle_delivery(
    pipeline: &IngestionPipeline,
    subscription: &dyn Subscription,
    delivery: Delivery,
) {
    if delivery.is_redelivery() {
        debug!(
            sequence = delivery.sequence,
            delivery_count = delivery.delivery_count,
            "Processing redelivered message"
        );
    }

    let outcome = pipeline.process(&delivery).await;
    if let IngestOutcome::Processed { order_uid } = &outcome {
        info!(order_uid = %order_uid, sequence = delivery.sequence, "Order saved");
    }

    if outcome.should_ack()
        && let Err(e) = subscription.ack(delivery.sequence).await
    {
        // Processing already happened; the redelivery will be an idempotent replay.
        warn!(sequence = delivery.sequence, error = %e, "Failed to ack message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{DurableChannel, MemoryChannel, StartPosition, SubscriptionOptions};
    use crate::persistence::MemoryOrderStore;
    use bytes::Bytes;

    fn delivery(sequence: u64, body: &str) -> Delivery {
        Delivery {
            subject: "orders".to_string(),
            sequence,
            data: Bytes::copy_from_slice(body.as_bytes()),
            delivery_count: 1,
        }
    }

    fn pipeline(store: Arc<MemoryOrderStore>, cache: Arc<MirrorCache>) -> IngestionPipeline {
        IngestionPipeline::new(store, cache, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_valid_order_is_stored_then_cached() {
        let store = Arc::new(MemoryOrderStore::new());
        let cache = Arc::new(MirrorCache::new());
        let pipeline = pipeline(store.clone(), cache.clone());

        let outcome = pipeline
            .process(&delivery(1, r#"{"order_uid":"A1","track_number":"T1"}"#))
            .await;

        assert_eq!(
            outcome,
            IngestOutcome::Processed {
                order_uid: "A1".to_string()
            }
        );
        assert!(outcome.should_ack());
        assert!(store.get_order("A1").await.unwrap().is_some());
        assert!(cache.contains("A1"));
    }

    #[tokio::test]
    async fn test_malformed_json_is_deferred() {
        let store = Arc::new(MemoryOrderStore::new());
        let cache = Arc::new(MirrorCache::new());
        let pipeline = pipeline(store.clone(), cache.clone());

        let outcome = pipeline.process(&delivery(1, "{not json")).await;

        assert!(!outcome.should_ack());
        assert!(matches!(
            outcome,
            IngestOutcome::Deferred {
                reason: OrderError::DecodeError { sequence: 1, .. }
            }
        ));
        assert_eq!(store.upsert_calls(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_missing_uid_is_discarded() {
        let store = Arc::new(MemoryOrderStore::new());
        let cache = Arc::new(MirrorCache::new());
        let pipeline = pipeline(store.clone(), cache.clone());

        for body in [r#"{"track_number":"T1"}"#, r#"{"order_uid":""}"#] {
            let outcome = pipeline.process(&delivery(1, body)).await;
            assert!(outcome.should_ack());
            assert!(matches!(
                outcome,
                IngestOutcome::Discarded {
                    reason: OrderError::ValidationError { .. }
                }
            ));
        }

        assert_eq!(store.upsert_calls(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_is_deferred_and_not_cached() {
        let store = Arc::new(MemoryOrderStore::new());
        store.set_fail_writes(true);
        let cache = Arc::new(MirrorCache::new());
        let pipeline = pipeline(store.clone(), cache.clone());

        let outcome = pipeline.process(&delivery(1, r#"{"order_uid":"A1"}"#)).await;

        assert!(!outcome.should_ack());
        assert!(!cache.contains("A1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out() {
        let store = Arc::new(MemoryOrderStore::new());
        store.set_latency(Duration::from_secs(30));
        let cache = Arc::new(MirrorCache::new());
        let pipeline = pipeline(store.clone(), cache.clone());

        let outcome = pipeline.process(&delivery(1, r#"{"order_uid":"A1"}"#)).await;

        assert!(matches!(
            outcome,
            IngestOutcome::Deferred {
                reason: OrderError::StoreTimeout { .. }
            }
        ));
        assert!(!cache.contains("A1"));
    }

    #[tokio::test]
    async fn test_replayed_message_is_idempotent() {
        let store = Arc::new(MemoryOrderStore::new());
        let cache = Arc::new(MirrorCache::new());
        let pipeline = pipeline(store.clone(), cache.clone());
        let body = r#"{"order_uid":"A1","track_number":"T1"}"#;

        pipeline.process(&delivery(1, body)).await;
        let first = cache.get("A1").unwrap();
        pipeline.process(&delivery(1, body)).await;

        assert_eq!(store.count_orders().await.unwrap(), 1);
        assert_eq!(cache.get("A1").unwrap(), first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_acks_processed_and_leaves_invalid_pending() {
        let channel = MemoryChannel::new();
        let good = channel
            .publish("orders", br#"{"order_uid":"A1"}"#)
            .await
            .unwrap();
        let bad = channel.publish("orders", b"garbage").await.unwrap();
        let poison = channel
            .publish("orders", br#"{"track_number":"T"}"#)
            .await
            .unwrap();

        let options = SubscriptionOptions::new("orders", "d1").start(StartPosition::AllAvailable);
        let subscription: Arc<dyn Subscription> = Arc::from(channel.subscribe(&options).await.unwrap());

        let store = Arc::new(MemoryOrderStore::new());
        let cache = Arc::new(MirrorCache::new());
        let worker = IngestWorker::new(
            Arc::new(pipeline(store.clone(), cache.clone())),
            subscription,
            IngestConfig::default(),
        );
        let shutdown = worker.shutdown_handle();
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.notify_one();
        handle.await.unwrap();

        assert!(channel.is_acked("d1", good).await);
        assert!(channel.is_acked("d1", poison).await);
        assert!(!channel.is_acked("d1", bad).await);
        assert!(cache.contains("A1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_orders_same_uid_and_overlaps_distinct_uids() {
        let channel = MemoryChannel::new();
        let older = channel
            .publish("orders", br#"{"order_uid":"A1","track_number":"SLOW"}"#)
            .await
            .unwrap();
        let newer = channel
            .publish("orders", br#"{"order_uid":"A1","track_number":"FAST"}"#)
            .await
            .unwrap();
        let other = channel
            .publish("orders", br#"{"order_uid":"B1","track_number":"FAST"}"#)
            .await
            .unwrap();

        let options = SubscriptionOptions::new("orders", "d1").start(StartPosition::AllAvailable);
        let subscription: Arc<dyn Subscription> = Arc::from(channel.subscribe(&options).await.unwrap());

        let store = Arc::new(MemoryOrderStore::new());
        store.set_track_latency("SLOW", Duration::from_millis(200)).await;
        let cache = Arc::new(MirrorCache::new());
        let worker = IngestWorker::new(
            Arc::new(pipeline(store.clone(), cache.clone())),
            subscription,
            IngestConfig::default(),
        );
        let shutdown = worker.shutdown_handle();
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(channel.is_acked("d1", other).await);
        assert!(!channel.is_acked("d1", older).await);
        assert!(!channel.is_acked("d1", newer).await);

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.notify_one();
        handle.await.unwrap();

        assert!(channel.is_acked("d1", older).await);
        assert!(channel.is_acked("d1", newer).await);

        let record = store.get_order_record("A1").await.unwrap().unwrap();
        assert_eq!(record.track_number, "FAST");
        assert_eq!(record.received_sequence, Some(newer as i64));
        assert_eq!(cache.get("A1"), store.get_order("A1").await.unwrap());
    }
}
