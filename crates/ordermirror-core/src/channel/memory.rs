// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process durable channel.
//!
//! Same delivery semantics as [`PgChannel`](super::PgChannel) without a
//! database. Deadlines use [`tokio::time::Instant`], so tests running on a
//! paused clock can step past the ack wait with `tokio::time::advance`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::OrderError;

use super::{Delivery, DurableChannel, StartPosition, Subscription, SubscriptionOptions};

#[derive(Debug)]
struct DeliveryState {
    count: u32,
    redeliver_at: Instant,
    acked: bool,
}

#[derive(Debug)]
struct DurableState {
    subject: String,
    start_sequence: u64,
    deliveries: HashMap<u64, DeliveryState>,
}

#[derive(Debug, Default)]
struct ChannelState {
    last_sequence: u64,
    messages: BTreeMap<u64, (String, Bytes)>,
    durables: HashMap<String, DurableState>,
    closed: bool,
}

/// In-memory durable channel.
#[derive(Debug, Clone, Default)]
pub struct MemoryChannel {
    state: Arc<Mutex<ChannelState>>,
}

impl MemoryChannel {
    /// Create an empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `sequence` has been acknowledged by `durable_name`.
    pub async fn is_acked(&self, durable_name: &str, sequence: u64) -> bool {
        let state = self.state.lock().await;
        state
            .durables
            .get(durable_name)
            .and_then(|d| d.deliveries.get(&sequence))
            .is_some_and(|d| d.acked)
    }

    /// How many times `sequence` was handed to `durable_name` (0 if never).
    pub async fn delivery_count(&self, durable_name: &str, sequence: u64) -> u32 {
        let state = self.state.lock().await;
        state
            .durables
            .get(durable_name)
            .and_then(|d| d.deliveries.get(&sequence))
            .map_or(0, |d| d.count)
    }

    /// Messages visible to `durable_name` that it has not acknowledged.
    pub async fn pending_count(&self, durable_name: &str) -> usize {
        let state = self.state.lock().await;
        let Some(durable) = state.durables.get(durable_name) else {
            return 0;
        };
        state
            .messages
            .range(durable.start_sequence..)
            .filter(|(seq, (subject, _))| {
                *subject == durable.subject
                    && !durable.deliveries.get(seq).is_some_and(|d| d.acked)
            })
            .count()
    }
}

#[async_trait]
impl DurableChannel for MemoryChannel {
    async fn publish(&self, subject: &str, data: &[u8]) -> Result<u64, OrderError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(OrderError::channel("publish", "channel is closed"));
        }

        state.last_sequence += 1;
        let sequence = state.last_sequence;
        state
            .messages
            .insert(sequence, (subject.to_string(), Bytes::copy_from_slice(data)));
        Ok(sequence)
    }

    async fn subscribe(
        &self,
        options: &SubscriptionOptions,
    ) -> Result<Box<dyn Subscription>, OrderError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(OrderError::channel("subscribe", "channel is closed"));
        }

        let start_sequence = match options.start {
            StartPosition::NewOnly => state.last_sequence + 1,
            StartPosition::AllAvailable => 1,
        };

        let durable = state
            .durables
            .entry(options.durable_name.clone())
            .or_insert_with(|| DurableState {
                subject: options.subject.clone(),
                start_sequence,
                deliveries: HashMap::new(),
            });

        if durable.subject != options.subject {
            return Err(OrderError::channel(
                "subscribe",
                format!(
                    "durable '{}' is bound to subject '{}'",
                    options.durable_name, durable.subject
                ),
            ));
        }

        Ok(Box::new(MemorySubscription {
            state: self.state.clone(),
            options: options.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), OrderError> {
        self.state.lock().await.closed = true;
        Ok(())
    }
}

/// Subscription handle for [`MemoryChannel`].
#[derive(Debug)]
pub struct MemorySubscription {
    state: Arc<Mutex<ChannelState>>,
    options: SubscriptionOptions,
    closed: AtomicBool,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn fetch(&self, max: usize) -> Result<Vec<Delivery>, OrderError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OrderError::channel("fetch", "subscription is closed"));
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.closed {
            return Err(OrderError::channel("fetch", "channel is closed"));
        }

        let durable = state
            .durables
            .get_mut(&self.options.durable_name)
            .ok_or_else(|| OrderError::channel("fetch", "durable subscription vanished"))?;

        let now = Instant::now();
        let mut claimed = Vec::new();

        for (&sequence, (subject, data)) in state.messages.range(durable.start_sequence..) {
            if claimed.len() >= max {
                break;
            }
            if *subject != durable.subject {
                continue;
            }

            let count = match durable.deliveries.get_mut(&sequence) {
                None => {
                    durable.deliveries.insert(
                        sequence,
                        DeliveryState {
                            count: 1,
                            redeliver_at: now + self.options.ack_wait,
                            acked: false,
                        },
                    );
                    1
                }
                Some(delivery) if !delivery.acked && delivery.redeliver_at <= now => {
                    delivery.count += 1;
                    delivery.redeliver_at = now + self.options.ack_wait;
                    delivery.count
                }
                Some(_) => continue,
            };

            claimed.push(Delivery {
                subject: subject.clone(),
                sequence,
                data: data.clone(),
                delivery_count: count,
            });
        }

        Ok(claimed)
    }

    async fn ack(&self, sequence: u64) -> Result<(), OrderError> {
        let mut state = self.state.lock().await;
        let delivery = state
            .durables
            .get_mut(&self.options.durable_name)
            .and_then(|d| d.deliveries.get_mut(&sequence))
            .ok_or_else(|| {
                OrderError::channel("ack", format!("sequence {} was never delivered", sequence))
            })?;
        delivery.acked = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), OrderError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn options(&self) -> &SubscriptionOptions {
        &self.options
    }
}
