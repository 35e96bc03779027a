// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable publish/subscribe channel.
//!
//! At-least-once delivery with per-subject sequence numbers and manual
//! acknowledgment. Consumers pull deliveries through a [`Subscription`]; a
//! delivery that is not acknowledged within the subscription's `ack_wait` is
//! handed out again with a higher `delivery_count`.
//!
//! Durable subscriptions keep their position across restarts: subscribing
//! again with the same durable name resumes where the previous consumer
//! stopped, including any deliveries it never acknowledged.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryChannel;
pub use self::postgres::PgChannel;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::OrderError;

/// Where a brand-new durable subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Only messages published after the durable was first created.
    #[default]
    NewOnly,
    /// Every message still retained on the subject.
    AllAvailable,
}

/// Options for opening a durable subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    /// Subject to consume.
    pub subject: String,
    /// Durable name; position and unacked deliveries are tracked per name.
    pub durable_name: String,
    /// Identifies the consuming process in delivery bookkeeping.
    pub client_id: String,
    /// How long a delivery may stay unacknowledged before redelivery.
    pub ack_wait: Duration,
    /// Start position used only when the durable does not exist yet.
    pub start: StartPosition,
}

impl SubscriptionOptions {
    /// Options with the defaults used by the order service.
    pub fn new(subject: impl Into<String>, durable_name: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            durable_name: durable_name.into(),
            client_id: "order-service-1".to_string(),
            ack_wait: Duration::from_secs(60),
            start: StartPosition::NewOnly,
        }
    }

    /// Set the redelivery wait.
    pub fn ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// Set the start position for a new durable.
    pub fn start(mut self, start: StartPosition) -> Self {
        self.start = start;
        self
    }

    /// Set the client id.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Subject the message was published on.
    pub subject: String,
    /// Channel-assigned sequence, monotonically increasing per channel.
    pub sequence: u64,
    /// Raw message body.
    pub data: Bytes,
    /// How many times this message has been handed out to the durable,
    /// including this delivery.
    pub delivery_count: u32,
}

impl Delivery {
    /// Whether this message was delivered before and not acknowledged.
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

/// Publishing side and subscription factory.
#[async_trait]
pub trait DurableChannel: Send + Sync {
    /// Publish a message, returning its sequence.
    async fn publish(&self, subject: &str, data: &[u8]) -> Result<u64, OrderError>;

    /// Open (or resume) a durable subscription.
    async fn subscribe(
        &self,
        options: &SubscriptionOptions,
    ) -> Result<Box<dyn Subscription>, OrderError>;

    /// Release the connection. Durable state is kept.
    async fn close(&self) -> Result<(), OrderError>;
}

/// Pull-based consumer handle for one durable subscription.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Claim up to `max` deliveries that are due (new, or past their ack wait).
    ///
    /// Returns an empty vector when nothing is due; never blocks waiting for
    /// new messages.
    async fn fetch(&self, max: usize) -> Result<Vec<Delivery>, OrderError>;

    /// Acknowledge a delivery so it is never handed out again.
    async fn ack(&self, sequence: u64) -> Result<(), OrderError>;

    /// Stop consuming. Unacknowledged deliveries stay pending for the durable.
    async fn close(&self) -> Result<(), OrderError>;

    /// The options the subscription was opened with.
    fn options(&self) -> &SubscriptionOptions;
}
