// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cache-aside order lookups.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, instrument, warn};

use crate::cache::MirrorCache;
use crate::persistence::OrderStore;

/// Result of a lookup, tagged with where the payload came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Served from the in-memory mirror.
    Cache(Bytes),
    /// Served from the store; the cache has been backfilled, unless
    /// ingestion mirrored the order first, in which case that entry is returned.
    Store(Bytes),
    /// Absent from both layers, or the store could not answer.
    NotFound,
}

/// Point lookups by order uid.
pub struct QueryService {
    cache: Arc<MirrorCache>,
    store: Arc<dyn OrderStore>,
    read_timeout: Duration,
}

impl QueryService {
    /// Create a query service. `read_timeout` bounds each store read.
    pub fn new(
        cache: Arc<MirrorCache>,
        store: Arc<dyn OrderStore>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            store,
            read_timeout,
        }
    }

    /// Look up an order: cache first, then the store with backfill.
    ///
    /// Store errors and timeouts are logged and reported as [`Lookup::NotFound`].
    /// Dropping the returned future abandons the store read.
    #[instrument(skip(self))]
    pub async fn lookup(&self, order_uid: &str) -> Lookup {
        if let Some(payload) = self.cache.get(order_uid) {
            debug!("Cache hit");
            return Lookup::Cache(payload);
        }

        match tokio::time::timeout(self.read_timeout, self.store.get_order(order_uid)).await {
            Ok(Ok(Some(payload))) => {
                let payload = self.cache.set_if_absent(order_uid, payload);
                debug!("Loaded from store, cache backfilled");
                Lookup::Store(payload)
            }
            Ok(Ok(None)) => Lookup::NotFound,
            Ok(Err(e)) => {
                warn!(error = %e, "Store read failed");
                Lookup::NotFound
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.read_timeout.as_millis() as u64,
                    "Store read timed out"
                );
                Lookup::NotFound
            }
        }
    }
}
