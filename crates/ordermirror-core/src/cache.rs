// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory mirror of the order store.
//!
//! Entries map an order uid to its serialized JSON document. The map is
//! sharded, so a write only locks the shard holding that uid and readers of
//! other shards are never blocked.
//!
//! Only values that were already committed to the store may be written here;
//! the cache can lag the store but must never lead it.

use bytes::Bytes;
use dashmap::DashMap;

/// Concurrent uid → document map.
#[derive(Debug, Default)]
pub struct MirrorCache {
    entries: DashMap<String, Bytes>,
}

impl MirrorCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the entry for `order_uid`.
    pub fn set(&self, order_uid: impl Into<String>, payload: Bytes) {
        self.entries.insert(order_uid.into(), payload);
    }

    /// Insert `payload` only if `order_uid` has no entry yet, and return the
    /// entry that is cached afterwards.
    ///
    /// Used for read-path backfill: a value read from the store may already be
    /// older than one ingestion has since mirrored.
    pub fn set_if_absent(&self, order_uid: impl Into<String>, payload: Bytes) -> Bytes {
        self.entries
            .entry(order_uid.into())
            .or_insert(payload)
            .value()
            .clone()
    }

    /// Read the entry for `order_uid`; `None` is a miss.
    pub fn get(&self, order_uid: &str) -> Option<Bytes> {
        self.entries.get(order_uid).map(|entry| entry.value().clone())
    }

    /// Bulk-load entries, overwriting any existing uids. Returns how many
    /// entries were loaded.
    ///
    /// Meant for startup, before ingestion begins.
    pub fn seed<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = (String, Bytes)>,
    {
        let mut loaded = 0;
        for (order_uid, payload) in entries {
            self.entries.insert(order_uid, payload);
            loaded += 1;
        }
        loaded
    }

    /// Whether `order_uid` is cached.
    pub fn contains(&self, order_uid: &str) -> bool {
        self.entries.contains_key(order_uid)
    }

    /// Number of cached orders.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
