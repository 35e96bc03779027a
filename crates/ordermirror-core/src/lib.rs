// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! OrderMirror Core - Order Ingestion and Lookup Service
//!
//! This crate consumes order documents from a durable channel, persists them
//! to a relational store, mirrors them in memory and serves point lookups
//! over HTTP.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────┐
//! │      Publishers       │
//! │   (ordermirror-ctl)   │
//! └───────────────────────┘
//!           │ publish(subject, bytes)
//!           ▼
//! ┌───────────────────────┐   fetch / ack    ┌─────────────────────────────┐
//! │    DurableChannel     │◄─────────────────│        IngestWorker         │
//! │ (PostgreSQL / memory) │                  │  IngestionPipeline::process │
//! └───────────────────────┘                  └─────────────────────────────┘
//!                                               │ 1. upsert         │ 2. set
//!                                               ▼                   ▼
//!                                   ┌───────────────────┐  ┌───────────────┐
//!                                   │    OrderStore     │  │  MirrorCache  │
//!                                   │ (Postgres/SQLite) │  │   (sharded)   │
//!                                   └───────────────────┘  └───────────────┘
//!                                               ▲                   ▲
//!                                      miss     │                   │ hit
//!                                               └──── QueryService ─┘
//!                                                         ▲
//!                                                         │ GET /order/{id}
//!                                                   HTTP clients
//! ```
//!
//! # Delivery Outcomes
//!
//! | Message | Outcome | Acked |
//! |---------|---------|-------|
//! | valid JSON object with `order_uid`, stored | `Processed` | yes |
//! | JSON object without `order_uid` | `Discarded` | yes |
//! | not a JSON object | `Deferred` | no, redelivered after `ack_wait` |
//! | store error or timeout | `Deferred` | no, redelivered after `ack_wait` |
//!
//! The cache is written only after the store write succeeds, so every cached
//! entry is also in the store.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables; see [`config`].
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `ORDERMIRROR_DATABASE_URL` | local PostgreSQL | `postgres://` or `sqlite:` URL |
//! | `ORDERMIRROR_CHANNEL_URL` | database URL | PostgreSQL URL for the channel |
//! | `ORDERMIRROR_SUBJECT` | `orders` | Subject to consume |
//! | `ORDERMIRROR_DURABLE_NAME` | `order-durable` | Durable subscription name |
//! | `ORDERMIRROR_ACK_WAIT_SECS` | `60` | Redelivery wait |
//! | `ORDERMIRROR_HTTP_PORT` | `8080` | HTTP port |
//!
//! # Modules
//!
//! - [`cache`]: In-memory mirror
//! - [`channel`]: Durable channel traits and backends
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types with stable error codes
//! - [`ingest`]: Delivery processing and the consumption loop
//! - [`persistence`]: Order store trait and backends
//! - [`query`]: Cache-aside lookups
//! - [`runtime`]: Embeddable runtime wiring everything together
//! - [`server`]: HTTP routes

#![deny(missing_docs)]

/// Concurrent in-memory mirror of stored orders.
pub mod cache;

/// Durable publish/subscribe channel with PostgreSQL and in-memory backends.
pub mod channel;

/// Service configuration loaded from environment variables.
pub mod config;

/// Error types with stable error codes.
pub mod error;

/// Delivery processing pipeline and ingest worker.
pub mod ingest;

/// Embedded database migrations.
pub mod migrations;

/// Order document model.
pub mod models;

/// Order storage with PostgreSQL, SQLite and in-memory backends.
pub mod persistence;

/// Cache-aside order lookups.
pub mod query;

/// Embeddable runtime for running the service inside a tokio application.
pub mod runtime;

/// HTTP routes and server.
pub mod server;

pub use error::OrderError;
