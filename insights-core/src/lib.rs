//! # Insights Core
//!
//! Orchestrates incremental scans over an append-only, time-ordered package
//! catalog. Each scan covers the half-open commit window `(min, max]` for one
//! driver and moves through a persisted state machine; progress survives
//! process restarts because every step is driven by queue messages and table
//! rows.
//!
//! ## Overview
//!
//! - **Cursors**: named high-water marks per driver, advanced when a scan
//!   completes
//! - **Leases**: conditional-write mutual exclusion with background renewal
//! - **Prefix scans**: breadth-first enumeration of large partitions by key
//!   prefix
//! - **Table scans**: prefix scans fanned out over the queue, such as table
//!   copies
//! - **Dispatch**: schema-tagged envelopes, batching and partial batch retry
//! - **Scan state machine**: index, page, and leaf fan-out with aggregation
//! - **Timers**: lease-guarded periodic jobs such as the catalog update timer
//!
//! ## Feature Flags
//!
//! - `postgres`: PostgreSQL-backed table store and message queue (SQLx)
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use insights_core::{
//!     config::InsightsConfig,
//!     runtime::{InsightsServices, WorkerRuntime},
//! };
//!
//! async fn run() -> insights_core::Result<()> {
//!     let services = InsightsServices::builder(InsightsConfig::default())
//!         .with_configured_storage()
//!         .await?
//!         .build()?;
//!     services.initialize().await?;
//!
//!     let runtime = WorkerRuntime::new(Arc::new(services));
//!     runtime.start(true).await?;
//!     runtime.shutdown().await
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod cursor;
pub mod dispatcher;
pub mod drivers;
pub mod error;
pub mod lease;
pub mod messages;
pub mod queue;
pub mod runtime;
pub mod scan;
pub mod storage;
pub mod table_scan;
pub mod timer;

pub use error::{InsightsError, Result};
