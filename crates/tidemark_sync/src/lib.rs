//! # Tidemark Sync
//!
//! Sync state machine and engine for Tidemark.
//!
//! This crate provides:
//! - Sync state machine (idle → draining → pulling → reconciling)
//! - Push of queued local mutations with per-entity ordering
//! - Cursor-based pull of remote changes
//! - Deterministic conflict resolution with field-level merge
//! - Retry with exponential backoff driven by the connectivity signal
//! - A background driver and a UI-facing client facade
//!
//! ## Architecture
//!
//! The engine implements a **push-then-pull** reconciliation model:
//! 1. Drain the pending operation log to the remote gateway
//! 2. Pull remote changes since the persisted cursor
//! 3. Apply pulls, routing diverged entities through the resolver
//!
//! The remote gateway is a narrow capability interface; any document
//! store satisfying push-batch / pull-since semantics can sit behind
//! it.
//!
//! ## Key Invariants
//!
//! - At most one sync cycle runs at a time
//! - Per-entity push order equals enqueue order
//! - The cursor advances only after a whole pull page is applied
//! - No queued mutation is dropped without an acknowledgement, a
//!   surfaced conflict, or an indefinite retry

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod connectivity;
mod driver;
mod engine;
mod error;
mod events;
mod gateway;

pub use client::SyncClient;
pub use config::{RetryConfig, SyncConfig};
pub use connectivity::{ConnectivityHandle, ConnectivityMonitor};
pub use driver::SyncDriver;
pub use engine::{CycleSummary, EngineState, SyncEngine, SyncStats};
pub use error::{SyncError, SyncResult};
pub use events::{EventFeed, EventReceiver, SyncEvent};
pub use gateway::{MemoryGateway, PullPage, PushOutcome, RemoteChange, RemoteGateway};
