//! # Backfill Harness Core
//!
//! Runtime-agnostic logic for Backfill Harness: data models, density
//! analysis, batch planning, the progress and sink abstractions, and the
//! resumable ingestion engine built on top of them.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. Concrete
//! backends (SQLite sink, JSON progress file, CSV sources) live in the
//! `backfill-harness` crate; in-memory backends live here for tests.
//!
//! ```text
//! Source ──▶ distribution ──▶ planner ──▶ engine ──▶ Sink
//!                                          │  ▲
//!                                          ▼  │
//!                                     ProgressStore ◀── monitor
//! ```

pub mod dedupe;
pub mod distribution;
pub mod engine;
pub mod events;
pub mod models;
pub mod monitor;
pub mod period;
pub mod planner;
pub mod progress;
pub mod retry;
pub mod sink;
pub mod source;
pub mod transform;
pub mod verify;
