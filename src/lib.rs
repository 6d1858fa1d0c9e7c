//! # Backfill Harness
//!
//! A resumable, density-aware historical backfill harness.
//!
//! Backfill Harness moves the history of one or more datasets from a source
//! (CSV or JSON Lines files) into a SQLite target. Each dataset is profiled
//! by timestamp, split into month or week batches sized to the observed row
//! density, and ingested batch by batch with a durable per-batch checkpoint,
//! so an interrupted run picks up exactly where it stopped.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │  Sources    │──▶│  Analyzer   │──▶│   Engine     │──▶│  SQLite  │
//! │  CSV/JSONL  │   │  + Planner  │   │ chunk+upsert │   │  target  │
//! └─────────────┘   └─────────────┘   └──────┬───────┘   └────┬─────┘
//!                                            │                │
//!                                            ▼                ▼
//!                                      ┌──────────┐     ┌──────────┐
//!                                      │ Progress │     │ Verifier │
//!                                      │  store   │     │ + Dedupe │
//!                                      └────┬─────┘     └──────────┘
//!                                           ▼
//!                                      ┌──────────┐
//!                                      │ Monitor  │
//!                                      └──────────┘
//! ```
//!
//! The planning, engine, verification and monitoring logic lives in the
//! runtime-agnostic `backfill-harness-core` crate; this crate supplies the
//! configuration, the file sources, the SQLite sink and progress stores,
//! and the `backfill` CLI.
//!
//! ## Quick Start
//!
//! ```bash
//! backfill init                 # create target + progress tables
//! backfill datasets             # check configured sources
//! backfill plan transactions    # dry-run the batch plan
//! backfill ingest all           # run (or resume) the backfill
//! backfill monitor              # watch progress from another shell
//! backfill verify all           # compare source and target
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sources`] | Dataset sources and the `datasets` listing |
//! | [`connector_csv`] | CSV file source |
//! | [`connector_jsonl`] | JSON Lines file source |
//! | [`sink_sqlite`] | SQLite target sink |
//! | [`progress_file`] | JSON-file progress store |
//! | [`progress_sqlite`] | SQLite progress store |
//! | [`progress`] | Progress reporters and store selection |
//! | [`ingest`] | Ingest and reset commands |
//! | [`plan`] | Dry-run planning |
//! | [`verify`] | Source/target verification |
//! | [`dedupe`] | Duplicate removal |
//! | [`monitor`] | Live progress view |
//! | [`logging`] | Tracing setup |

pub mod clock;
pub mod config;
pub mod connector_csv;
pub mod connector_jsonl;
pub mod db;
pub mod dedupe;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod monitor;
pub mod plan;
pub mod progress;
pub mod progress_file;
pub mod progress_sqlite;
pub mod sink_sqlite;
pub mod sources;
pub mod verify;
