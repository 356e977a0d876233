//! # drive-ingest
//!
//! Incremental document ingestion from a shared drive into an analytics
//! warehouse and a managed search index.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌─────────────────┐   ┌──────────────┐
//! │ Drive       │──▶│ Change       │──▶│ Extract + Chunk │──▶│  Embeddings  │
//! │ listing     │   │ detection    │   │ (per file)      │   │  (batched)   │
//! └─────────────┘   └──────┬───────┘   └─────────────────┘   └──────┬───────┘
//!                          │ ledger                                 │
//!                          ▼                                        ▼
//!                    ┌──────────┐                       ┌────────────────────┐
//!                    │  SQLite  │◀──── commit ──────────│ Warehouse + JSONL  │
//!                    └──────────┘                       └─────────┬──────────┘
//!                                                                 ▼
//!                                                    ┌────────────────────────┐
//!                                                    │ Index Ingestor         │
//!                                                    │ schema reconcile+import│
//!                                                    └────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! drive-ingest init                     # create database
//! drive-ingest process                  # drive → warehouse + export
//! drive-ingest ingest data/exports/documents_20240301_090507.jsonl
//! drive-ingest run                      # both stages, prints a run id
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Pipeline error taxonomy |
//! | [`drive`] | Drive listing and content fetch |
//! | [`change`] | Two-stage change detection |
//! | [`ledger`] | Seen-file ledger |
//! | [`extract`] | Multi-format text extraction |
//! | [`ocr`] | Image text recognition |
//! | [`chunk`] | Overlapping boundary-seeking chunker |
//! | [`embedding`] | Embedding service and batching requester |
//! | [`warehouse`] | Chunk record sinks |
//! | [`export`] | JSONL export artifact |
//! | [`index`] | Search index contract and client |
//! | [`reconcile`] | Schema reconciliation state machine |
//! | [`process`] | Document Processor stage |
//! | [`ingest`] | Index Ingestor stage |
//! | [`pipeline`] | Config-driven wiring and the full run |
//! | [`retry`] | Backoff policy |
//! | [`gcp`] | Authorized HTTP for Google APIs |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod change;
pub mod chunk;
pub mod config;
pub mod db;
pub mod drive;
pub mod embedding;
pub mod error;
pub mod export;
pub mod extract;
pub mod gcp;
pub mod index;
pub mod ingest;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod ocr;
pub mod pipeline;
pub mod process;
pub mod reconcile;
pub mod retry;
pub mod warehouse;
