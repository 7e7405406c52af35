//! # nl2kql
//!
//! Retrieval-grounded translation of natural-language questions about
//! log-analytics data into validated KQL queries.
//!
//! Workspace knowledge (field descriptions, sample field values, table
//! schemas and worked question/query examples) is embedded into four
//! collections. Each question is embedded once, the collections are
//! searched, the candidates are ranked into a bounded context, a language
//! model writes the query, and the validator repairs and checks it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌────────────┐
//! │   Schema     │──▶│   Ingest     │──▶│   SQLite    │
//! │  snapshot    │   │ Describe+Emb │   │ 4 collections│
//! └──────────────┘   └──────────────┘   └─────┬──────┘
//!                                             │
//!           ┌─────────────────────────────────┤
//!           ▼                                 ▼
//!   ┌───────────────┐   ┌──────────┐   ┌────────────┐
//!   │ Retrieve→Rank │──▶│ Generate │──▶│  Validate   │
//!   └───────────────┘   └──────────┘   └────────────┘
//!                 (any stage failure → fallback)
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite-backed context store and feedback log |
//! | [`embedding`] | Embedding providers with hash fallback |
//! | [`generation`] | Chat-completion query generation |
//! | [`workflow`] | Staged orchestration, feedback and status |
//! | [`ingest`] | Schema snapshot ingestion and example seeding |
//! | [`server`] | HTTP server |
//!
//! Pure logic (data model, ranking, validation, in-memory store) lives in
//! the `nl2kql-core` crate.

pub mod config;
pub mod db;
pub mod embedding;
pub mod generation;
pub mod ingest;
pub mod migrate;
pub mod server;
pub mod sqlite_store;
pub mod workflow;
