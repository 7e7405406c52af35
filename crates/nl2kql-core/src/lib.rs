//! # nl2kql Core
//!
//! Pure logic shared by the nl2kql application: the context item data
//! model, the [`store::Store`] abstraction with an in-memory backend,
//! the relevance ranker, the KQL validator/auto-corrector, and the
//! deterministic hash embedder used when no embedding model is available.
//!
//! This crate performs no network, filesystem or database I/O and has no
//! async runtime dependency. The application crate supplies concrete
//! embedding and generation backends plus the SQLite store.

pub mod embedding;
pub mod error;
pub mod models;
pub mod ranking;
pub mod store;
pub mod validate;

pub use error::{CoreError, Result};
