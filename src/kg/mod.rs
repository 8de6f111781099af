//! Knowledge-graph construction pipeline.
//!
//! Three independently scheduled stages turn a knowledge base's chunk table
//! into an entity/relation graph:
//!
//! 1. [`scheduler::ExtractionScheduler`]: language-model extraction per chunk.
//! 2. [`scheduler::BuildScheduler`]: parse the cached output and merge it into
//!    the graph tables.
//! 3. [`scheduler::EmbeddingScheduler`]: embed stale entities and refresh the
//!    vector index.
//!
//! Bookkeeping rows live in the store's home database; graph tables live in
//! each knowledge base's own database.

pub mod api;
pub mod domain;
pub mod embedding;
pub mod error;
pub mod events;
pub mod extraction;
pub mod graph;
pub mod persistence;
pub mod scheduler;
pub mod service;
pub mod submit;
pub mod telemetry;

pub use error::{KgError, Result};
pub use service::KgService;
