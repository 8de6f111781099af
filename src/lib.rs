//! Knowledge-Graph Builder
//!
//! Builds a structured entity/relation graph from a knowledge base's
//! pre-chunked, pre-embedded text, using a language model for extraction and
//! SurrealDB for both bookkeeping and the graph itself.
//!
//! # Architecture
//!
//! - **Server**: Axum HTTP API with an SSE event stream
//! - **LLM**: Protocol-agnostic drivers for Chat Completions and Responses APIs
//! - **Pipeline**: Extraction, graph build and embedding schedulers
//!
//! # Modules
//!
//! - [`config`]: Layered configuration
//! - [`llm`]: LLM driver traits and implementations
//! - [`kg`]: The construction pipeline
//! - [`server`]: HTTP server bootstrap

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::assigning_clones)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod config;
pub mod kg;
pub mod llm;
pub mod server;

pub use kg::KgService;
