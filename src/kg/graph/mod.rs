//! Graph identity and merge.

pub mod keys;
pub mod upsert;

pub use upsert::GraphUpserter;
