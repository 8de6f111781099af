//! Domain models for the knowledge-graph pipeline.

pub mod events;
pub mod graph;
pub mod task;

pub use events::KgEvent;
pub use graph::{ExtractionResult, MergeSummary, ParsedEntity, ParsedRelation, StaleEntity};
pub use task::{ChunkRecord, GraphTarget, SourceTable, Stage, TaskRecord, WorkStatus, derive_status};
