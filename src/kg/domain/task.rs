//! Task and Chunk Bookkeeping Models
//!
//! Rows of the scheduler's home tables. The same shapes serve both pipeline
//! stages: stage 1 (extraction) fills `content`/`result`, stage 2 (graph
//! build) fills `source_chunk` and the entity/relation counters.

use serde::{Deserialize, Serialize};

use crate::kg::persistence::DbTarget;

// =============================================================================
// Status
// =============================================================================

/// Lifecycle status shared by tasks and chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Waiting to be claimed.
    #[default]
    Pending,
    /// Claimed by a scheduler and in flight.
    Progressing,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl WorkStatus {
    /// Wire value stored in the bookkeeping tables.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Progressing => "progressing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the status is final for a scheduler.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Scheduler-driven transitions are monotonic:
    /// `pending -> progressing -> {completed, failed}`.
    ///
    /// Crash recovery and cancellation may also fail a chunk that never left
    /// `pending`, which keeps the observed sequence a subsequence of the
    /// lifecycle.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Progressing)
                | (Self::Pending, Self::Failed)
                | (Self::Progressing, Self::Completed)
                | (Self::Progressing, Self::Failed)
        )
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive a task status from its chunk counters.
///
/// A task is terminal only once every chunk is terminal; it is `failed` if
/// any chunk failed.
pub fn derive_status(total: u32, completed: u32, failed: u32, progressing: u32) -> WorkStatus {
    if completed + failed >= total {
        if failed > 0 {
            WorkStatus::Failed
        } else {
            WorkStatus::Completed
        }
    } else if progressing > 0 || completed > 0 || failed > 0 {
        WorkStatus::Progressing
    } else {
        WorkStatus::Pending
    }
}

// =============================================================================
// Locations
// =============================================================================

/// Address of a source chunk table (read-only input).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceTable {
    pub namespace: String,
    pub database: String,
    pub table: String,
}

impl SourceTable {
    pub fn db_target(&self) -> DbTarget {
        DbTarget::new(&self.namespace, &self.database)
    }
}

/// Address of a knowledge base's graph tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphTarget {
    pub namespace: String,
    pub database: String,
    /// Base name from which the four graph table names are derived.
    pub table_base: String,
}

impl GraphTarget {
    pub fn db_target(&self) -> DbTarget {
        DbTarget::new(&self.namespace, &self.database)
    }
}

// =============================================================================
// Stage
// =============================================================================

/// Which scheduler stage a task/chunk row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Stage 1: language-model extraction.
    Extraction,
    /// Stage 2: parse and merge into graph tables.
    Build,
}

impl Stage {
    pub fn task_table(self) -> &'static str {
        match self {
            Self::Extraction => "kg_task",
            Self::Build => "kg_build_task",
        }
    }

    pub fn chunk_table(self) -> &'static str {
        match self {
            Self::Extraction => "kg_chunk",
            Self::Build => "kg_build_chunk",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Build => "build",
        }
    }
}

// =============================================================================
// Rows
// =============================================================================

/// A task row (`kg_task` or `kg_build_task`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub key: String,
    pub kb_id: String,
    pub file_key: String,
    pub status: WorkStatus,
    pub chunks_total: u32,
    #[serde(default)]
    pub chunks_completed: u32,
    #[serde(default)]
    pub chunks_failed: u32,
    pub source: SourceTable,
    pub target: GraphTarget,
    /// Entities merged so far (build tasks only).
    #[serde(default)]
    pub entities_total: u64,
    /// Relations merged so far (build tasks only).
    #[serde(default)]
    pub relations_total: u64,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub finished_at: Option<String>,
}

impl TaskRecord {
    /// Invariant: `chunks_completed + chunks_failed <= chunks_total`.
    pub fn counters_consistent(&self) -> bool {
        self.chunks_completed + self.chunks_failed <= self.chunks_total
    }
}

/// A chunk row (`kg_chunk` or `kg_build_chunk`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub key: String,
    pub task_id: String,
    pub chunk_index: u32,
    pub status: WorkStatus,
    pub file_key: String,
    /// Record key of the originating source row, without its table.
    pub source_row: String,
    /// Chunk text (extraction chunks only).
    #[serde(default)]
    pub content: Option<String>,
    /// Cached raw extraction output (extraction chunks, once completed).
    #[serde(default)]
    pub result: Option<String>,
    /// Pointer to the extraction chunk holding the raw text (build chunks).
    #[serde(default)]
    pub source_chunk: Option<String>,
    #[serde(default)]
    pub entities: u64,
    #[serde(default)]
    pub relations: u64,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
}
