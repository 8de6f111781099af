//! Task submission.
//!
//! Reads a file's rows from a knowledge base's source chunk table and
//! materializes one extraction task plus one chunk per row not yet covered
//! by an earlier submission.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::kg::domain::{ChunkRecord, GraphTarget, SourceTable, Stage, TaskRecord, WorkStatus};
use crate::kg::error::{KgError, Result};
use crate::kg::graph::keys::chunk_key;
use crate::kg::persistence::KgStore;
use crate::kg::persistence::schema::GraphTables;
use crate::kg::persistence::tasks::{TaskRepository, now};

/// Parameters of a construction job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitParams {
    pub kb_id: String,
    /// Source file whose chunks are extracted.
    pub file_key: String,
    pub source: SourceTable,
    pub target: GraphTarget,
}

impl SubmitParams {
    pub fn validate(&self) -> Result<()> {
        if self.kb_id.trim().is_empty() {
            return Err(KgError::InvalidInput("kb_id must not be empty".to_string()));
        }
        if self.file_key.trim().is_empty() {
            return Err(KgError::InvalidInput("file_key must not be empty".to_string()));
        }
        let valid_ident = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_ident(&self.source.table) {
            return Err(KgError::InvalidInput(format!(
                "source table must match [A-Za-z0-9_]+, got {:?}",
                self.source.table
            )));
        }
        GraphTables::new(&self.target.table_base)?;
        Ok(())
    }
}

/// A row of the source chunk table.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRow {
    pub row_key: String,
    #[serde(default)]
    pub chunk_index: Option<i64>,
    #[serde(default)]
    pub content: Option<String>,
}

/// Rows of `file_key` in source order.
pub async fn read_source_rows(
    store: &KgStore,
    source: &SourceTable,
    file_key: &str,
) -> Result<Vec<SourceRow>> {
    let sql = "SELECT <string> record::id(id) AS row_key, chunk_index, content
               FROM type::table($tb) WHERE file_key = $file ORDER BY chunk_index";
    let (tb, file) = (source.table.clone(), file_key.to_string());
    store
        .within(&source.db_target(), |db| async move {
            Ok(db
                .query(sql)
                .bind(("tb", tb))
                .bind(("file", file))
                .await?
                .take(0)?)
        })
        .await
}

/// A task and the chunks it would own, before anything is written.
#[derive(Debug, Clone)]
struct PlannedTask {
    task: TaskRecord,
    chunks: Vec<ChunkRecord>,
    skipped: usize,
}

#[derive(Debug, Clone)]
pub struct TaskSubmitter {
    repo: TaskRepository,
}

impl TaskSubmitter {
    pub fn new(repo: TaskRepository) -> Self {
        Self { repo }
    }

    /// Create a task for the file's uncovered rows.
    ///
    /// Returns `None` when every row is already covered by an existing task.
    pub async fn submit(&self, params: &SubmitParams) -> Result<Option<TaskRecord>> {
        match self.plan(params).await? {
            Some(planned) => self.commit(planned).await,
            None => {
                info!(kb_id = %params.kb_id, file_key = %params.file_key, "No uncovered chunks to submit");
                Ok(None)
            }
        }
    }

    async fn plan(&self, params: &SubmitParams) -> Result<Option<PlannedTask>> {
        params.validate()?;

        let rows = read_source_rows(self.repo.store(), &params.source, &params.file_key).await?;
        let rows: Vec<(usize, SourceRow)> = rows
            .into_iter()
            .enumerate()
            .filter(|(_, r)| r.content.as_deref().is_some_and(|c| !c.trim().is_empty()))
            .collect();

        let keys: Vec<String> = rows
            .iter()
            .map(|(_, r)| chunk_key(&params.source, &r.row_key))
            .collect();
        let covered = self
            .repo
            .existing_chunk_keys(Stage::Extraction, keys.clone())
            .await?;

        let task_key = uuid::Uuid::new_v4().to_string();
        let ts = now();
        let chunks: Vec<ChunkRecord> = rows
            .into_iter()
            .zip(keys)
            .filter(|(_, key)| !covered.contains(key))
            .map(|((position, row), key)| ChunkRecord {
                key,
                task_id: task_key.clone(),
                chunk_index: row
                    .chunk_index
                    .and_then(|i| u32::try_from(i).ok())
                    .unwrap_or(position as u32),
                status: WorkStatus::Pending,
                file_key: params.file_key.clone(),
                source_row: row.row_key,
                content: row.content,
                result: None,
                source_chunk: None,
                entities: 0,
                relations: 0,
                error: None,
                created_at: ts.clone(),
                updated_at: ts.clone(),
                started_at: None,
                finished_at: None,
            })
            .collect();

        if chunks.is_empty() {
            return Ok(None);
        }

        let task = TaskRecord {
            key: task_key,
            kb_id: params.kb_id.clone(),
            file_key: params.file_key.clone(),
            status: WorkStatus::Pending,
            chunks_total: chunks.len() as u32,
            chunks_completed: 0,
            chunks_failed: 0,
            source: params.source.clone(),
            target: params.target.clone(),
            entities_total: 0,
            relations_total: 0,
            error: None,
            created_at: ts.clone(),
            updated_at: ts,
            finished_at: None,
        };
        Ok(Some(PlannedTask {
            task,
            chunks,
            skipped: covered.len(),
        }))
    }

    /// Write a planned task.
    ///
    /// A concurrent submitter may have claimed some of the planned chunk keys
    /// since the coverage check; those inserts are ignored. The task's
    /// counters are then re-derived from the chunks it actually owns, and a
    /// task left with none is deleted.
    async fn commit(&self, planned: PlannedTask) -> Result<Option<TaskRecord>> {
        let PlannedTask {
            task,
            chunks,
            skipped,
        } = planned;
        self.repo
            .insert_task(Stage::Extraction, &task, &chunks)
            .await?;

        let task = match self.repo.rederive_task(Stage::Extraction, &task.key).await? {
            Some(owned) if owned.chunks_total > 0 => owned,
            _ => {
                self.repo.remove_task(&task.key).await?;
                info!(
                    kb_id = %task.kb_id,
                    file_key = %task.file_key,
                    "Chunks were covered by a concurrent submission"
                );
                return Ok(None);
            }
        };

        info!(
            task_id = %task.key,
            kb_id = %task.kb_id,
            file_key = %task.file_key,
            chunks = task.chunks_total,
            skipped = skipped + chunks.len() - task.chunks_total as usize,
            "Submitted extraction task"
        );
        Ok(Some(task))
    }
}
