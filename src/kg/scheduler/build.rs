//! Stage 2: graph build.
//!
//! Each cycle first drains pending build chunks, one at a time. When none
//! are left it bridges completed extraction tasks into build tasks: one
//! build chunk per extraction chunk, pointing back at the cached raw text
//! instead of copying it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Scheduler, Tick};
use crate::kg::domain::{ChunkRecord, KgEvent, MergeSummary, Stage, TaskRecord, WorkStatus};
use crate::kg::error::{KgError, Result};
use crate::kg::events::EventBus;
use crate::kg::extraction::parser::parse_extraction;
use crate::kg::graph::GraphUpserter;
use crate::kg::graph::keys::provenance_id;
use crate::kg::persistence::schema::SchemaProvisioner;
use crate::kg::persistence::tasks::{ChunkCompletion, TaskRepository, now};

/// Extraction tasks bridged per idle cycle.
const BRIDGE_LIMIT: usize = 8;

#[derive(Debug)]
pub struct BuildScheduler {
    repo: TaskRepository,
    upserter: GraphUpserter,
    provisioner: Arc<SchemaProvisioner>,
    events: EventBus,
    poll_interval: Duration,
}

impl BuildScheduler {
    pub fn new(
        repo: TaskRepository,
        upserter: GraphUpserter,
        provisioner: Arc<SchemaProvisioner>,
        events: EventBus,
        poll_interval: Duration,
    ) -> Self {
        Self {
            repo,
            upserter,
            provisioner,
            events,
            poll_interval,
        }
    }

    /// Parse the cached extraction text behind `chunk` and merge it.
    async fn merge(&self, chunk: &ChunkRecord) -> Result<MergeSummary> {
        let task = self
            .repo
            .get_task(Stage::Build, &chunk.task_id)
            .await?
            .ok_or_else(|| KgError::NotFound(format!("build task {}", chunk.task_id)))?;

        let source_key = chunk
            .source_chunk
            .as_deref()
            .ok_or_else(|| KgError::InvalidInput("build chunk has no source chunk".to_string()))?;
        let raw = self
            .repo
            .get_chunk(Stage::Extraction, source_key)
            .await?
            .and_then(|c| c.result)
            .ok_or_else(|| KgError::NotFound(format!("extraction output for chunk {source_key}")))?;

        self.provisioner.ensure(&task.target).await?;

        let parsed = parse_extraction(&raw);
        if !parsed.completed {
            debug!(chunk_id = %chunk.key, "Extraction output has no completion marker");
        }
        let chunk_id = provenance_id(&task.source, &task.target, &chunk.source_row);
        self.upserter
            .upsert(&task.target, &parsed, &chunk_id, &chunk.file_key)
            .await
    }

    async fn process(&self, chunk: &ChunkRecord) -> Result<()> {
        debug!(chunk_id = %chunk.key, task_id = %chunk.task_id, "Building chunk");

        let outcome = match self.merge(chunk).await {
            Ok(summary) => {
                self.repo
                    .complete_chunk(
                        Stage::Build,
                        chunk,
                        ChunkCompletion {
                            result: None,
                            entities: summary.entities,
                            relations: summary.relations,
                        },
                    )
                    .await?
            }
            // Store unreachable: leave the chunk progressing for the startup sweep.
            Err(e) if e.is_connectivity() => return Err(e),
            Err(e) => {
                warn!(chunk_id = %chunk.key, task_id = %chunk.task_id, error = %e, "Graph build failed for chunk");
                self.repo
                    .fail_chunk(Stage::Build, chunk, &e.to_string())
                    .await?
            }
        };

        if let Some(outcome) = outcome {
            publish_build(&self.events, &outcome.task, outcome.finished);
        }
        Ok(())
    }

    /// Create build tasks for completed extraction tasks that lack one.
    ///
    /// Returns how many were created.
    pub async fn bridge(&self) -> Result<usize> {
        let mut created = 0;
        for task in self.repo.unbridged_tasks(BRIDGE_LIMIT).await? {
            let sources = self
                .repo
                .chunks_for_task(Stage::Extraction, &task.key)
                .await?;
            let ts = now();

            let chunks: Vec<ChunkRecord> = sources
                .into_iter()
                .filter(|c| c.status == WorkStatus::Completed)
                .map(|c| ChunkRecord {
                    source_chunk: Some(c.key.clone()),
                    key: c.key,
                    task_id: task.key.clone(),
                    chunk_index: c.chunk_index,
                    status: WorkStatus::Pending,
                    file_key: c.file_key,
                    source_row: c.source_row,
                    content: None,
                    result: None,
                    entities: 0,
                    relations: 0,
                    error: None,
                    created_at: ts.clone(),
                    updated_at: ts.clone(),
                    started_at: None,
                    finished_at: None,
                })
                .collect();

            let build = TaskRecord {
                status: WorkStatus::Pending,
                chunks_total: chunks.len() as u32,
                chunks_completed: 0,
                chunks_failed: 0,
                entities_total: 0,
                relations_total: 0,
                error: None,
                created_at: ts.clone(),
                updated_at: ts,
                finished_at: None,
                ..task
            };

            self.repo.insert_task(Stage::Build, &build, &chunks).await?;
            info!(task_id = %build.key, kb_id = %build.kb_id, chunks = build.chunks_total, "Created build task");
            publish_build(&self.events, &build, false);
            created += 1;
        }
        Ok(created)
    }
}

/// Progress event for a build task, plus its terminal event when finished.
pub(crate) fn publish_build(events: &EventBus, task: &TaskRecord, finished: bool) {
    events.emit(KgEvent::BuildProgress {
        task_id: task.key.clone(),
        kb_id: task.kb_id.clone(),
        chunks_total: task.chunks_total,
        chunks_completed: task.chunks_completed,
        chunks_failed: task.chunks_failed,
        entities_total: task.entities_total,
        relations_total: task.relations_total,
    });
    if !finished {
        return;
    }
    match task.status {
        WorkStatus::Completed => {
            info!(
                task_id = %task.key,
                entities = task.entities_total,
                relations = task.relations_total,
                "Build task completed"
            );
            events.emit(KgEvent::BuildCompleted {
                task_id: task.key.clone(),
                kb_id: task.kb_id.clone(),
                entities_total: task.entities_total,
                relations_total: task.relations_total,
            });
        }
        WorkStatus::Failed => {
            warn!(task_id = %task.key, failed = task.chunks_failed, "Build task failed");
            events.emit(KgEvent::BuildFailed {
                task_id: task.key.clone(),
                kb_id: task.kb_id.clone(),
                chunks_failed: task.chunks_failed,
                error: task.error.clone(),
            });
        }
        WorkStatus::Pending | WorkStatus::Progressing => {}
    }
}

#[async_trait]
impl Scheduler for BuildScheduler {
    fn name(&self) -> &'static str {
        "build"
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn startup(&self) -> Result<()> {
        for task in self.repo.recover_interrupted(Stage::Build).await? {
            publish_build(&self.events, &task, task.status.is_terminal());
        }
        Ok(())
    }

    async fn tick(&self) -> Result<Tick> {
        if let Some(chunk) = self
            .repo
            .claim_pending(Stage::Build, 1)
            .await?
            .into_iter()
            .next()
        {
            self.process(&chunk).await?;
            return Ok(Tick::Worked);
        }

        if self.bridge().await? > 0 {
            Ok(Tick::Worked)
        } else {
            Ok(Tick::Idle)
        }
    }
}
