//! Stage 1: language-model extraction.
//!
//! Claims pending chunks, runs the extraction conversation for each and
//! caches the raw answer on the chunk. Up to `concurrency` chunks are claimed
//! per cycle and processed together.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use super::{Scheduler, Tick};
use crate::kg::domain::{ChunkRecord, KgEvent, Stage, TaskRecord, WorkStatus};
use crate::kg::error::{KgError, Result};
use crate::kg::events::EventBus;
use crate::kg::extraction::Extractor;
use crate::kg::persistence::tasks::{ChunkCompletion, ChunkOutcome, TaskRepository};

#[derive(Debug)]
pub struct ExtractionScheduler {
    repo: TaskRepository,
    extractor: Extractor,
    events: EventBus,
    concurrency: Arc<AtomicUsize>,
    poll_interval: Duration,
}

impl ExtractionScheduler {
    pub fn new(
        repo: TaskRepository,
        extractor: Extractor,
        events: EventBus,
        concurrency: Arc<AtomicUsize>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            repo,
            extractor,
            events,
            concurrency,
            poll_interval,
        }
    }

    async fn process(&self, chunk: &ChunkRecord) -> Result<()> {
        debug!(chunk_id = %chunk.key, task_id = %chunk.task_id, index = chunk.chunk_index, "Extracting chunk");

        let extracted = match chunk.content.as_deref().filter(|c| !c.trim().is_empty()) {
            Some(text) => self.extractor.extract(text).await,
            None => Err(KgError::InvalidInput("chunk has no content".to_string())),
        };

        let outcome = match extracted {
            Ok(raw) => {
                self.repo
                    .complete_chunk(
                        Stage::Extraction,
                        chunk,
                        ChunkCompletion {
                            result: Some(raw),
                            ..ChunkCompletion::default()
                        },
                    )
                    .await?
            }
            Err(e) => {
                warn!(chunk_id = %chunk.key, task_id = %chunk.task_id, error = %e, "Chunk extraction failed");
                self.repo
                    .fail_chunk(Stage::Extraction, chunk, &e.to_string())
                    .await?
            }
        };

        match outcome {
            Some(outcome) => self.publish(&outcome),
            None => debug!(chunk_id = %chunk.key, "Chunk left progressing before completion, result dropped"),
        }
        Ok(())
    }

    fn publish(&self, outcome: &ChunkOutcome) {
        publish_task(&self.events, &outcome.task, outcome.finished);
    }
}

/// Progress event for a stage-1 task, plus its terminal event when finished.
pub(crate) fn publish_task(events: &EventBus, task: &TaskRecord, finished: bool) {
    events.emit(KgEvent::TaskProgress {
        task_id: task.key.clone(),
        kb_id: task.kb_id.clone(),
        chunks_total: task.chunks_total,
        chunks_completed: task.chunks_completed,
        chunks_failed: task.chunks_failed,
    });
    if !finished {
        return;
    }
    match task.status {
        WorkStatus::Completed => {
            info!(task_id = %task.key, chunks = task.chunks_total, "Extraction task completed");
            events.emit(KgEvent::TaskCompleted {
                task_id: task.key.clone(),
                kb_id: task.kb_id.clone(),
            });
        }
        WorkStatus::Failed => {
            warn!(task_id = %task.key, failed = task.chunks_failed, "Extraction task failed");
            events.emit(KgEvent::TaskFailed {
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
impl Scheduler for ExtractionScheduler {
    fn name(&self) -> &'static str {
        "extraction"
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn startup(&self) -> Result<()> {
        for task in self.repo.recover_interrupted(Stage::Extraction).await? {
            publish_task(&self.events, &task, task.status.is_terminal());
        }
        Ok(())
    }

    async fn tick(&self) -> Result<Tick> {
        let limit = self.concurrency.load(Ordering::Relaxed).max(1);
        let chunks = self.repo.claim_pending(Stage::Extraction, limit).await?;
        if chunks.is_empty() {
            return Ok(Tick::Idle);
        }

        let results = join_all(chunks.iter().map(|c| self.process(c))).await;

        // Bookkeeping failures leave the chunk progressing for the next
        // startup sweep; report the first one to the loop.
        let mut first_err = None;
        for (chunk, result) in chunks.iter().zip(results) {
            if let Err(e) = result {
                error!(chunk_id = %chunk.key, error = %e, "Failed to record chunk outcome");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(Tick::Worked),
        }
    }
}
