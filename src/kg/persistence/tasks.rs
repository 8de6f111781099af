//! Task/chunk bookkeeping repository.
//!
//! Both scheduler stages share these operations; a [`Stage`] selects the
//! table pair. Every mutation of a chunk is guarded on its current status so
//! that a claim, a completion and an administrative cancel can never
//! overwrite each other.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::KgStore;
use crate::kg::domain::{ChunkRecord, Stage, TaskRecord, WorkStatus, derive_status};
use crate::kg::error::Result;

/// Error recorded on chunks reclaimed by the startup sweep.
pub const INTERRUPTED: &str = "interrupted";
/// Error recorded on chunks failed by an administrative cancel.
pub const CANCELLED: &str = "cancelled";

/// Current time in the fixed-width RFC3339 form stored on every row.
pub fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Result of moving a claimed chunk to a terminal state.
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    /// Parent task after its counters were updated.
    pub task: TaskRecord,
    /// Whether this call moved the task to a terminal state.
    pub finished: bool,
}

/// What a housekeeping sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HousekeepingReport {
    pub interrupted: usize,
    pub removed: usize,
}

/// Values written onto a chunk when it completes.
#[derive(Debug, Clone, Default)]
pub struct ChunkCompletion {
    /// Raw extraction text (stage 1).
    pub result: Option<String>,
    /// Entities merged (stage 2).
    pub entities: u64,
    /// Relations merged (stage 2).
    pub relations: u64,
}

#[derive(Debug, Deserialize)]
struct StatusCount {
    status: WorkStatus,
    n: u32,
}

/// Repository over the home bookkeeping tables.
#[derive(Debug, Clone)]
pub struct TaskRepository {
    store: KgStore,
}

impl TaskRepository {
    pub fn new(store: KgStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &KgStore {
        &self.store
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Insert a task and its chunks. Rows whose key already exists are kept.
    pub async fn insert_task(
        &self,
        stage: Stage,
        task: &TaskRecord,
        chunks: &[ChunkRecord],
    ) -> Result<()> {
        let task_row = with_id(task, &task.key)?;
        let chunk_rows = chunks
            .iter()
            .map(|c| with_id(c, &c.key))
            .collect::<Result<Vec<_>>>()?;
        let sql = format!(
            "INSERT IGNORE INTO {tt} $task; INSERT IGNORE INTO {ct} $chunks;",
            tt = stage.task_table(),
            ct = stage.chunk_table(),
        );

        self.store
            .home(|db| async move {
                db.query(sql)
                    .bind(("task", task_row))
                    .bind(("chunks", chunk_rows))
                    .await?
                    .check()?;
                Ok(())
            })
            .await
    }

    /// Keys from `keys` that already exist as chunk rows.
    pub async fn existing_chunk_keys(
        &self,
        stage: Stage,
        keys: Vec<String>,
    ) -> Result<BTreeSet<String>> {
        let sql = format!(
            "SELECT VALUE key FROM {ct} WHERE key INSIDE $keys",
            ct = stage.chunk_table()
        );
        let found: Vec<String> = self
            .store
            .home(|db| async move { Ok(db.query(sql).bind(("keys", keys)).await?.take(0)?) })
            .await?;
        Ok(found.into_iter().collect())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn list_tasks(&self, stage: Stage) -> Result<Vec<TaskRecord>> {
        let sql = format!(
            "SELECT * FROM {tt} ORDER BY created_at DESC",
            tt = stage.task_table()
        );
        self.store
            .home(|db| async move { Ok(db.query(sql).await?.take(0)?) })
            .await
    }

    pub async fn get_task(&self, stage: Stage, key: &str) -> Result<Option<TaskRecord>> {
        let sql = "SELECT * FROM type::thing($tb, $key)";
        let (tb, key) = (stage.task_table(), key.to_string());
        let rows: Vec<TaskRecord> = self
            .store
            .home(|db| async move {
                Ok(db
                    .query(sql)
                    .bind(("tb", tb))
                    .bind(("key", key))
                    .await?
                    .take(0)?)
            })
            .await?;
        Ok(rows.into_iter().next())
    }

    pub async fn chunks_for_task(&self, stage: Stage, task_key: &str) -> Result<Vec<ChunkRecord>> {
        let sql = format!(
            "SELECT * FROM {ct} WHERE task_id = $task ORDER BY chunk_index",
            ct = stage.chunk_table()
        );
        let task = task_key.to_string();
        self.store
            .home(|db| async move { Ok(db.query(sql).bind(("task", task)).await?.take(0)?) })
            .await
    }

    pub async fn get_chunk(&self, stage: Stage, key: &str) -> Result<Option<ChunkRecord>> {
        let sql = "SELECT * FROM type::thing($tb, $key)";
        let (tb, key) = (stage.chunk_table(), key.to_string());
        let rows: Vec<ChunkRecord> = self
            .store
            .home(|db| async move {
                Ok(db
                    .query(sql)
                    .bind(("tb", tb))
                    .bind(("key", key))
                    .await?
                    .take(0)?)
            })
            .await?;
        Ok(rows.into_iter().next())
    }

    /// Completed extraction tasks that have no build task yet.
    pub async fn unbridged_tasks(&self, limit: usize) -> Result<Vec<TaskRecord>> {
        let sql = "SELECT * FROM kg_task
                   WHERE status = 'completed'
                     AND key NOTINSIDE (SELECT VALUE key FROM kg_build_task)
                   ORDER BY finished_at LIMIT $limit";
        self.store
            .home(|db| async move {
                Ok(db
                    .query(sql)
                    .bind(("limit", limit as i64))
                    .await?
                    .take(0)?)
            })
            .await
    }

    // =========================================================================
    // Claim
    // =========================================================================

    /// Claim up to `limit` pending chunks, oldest first.
    ///
    /// Each claim is a conditional `pending -> progressing` update, so a chunk
    /// taken by another claimant in between is skipped rather than processed
    /// twice.
    pub async fn claim_pending(&self, stage: Stage, limit: usize) -> Result<Vec<ChunkRecord>> {
        let select = format!(
            "SELECT key, created_at, chunk_index FROM {ct} WHERE status = 'pending'
             ORDER BY created_at, chunk_index LIMIT $limit",
            ct = stage.chunk_table()
        );
        let claim = format!(
            "UPDATE type::thing('{ct}', $key)
             SET status = 'progressing', started_at = $now, updated_at = $now
             WHERE status = 'pending' RETURN AFTER",
            ct = stage.chunk_table()
        );

        #[derive(Deserialize)]
        struct Candidate {
            key: String,
        }

        self.store
            .home(|db| async move {
                let candidates: Vec<Candidate> = db
                    .query(select)
                    .bind(("limit", limit as i64))
                    .await?
                    .take(0)?;

                let mut claimed = Vec::with_capacity(candidates.len());
                for candidate in candidates {
                    let rows: Vec<ChunkRecord> = db
                        .query(claim.as_str())
                        .bind(("key", candidate.key))
                        .bind(("now", now()))
                        .await?
                        .take(0)?;
                    claimed.extend(rows);
                }

                // The parent task leaves `pending` with its first claimed chunk.
                let tasks: BTreeSet<String> = claimed.iter().map(|c| c.task_id.clone()).collect();
                for task in tasks {
                    db.query(
                        "UPDATE type::thing($tb, $task)
                         SET status = 'progressing', updated_at = $now
                         WHERE status = 'pending'",
                    )
                    .bind(("tb", stage.task_table()))
                    .bind(("task", task))
                    .bind(("now", now()))
                    .await?
                    .check()?;
                }
                Ok(claimed)
            })
            .await
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Mark a claimed chunk completed and count it on its task.
    ///
    /// Returns `None` when the chunk was no longer `progressing` (for example
    /// cancelled while in flight); nothing is written in that case.
    pub async fn complete_chunk(
        &self,
        stage: Stage,
        chunk: &ChunkRecord,
        completion: ChunkCompletion,
    ) -> Result<Option<ChunkOutcome>> {
        let mark = format!(
            "UPDATE type::thing('{ct}', $key)
             SET status = 'completed', result = $result, entities = $entities,
                 relations = $relations, error = NONE, finished_at = $now, updated_at = $now
             WHERE status = 'progressing' RETURN AFTER",
            ct = stage.chunk_table()
        );
        let count = format!(
            "UPDATE type::thing('{tt}', $task)
             SET chunks_completed += 1, entities_total += $entities,
                 relations_total += $relations, updated_at = $now
             RETURN AFTER",
            tt = stage.task_table()
        );
        let (key, task) = (chunk.key.clone(), chunk.task_id.clone());

        self.store
            .home(|db| async move {
                let marked: Vec<ChunkRecord> = db
                    .query(mark)
                    .bind(("key", key))
                    .bind(("result", completion.result))
                    .bind(("entities", completion.entities as i64))
                    .bind(("relations", completion.relations as i64))
                    .bind(("now", now()))
                    .await?
                    .take(0)?;
                if marked.is_empty() {
                    return Ok(None);
                }

                let counted: Vec<TaskRecord> = db
                    .query(count)
                    .bind(("task", task.clone()))
                    .bind(("entities", completion.entities as i64))
                    .bind(("relations", completion.relations as i64))
                    .bind(("now", now()))
                    .await?
                    .take(0)?;
                finalize(&db, stage, task, counted).await
            })
            .await
    }

    /// Mark a claimed chunk failed with `error` and count it on its task.
    pub async fn fail_chunk(
        &self,
        stage: Stage,
        chunk: &ChunkRecord,
        error: &str,
    ) -> Result<Option<ChunkOutcome>> {
        let mark = format!(
            "UPDATE type::thing('{ct}', $key)
             SET status = 'failed', error = $error, finished_at = $now, updated_at = $now
             WHERE status = 'progressing' RETURN AFTER",
            ct = stage.chunk_table()
        );
        let count = format!(
            "UPDATE type::thing('{tt}', $task)
             SET chunks_failed += 1, error = $error, updated_at = $now
             RETURN AFTER",
            tt = stage.task_table()
        );
        let (key, task, error) = (chunk.key.clone(), chunk.task_id.clone(), error.to_string());

        self.store
            .home(|db| async move {
                let marked: Vec<ChunkRecord> = db
                    .query(mark)
                    .bind(("key", key))
                    .bind(("error", error.clone()))
                    .bind(("now", now()))
                    .await?
                    .take(0)?;
                if marked.is_empty() {
                    return Ok(None);
                }

                let counted: Vec<TaskRecord> = db
                    .query(count)
                    .bind(("task", task.clone()))
                    .bind(("error", error))
                    .bind(("now", now()))
                    .await?
                    .take(0)?;
                finalize(&db, stage, task, counted).await
            })
            .await
    }

    // =========================================================================
    // Recovery and administration
    // =========================================================================

    /// Fail every chunk left `progressing` by a previous process and
    /// re-derive the counters of the affected tasks from their chunks.
    pub async fn recover_interrupted(&self, stage: Stage) -> Result<Vec<TaskRecord>> {
        let sql = format!(
            "UPDATE {ct} SET status = 'failed', error = $error, finished_at = $now, updated_at = $now
             WHERE status = 'progressing' RETURN AFTER",
            ct = stage.chunk_table()
        );
        let swept: Vec<ChunkRecord> = self
            .store
            .home(|db| async move {
                Ok(db
                    .query(sql)
                    .bind(("error", INTERRUPTED))
                    .bind(("now", now()))
                    .await?
                    .take(0)?)
            })
            .await?;

        if swept.is_empty() {
            return Ok(Vec::new());
        }
        warn!(
            stage = stage.label(),
            chunks = swept.len(),
            "Reclaimed chunks interrupted by a previous run"
        );

        let tasks: BTreeSet<String> = swept.into_iter().map(|c| c.task_id).collect();
        let mut rederived = Vec::with_capacity(tasks.len());
        for task in tasks {
            if let Some(record) = self.rederive(stage, &task, Some(INTERRUPTED)).await? {
                rederived.push(record);
            }
        }
        Ok(rederived)
    }

    /// Recompute a task's counters and status from its chunk rows.
    pub async fn rederive_task(&self, stage: Stage, task_key: &str) -> Result<Option<TaskRecord>> {
        self.rederive(stage, task_key, None).await
    }

    /// [`Self::rederive_task`], recording `error` on the task when any chunk
    /// is failed.
    async fn rederive(
        &self,
        stage: Stage,
        task_key: &str,
        error: Option<&'static str>,
    ) -> Result<Option<TaskRecord>> {
        let counts_sql = format!(
            "SELECT status, count() AS n FROM {ct} WHERE task_id = $task GROUP BY status",
            ct = stage.chunk_table()
        );
        let update_sql = format!(
            "UPDATE type::thing('{tt}', $task)
             SET chunks_total = $total, chunks_completed = $completed, chunks_failed = $failed,
                 status = $status, updated_at = $now,
                 error = IF $failed = 0 THEN NONE ELSE ($error ?? error) END,
                 finished_at = IF $terminal THEN (finished_at ?? $now) ELSE NONE END
             RETURN AFTER",
            tt = stage.task_table()
        );
        let task = task_key.to_string();

        self.store
            .home(|db| async move {
                let counts: Vec<StatusCount> = db
                    .query(counts_sql)
                    .bind(("task", task.clone()))
                    .await?
                    .take(0)?;

                let tally = |s: WorkStatus| {
                    counts
                        .iter()
                        .filter(|c| c.status == s)
                        .map(|c| c.n)
                        .sum::<u32>()
                };
                let completed = tally(WorkStatus::Completed);
                let failed = tally(WorkStatus::Failed);
                let progressing = tally(WorkStatus::Progressing);
                let total = completed + failed + progressing + tally(WorkStatus::Pending);
                let status = derive_status(total, completed, failed, progressing);

                let rows: Vec<TaskRecord> = db
                    .query(update_sql)
                    .bind(("task", task))
                    .bind(("total", i64::from(total)))
                    .bind(("completed", i64::from(completed)))
                    .bind(("failed", i64::from(failed)))
                    .bind(("status", status))
                    .bind(("terminal", status.is_terminal()))
                    .bind(("error", error))
                    .bind(("now", now()))
                    .await?
                    .take(0)?;
                Ok(rows.into_iter().next())
            })
            .await
    }

    /// Force non-terminal chunks of both stages to `failed`.
    ///
    /// Returns the re-derived task of each stage that has one.
    pub async fn cancel_task(&self, task_key: &str) -> Result<Vec<(Stage, TaskRecord)>> {
        self.reset_chunks(
            task_key,
            "SET status = 'failed', error = $error, finished_at = $now, updated_at = $now
             WHERE task_id = $task AND status INSIDE ['pending', 'progressing']",
            Some(CANCELLED),
        )
        .await
    }

    /// Reset failed chunks of both stages to `pending`.
    ///
    /// This administrative reset is the only backward status transition.
    pub async fn retry_task(&self, task_key: &str) -> Result<Vec<(Stage, TaskRecord)>> {
        self.reset_chunks(
            task_key,
            "SET status = 'pending', error = NONE, started_at = NONE, finished_at = NONE,
                 updated_at = $now
             WHERE task_id = $task AND status = 'failed'",
            None,
        )
        .await
    }

    async fn reset_chunks(
        &self,
        task_key: &str,
        clause: &str,
        error: Option<&'static str>,
    ) -> Result<Vec<(Stage, TaskRecord)>> {
        let mut touched = Vec::new();
        for stage in [Stage::Extraction, Stage::Build] {
            if self.get_task(stage, task_key).await?.is_none() {
                continue;
            }
            let sql = format!("UPDATE {ct} {clause}", ct = stage.chunk_table());
            let task = task_key.to_string();
            self.store
                .home(|db| async move {
                    db.query(sql)
                        .bind(("task", task))
                        .bind(("error", error))
                        .bind(("now", now()))
                        .await?
                        .check()?;
                    Ok(())
                })
                .await?;
            if let Some(record) = self.rederive(stage, task_key, error).await? {
                touched.push((stage, record));
            }
        }
        Ok(touched)
    }

    /// Delete the task and chunk rows of both stages. Graph content stays.
    ///
    /// Returns whether any task row existed.
    pub async fn remove_task(&self, task_key: &str) -> Result<bool> {
        let sql = "
            DELETE kg_chunk WHERE task_id = $task;
            DELETE kg_build_chunk WHERE task_id = $task;
            DELETE type::thing('kg_task', $task) RETURN BEFORE;
            DELETE type::thing('kg_build_task', $task) RETURN BEFORE;";
        let task = task_key.to_string();
        let removed = self
            .store
            .home(|db| async move {
                let mut resp = db.query(sql).bind(("task", task)).await?;
                let extraction: Vec<TaskRecord> = resp.take(2)?;
                let build: Vec<TaskRecord> = resp.take(3)?;
                Ok(!extraction.is_empty() || !build.is_empty())
            })
            .await?;
        if removed {
            debug!(task_id = %task_key, "Removed task rows");
        }
        Ok(removed)
    }

    /// Drop task pairs whose build finished successfully.
    ///
    /// Leaves in-flight chunks alone, so it is safe while the schedulers run.
    pub async fn housekeeping(&self) -> Result<HousekeepingReport> {
        let report = HousekeepingReport {
            interrupted: 0,
            removed: self.remove_finished().await?,
        };
        info!(removed_tasks = report.removed, "Housekeeping finished");
        Ok(report)
    }

    /// Fail chunks of both stages stuck in `progressing`, then drop finished
    /// task pairs.
    ///
    /// Any `progressing` chunk is taken for an orphan of a previous process,
    /// so this must run before the schedulers start.
    pub async fn startup_housekeeping(&self) -> Result<HousekeepingReport> {
        let mut report = HousekeepingReport::default();
        for stage in [Stage::Extraction, Stage::Build] {
            report.interrupted += self.recover_interrupted(stage).await?.len();
        }
        report.removed = self.remove_finished().await?;

        info!(
            interrupted_tasks = report.interrupted,
            removed_tasks = report.removed,
            "Startup housekeeping finished"
        );
        Ok(report)
    }

    async fn remove_finished(&self) -> Result<usize> {
        let finished: Vec<String> = self
            .store
            .home(|db| async move {
                Ok(db
                    .query("SELECT VALUE key FROM kg_build_task WHERE status = 'completed'")
                    .await?
                    .take(0)?)
            })
            .await?;

        let mut removed = 0;
        for key in finished {
            if self.remove_task(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Move a task to its terminal state once every chunk is terminal.
///
/// The update is guarded on the task still being non-terminal, so among
/// concurrent finishers exactly one sees `finished = true`.
async fn finalize(
    db: &surrealdb::Surreal<surrealdb::engine::any::Any>,
    stage: Stage,
    task: String,
    counted: Vec<TaskRecord>,
) -> Result<Option<ChunkOutcome>> {
    let Some(counted) = counted.into_iter().next() else {
        warn!(task_id = %task, stage = stage.label(), "Chunk finished for a missing task");
        return Ok(None);
    };

    let sql = format!(
        "UPDATE type::thing('{tt}', $task)
         SET status = IF chunks_failed > 0 THEN 'failed' ELSE 'completed' END,
             finished_at = $now, updated_at = $now
         WHERE status INSIDE ['pending', 'progressing']
           AND chunks_completed + chunks_failed >= chunks_total
         RETURN AFTER",
        tt = stage.task_table()
    );
    let finished: Vec<TaskRecord> = db
        .query(sql)
        .bind(("task", task))
        .bind(("now", now()))
        .await?
        .take(0)?;

    Ok(Some(match finished.into_iter().next() {
        Some(task) => ChunkOutcome {
            task,
            finished: true,
        },
        None => ChunkOutcome {
            task: counted,
            finished: false,
        },
    }))
}

/// Serialize a row and attach its record id.
fn with_id<T: Serialize>(row: &T, key: &str) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(row)?;
    if let Some(map) = value.as_object_mut() {
        map.insert("id".to_string(), serde_json::Value::String(key.to_string()));
    }
    Ok(value)
}
