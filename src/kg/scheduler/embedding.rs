//! Stage 3: entity embeddings and the vector index.
//!
//! `Idle -> Active -> Indexing -> Idle`. While any graph target has entities
//! whose embedding hash does not match their description, one batch is
//! embedded per cycle. Once nothing is stale, the vector index of every
//! target written since the last rebuild is refreshed.
//!
//! Nothing is staged between steps: a batch interrupted midway is simply
//! selected again on the next cycle. A batch the provider rejects is retried
//! one entity at a time; entities rejected on their own are skipped for
//! [`REJECT_COOLDOWN`], or until their description changes, so they cannot
//! hold back the rest of the table.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Scheduler, Tick};
use crate::kg::domain::{GraphTarget, KgEvent, StaleEntity};
use crate::kg::embedding::Embedder;
use crate::kg::error::{KgError, Result};
use crate::kg::events::EventBus;
use crate::kg::persistence::KgStore;
use crate::kg::persistence::schema::{GraphTables, refresh_vector_index};

/// How long an entity the provider rejected is left out of selection.
pub const REJECT_COOLDOWN: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EmbeddingPhase {
    #[default]
    Idle,
    Active,
    Indexing,
}

pub struct EmbeddingScheduler {
    store: KgStore,
    embedder: Arc<dyn Embedder>,
    events: EventBus,
    batch_size: usize,
    poll_interval: Duration,
    phase: Mutex<EmbeddingPhase>,
    /// Every graph target seen in the build bookkeeping.
    known: Mutex<HashSet<GraphTarget>>,
    /// Targets embedded into since their index was last refreshed.
    dirty: Mutex<HashSet<GraphTarget>>,
    /// `name|content hash` of rejected entities per target, with the time of
    /// rejection.
    rejected: Mutex<HashMap<GraphTarget, HashMap<String, Instant>>>,
}

impl std::fmt::Debug for EmbeddingScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingScheduler")
            .field("dimensions", &self.embedder.dimensions())
            .field("batch_size", &self.batch_size)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl EmbeddingScheduler {
    pub fn new(
        store: KgStore,
        embedder: Arc<dyn Embedder>,
        events: EventBus,
        batch_size: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            embedder,
            events,
            batch_size: batch_size.max(1),
            poll_interval,
            phase: Mutex::new(EmbeddingPhase::Idle),
            known: Mutex::new(HashSet::new()),
            dirty: Mutex::new(HashSet::new()),
            rejected: Mutex::new(HashMap::new()),
        }
    }

    pub async fn phase(&self) -> EmbeddingPhase {
        *self.phase.lock().await
    }

    async fn set_phase(&self, next: EmbeddingPhase) {
        let mut phase = self.phase.lock().await;
        if *phase != next {
            debug!(from = ?*phase, to = ?next, "Embedding phase changed");
            *phase = next;
        }
    }

    /// Known targets, merged with those currently named by build tasks.
    async fn refresh_targets(&self) -> Result<Vec<GraphTarget>> {
        let listed: Vec<GraphTarget> = self
            .store
            .home(|db| async move {
                Ok(db
                    .query("SELECT VALUE target FROM kg_build_task")
                    .await?
                    .take(0)?)
            })
            .await?;

        let mut known = self.known.lock().await;
        known.extend(listed);
        Ok(known.iter().cloned().collect())
    }

    /// Rejections of `target` still cooling down.
    async fn skipped(&self, target: &GraphTarget) -> Vec<String> {
        let mut rejected = self.rejected.lock().await;
        let Some(entries) = rejected.get_mut(target) else {
            return Vec::new();
        };
        entries.retain(|_, at| at.elapsed() < REJECT_COOLDOWN);
        entries.keys().cloned().collect()
    }

    async fn reject(&self, target: &GraphTarget, entity: &StaleEntity) {
        self.rejected
            .lock()
            .await
            .entry(target.clone())
            .or_default()
            .insert(rejection_key(entity), Instant::now());
    }

    /// Up to one batch of entities whose embedding is missing or stale.
    async fn stale_entities(&self, target: &GraphTarget) -> Result<Vec<StaleEntity>> {
        let tables = GraphTables::new(&target.table_base)?;
        let sql = "SELECT entity_name, description FROM type::table($tb)
                   WHERE (embedding_hash = NONE
                          OR embedding_hash != crypto::sha256(description ?? ''))
                     AND string::concat(entity_name, '|', crypto::sha256(description ?? ''))
                         NOTINSIDE $skip
                   LIMIT $limit";
        let limit = self.batch_size as i64;
        let skip = self.skipped(target).await;
        self.store
            .within(&target.db_target(), |db| async move {
                Ok(db
                    .query(sql)
                    .bind(("tb", tables.entity))
                    .bind(("skip", skip))
                    .bind(("limit", limit))
                    .await?
                    .take(0)?)
            })
            .await
    }

    /// Write vectors back, each guarded on the description still hashing
    /// to what was embedded. Returns how many rows took their vector.
    async fn write_back(
        &self,
        target: &GraphTarget,
        entities: &[StaleEntity],
        vectors: Vec<Vec<f32>>,
    ) -> Result<usize> {
        let tables = GraphTables::new(&target.table_base)?;
        let mut sql = String::new();
        let mut params: BTreeMap<String, Value> = BTreeMap::new();
        params.insert("tb".to_string(), Value::String(tables.entity));

        for (i, (entity, vector)) in entities.iter().zip(vectors).enumerate() {
            sql.push_str(&format!(
                "UPDATE type::thing($tb, $k{i}) SET embedding = $v{i}, embedding_hash = $h{i}
                 WHERE crypto::sha256(description ?? '') = $h{i} RETURN VALUE entity_name;\n"
            ));
            params.insert(format!("k{i}"), Value::String(entity.entity_name.clone()));
            params.insert(format!("h{i}"), Value::String(entity.content_hash()));
            params.insert(format!("v{i}"), serde_json::to_value(vector)?);
        }

        let count = entities.len();
        self.store
            .within(&target.db_target(), |db| async move {
                let mut resp = db.query(sql).bind(params).await?;
                let mut written = 0;
                for i in 0..count {
                    let names: Vec<String> = resp.take(i)?;
                    written += names.len();
                }
                Ok(written)
            })
            .await
    }

    /// Embed one stale batch of `target`. Returns the entities embedded.
    ///
    /// Fails only when the store fails or the provider accepted none of the
    /// batch.
    async fn embed_batch(&self, target: &GraphTarget, batch: Vec<StaleEntity>) -> Result<usize> {
        let dimensions = self.embedder.dimensions();
        let texts = batch.iter().map(StaleEntity::embedding_text).collect();

        // Provider calls run outside any store scope.
        let (batch, vectors) = match self.embedder.embed(texts, dimensions).await {
            Ok(vectors) => (batch, vectors),
            Err(e) => {
                warn!(
                    table_base = %target.table_base,
                    entities = batch.len(),
                    error = %e,
                    "Embedding batch rejected, retrying entities one by one"
                );
                self.embed_each(target, batch, dimensions, e).await?
            }
        };
        let written = self.write_back(target, &batch, vectors).await?;

        if written < batch.len() {
            debug!(
                table_base = %target.table_base,
                skipped = batch.len() - written,
                "Descriptions changed while embedding; left for the next cycle"
            );
        }
        Ok(written)
    }

    /// Embed entities separately, setting aside those the provider rejects.
    async fn embed_each(
        &self,
        target: &GraphTarget,
        batch: Vec<StaleEntity>,
        dimensions: usize,
        batch_error: KgError,
    ) -> Result<(Vec<StaleEntity>, Vec<Vec<f32>>)> {
        let mut accepted = Vec::with_capacity(batch.len());
        let mut vectors = Vec::with_capacity(batch.len());
        let mut last_error = batch_error;

        for entity in batch {
            let single = self
                .embedder
                .embed(vec![entity.embedding_text()], dimensions)
                .await
                .and_then(|mut v| {
                    v.pop().ok_or_else(|| {
                        KgError::Provider("embedding provider returned no vector".to_string())
                    })
                });
            match single {
                Ok(vector) => {
                    accepted.push(entity);
                    vectors.push(vector);
                }
                Err(e) => {
                    warn!(
                        table_base = %target.table_base,
                        entity = %entity.entity_name,
                        error = %e,
                        "Entity rejected by the embedding provider"
                    );
                    self.reject(target, &entity).await;
                    last_error = e;
                }
            }
        }

        if accepted.is_empty() {
            return Err(last_error);
        }
        Ok((accepted, vectors))
    }

    async fn rebuild_indexes(&self) -> Result<()> {
        let dimensions = self.embedder.dimensions();
        let targets: Vec<GraphTarget> = self.dirty.lock().await.iter().cloned().collect();

        for target in targets {
            refresh_vector_index(&self.store, &target, dimensions).await?;
            self.dirty.lock().await.remove(&target);
            info!(
                namespace = %target.namespace,
                database = %target.database,
                table_base = %target.table_base,
                dimensions,
                "Vector index rebuilt"
            );
            self.events.emit(KgEvent::IndexRebuilt {
                namespace: target.namespace,
                database: target.database,
                table_base: target.table_base,
                dimensions,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Scheduler for EmbeddingScheduler {
    fn name(&self) -> &'static str {
        "embedding"
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Indexes are refreshed once after a restart.
    async fn startup(&self) -> Result<()> {
        let targets = self.refresh_targets().await?;
        self.dirty.lock().await.extend(targets);
        Ok(())
    }

    async fn tick(&self) -> Result<Tick> {
        // A failing target must not hold back the others.
        let mut failure = None;
        for target in self.refresh_targets().await? {
            let batch = self.stale_entities(&target).await?;
            if batch.is_empty() {
                continue;
            }

            self.set_phase(EmbeddingPhase::Active).await;
            let embedded = match self.embed_batch(&target, batch).await {
                Ok(n) => n,
                Err(e) if e.is_connectivity() => {
                    self.set_phase(EmbeddingPhase::Idle).await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(table_base = %target.table_base, error = %e, "Embedding batch discarded");
                    failure.get_or_insert(e);
                    continue;
                }
            };

            self.dirty.lock().await.insert(target.clone());
            self.events.emit(KgEvent::EmbeddingProgress {
                namespace: target.namespace,
                database: target.database,
                table_base: target.table_base,
                embedded,
            });
            return Ok(Tick::Worked);
        }

        if self.dirty.lock().await.is_empty() {
            self.set_phase(EmbeddingPhase::Idle).await;
            return match failure {
                Some(e) => Err(e),
                None => Ok(Tick::Idle),
            };
        }

        self.set_phase(EmbeddingPhase::Indexing).await;
        let rebuilt = self.rebuild_indexes().await;
        self.set_phase(EmbeddingPhase::Idle).await;
        rebuilt.map(|()| Tick::Worked)
    }
}

fn rejection_key(entity: &StaleEntity) -> String {
    format!("{}|{}", entity.entity_name, entity.content_hash())
}
