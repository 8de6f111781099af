//! Pipeline facade exposed to the hosting process.
//!
//! [`KgService`] owns the three stage schedulers and the shared pieces they
//! run on (store, event bus, schema provisioner). The HTTP layer and the
//! binary only talk to this type.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::AppConfig;
use crate::kg::domain::{GraphTarget, KgEvent, Stage, TaskRecord};
use crate::kg::embedding::Embedder;
use crate::kg::error::{KgError, Result};
use crate::kg::events::EventBus;
use crate::kg::extraction::Extractor;
use crate::kg::graph::GraphUpserter;
use crate::kg::persistence::KgStore;
use crate::kg::persistence::schema::{GraphTables, SchemaProvisioner};
use crate::kg::persistence::tasks::{HousekeepingReport, TaskRepository};
use crate::kg::scheduler::build::publish_build;
use crate::kg::scheduler::extraction::publish_task;
use crate::kg::scheduler::{
    BuildScheduler, EmbeddingScheduler, ExtractionScheduler, Scheduler, run_scheduler,
};
use crate::kg::submit::{SubmitParams, TaskSubmitter};
use crate::llm::CompletionModel;

#[derive(Debug, Clone)]
pub struct KgService {
    repo: TaskRepository,
    submitter: TaskSubmitter,
    provisioner: Arc<SchemaProvisioner>,
    events: EventBus,
    concurrency: Arc<AtomicUsize>,
    extraction: Arc<ExtractionScheduler>,
    build: Arc<BuildScheduler>,
    embedding: Arc<EmbeddingScheduler>,
}

impl KgService {
    pub fn new(
        config: &AppConfig,
        store: KgStore,
        model: Arc<dyn CompletionModel>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let sched = &config.scheduler;
        let repo = TaskRepository::new(store.clone());
        let events = EventBus::default();
        let provisioner = Arc::new(SchemaProvisioner::new(store.clone()));
        let concurrency = Arc::new(AtomicUsize::new(sched.concurrency.max(1)));

        let extraction = Arc::new(ExtractionScheduler::new(
            repo.clone(),
            Extractor::new(model, config.extraction.clone()),
            events.clone(),
            Arc::clone(&concurrency),
            Duration::from_millis(sched.extraction_poll_ms),
        ));
        let build = Arc::new(BuildScheduler::new(
            repo.clone(),
            GraphUpserter::new(store.clone(), sched.upsert_batch_size),
            Arc::clone(&provisioner),
            events.clone(),
            Duration::from_millis(sched.build_poll_ms),
        ));
        let embedding = Arc::new(EmbeddingScheduler::new(
            store,
            embedder,
            events.clone(),
            sched.embedding_batch_size,
            Duration::from_millis(sched.embedding_poll_ms),
        ));

        Self {
            submitter: TaskSubmitter::new(repo.clone()),
            repo,
            provisioner,
            events,
            concurrency,
            extraction,
            build,
            embedding,
        }
    }

    /// Start the three stage loops; they stop when `cancel` fires.
    pub fn spawn(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let schedulers: [Arc<dyn Scheduler>; 3] = [
            Arc::clone(&self.extraction) as Arc<dyn Scheduler>,
            Arc::clone(&self.build) as Arc<dyn Scheduler>,
            Arc::clone(&self.embedding) as Arc<dyn Scheduler>,
        ];
        schedulers
            .into_iter()
            .map(|s| tokio::spawn(run_scheduler(s, cancel.clone())))
            .collect()
    }

    pub async fn submit_task(&self, params: &SubmitParams) -> Result<Option<TaskRecord>> {
        self.submitter.submit(params).await
    }

    pub async fn query_status(&self) -> Result<Vec<TaskRecord>> {
        self.repo.list_tasks(Stage::Extraction).await
    }

    pub async fn query_build_status(&self) -> Result<Vec<TaskRecord>> {
        self.repo.list_tasks(Stage::Build).await
    }

    /// Chunks stage 1 claims per cycle.
    pub fn concurrency(&self) -> usize {
        self.concurrency.load(Ordering::Relaxed)
    }

    pub fn update_concurrency(&self, n: usize) -> Result<()> {
        if n == 0 {
            return Err(KgError::InvalidInput("concurrency must be at least 1".to_string()));
        }
        let previous = self.concurrency.swap(n, Ordering::Relaxed);
        info!(previous, concurrency = n, "Updated extraction concurrency");
        Ok(())
    }

    /// Issue the graph DDL for `target`, even if it was provisioned before.
    pub async fn create_graph_schema(&self, target: &GraphTarget) -> Result<GraphTables> {
        let tables = GraphTables::new(&target.table_base)?;
        self.provisioner.forget(target).await;
        self.provisioner.ensure(target).await?;
        Ok(tables)
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<Vec<(Stage, TaskRecord)>> {
        let touched = self.repo.cancel_task(task_id).await?;
        if touched.is_empty() {
            return Err(KgError::NotFound(format!("task {task_id}")));
        }
        info!(task_id, "Cancelled task");
        self.publish(&touched);
        Ok(touched)
    }

    pub async fn retry_task(&self, task_id: &str) -> Result<Vec<(Stage, TaskRecord)>> {
        let touched = self.repo.retry_task(task_id).await?;
        if touched.is_empty() {
            return Err(KgError::NotFound(format!("task {task_id}")));
        }
        info!(task_id, "Retrying failed chunks");
        self.publish(&touched);
        Ok(touched)
    }

    pub async fn remove_task(&self, task_id: &str) -> Result<()> {
        if !self.repo.remove_task(task_id).await? {
            return Err(KgError::NotFound(format!("task {task_id}")));
        }
        info!(task_id, "Removed task");
        Ok(())
    }

    /// Drop finished task pairs. Safe while the schedulers run.
    pub async fn housekeeping(&self) -> Result<HousekeepingReport> {
        self.repo.housekeeping().await
    }

    /// Also fails chunks stuck in `progressing`; call before [`Self::spawn`].
    pub async fn startup_housekeeping(&self) -> Result<HousekeepingReport> {
        self.repo.startup_housekeeping().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KgEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn extraction_scheduler(&self) -> &ExtractionScheduler {
        &self.extraction
    }

    pub fn build_scheduler(&self) -> &BuildScheduler {
        &self.build
    }

    pub fn embedding_scheduler(&self) -> &EmbeddingScheduler {
        &self.embedding
    }

    /// Events for tasks whose rows an administrative call rewrote.
    fn publish(&self, touched: &[(Stage, TaskRecord)]) {
        for (stage, task) in touched {
            let finished = task.status.is_terminal();
            match stage {
                Stage::Extraction => publish_task(&self.events, task, finished),
                Stage::Build => publish_build(&self.events, task, finished),
            }
        }
    }
}
