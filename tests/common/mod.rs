#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use kg_builder::config::AppConfig;
use kg_builder::kg::domain::{GraphTarget, KgEvent, SourceTable};
use kg_builder::kg::embedding::Embedder;
use kg_builder::kg::error::{KgError, Result};
use kg_builder::kg::persistence::KgStore;
use kg_builder::kg::scheduler::{Scheduler, Tick};
use kg_builder::kg::submit::SubmitParams;
use kg_builder::kg::KgService;
use kg_builder::llm::{CompletionModel, Message, MessageRole};

/// Answers by looking for a marker in the latest user turn.
///
/// `None` answers are provider failures.
pub struct FakeModel {
    answers: Vec<(&'static str, Option<String>)>,
    pub calls: AtomicUsize,
}

impl FakeModel {
    pub fn new(answers: Vec<(&'static str, Option<&str>)>) -> Self {
        Self {
            answers: answers
                .into_iter()
                .map(|(marker, answer)| (marker, answer.map(str::to_string)))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CompletionModel for FakeModel {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        for (marker, answer) in &self.answers {
            if prompt.contains(marker) {
                return answer
                    .clone()
                    .ok_or_else(|| KgError::Provider("rate limited".to_string()));
            }
        }
        Ok("<|COMPLETE|>".to_string())
    }

    fn model_name(&self) -> &str {
        "fake"
    }
}

/// Deterministic 4-dimensional vectors.
///
/// A call including a text that contains the `reject` marker fails whole.
pub struct FakeEmbedder {
    reject: Option<&'static str>,
    pub calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new() -> Self {
        Self {
            reject: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn rejecting(marker: &'static str) -> Self {
        Self {
            reject: Some(marker),
            ..Self::new()
        }
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, texts: Vec<String>, dimensions: usize) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = self.reject {
            if texts.iter().any(|t| t.contains(marker)) {
                return Err(KgError::Provider("input rejected".to_string()));
            }
        }
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0; dimensions];
                v[0] = t.len() as f32;
                v[1] = 1.0;
                v
            })
            .collect())
    }

    fn dimensions(&self) -> usize {
        4
    }
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::load_from_args(["kg-builder"]).expect("default config");
    config.extraction.max_gleaning = 0;
    config.extraction.use_examples = false;
    config.embedding.dimensions = 4;
    config
}

pub fn submit_params() -> SubmitParams {
    SubmitParams {
        kb_id: "kb1".to_string(),
        file_key: "report.md".to_string(),
        source: SourceTable {
            namespace: "kb1".to_string(),
            database: "kb1".to_string(),
            table: "chunks".to_string(),
        },
        target: GraphTarget {
            namespace: "kb1".to_string(),
            database: "kb1".to_string(),
            table_base: "docs".to_string(),
        },
    }
}

pub struct Fixture {
    pub store: KgStore,
    pub service: KgService,
    pub model: Arc<FakeModel>,
    pub embedder: Arc<FakeEmbedder>,
    pub params: SubmitParams,
}

pub async fn fixture(model: FakeModel) -> Fixture {
    fixture_with(model, FakeEmbedder::new()).await
}

pub async fn fixture_with(model: FakeModel, embedder: FakeEmbedder) -> Fixture {
    let store = KgStore::memory("kg", "system").await.expect("memory store");
    let model = Arc::new(model);
    let embedder = Arc::new(embedder);
    let service = KgService::new(
        &test_config(),
        store.clone(),
        Arc::clone(&model) as Arc<dyn CompletionModel>,
        Arc::clone(&embedder) as Arc<dyn Embedder>,
    );
    Fixture {
        store,
        service,
        model,
        embedder,
        params: submit_params(),
    }
}

/// Insert `(row key, chunk index, content)` rows into the source table.
pub async fn seed_rows(store: &KgStore, params: &SubmitParams, rows: &[(&str, i64, &str)]) {
    let rows: Vec<serde_json::Value> = rows
        .iter()
        .map(|(key, index, content)| {
            serde_json::json!({
                "id": key,
                "chunk_index": index,
                "content": content,
                "file_key": params.file_key,
            })
        })
        .collect();
    let table = params.source.table.clone();
    store
        .within(&params.source.db_target(), |db| async move {
            db.query(format!("INSERT INTO {table} $rows"))
                .bind(("rows", rows))
                .await?
                .check()?;
            Ok(())
        })
        .await
        .expect("seed rows");
}

/// Tick until the scheduler reports idle.
pub async fn drain(scheduler: &dyn Scheduler) -> usize {
    let mut worked = 0;
    for _ in 0..100 {
        match scheduler.tick().await.expect("tick") {
            Tick::Worked => worked += 1,
            Tick::Idle => return worked,
        }
    }
    panic!("{} scheduler never went idle", scheduler.name());
}

pub fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<KgEvent>) -> Vec<KgEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
