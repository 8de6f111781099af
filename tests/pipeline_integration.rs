mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Deserialize;

use common::{FakeEmbedder, FakeModel, drain, drain_events, fixture, fixture_with, seed_rows};
use kg_builder::kg::domain::{KgEvent, Stage, WorkStatus};
use kg_builder::kg::extraction::Extractor;
use kg_builder::kg::extraction::parser::parse_extraction;
use kg_builder::kg::graph::GraphUpserter;
use kg_builder::kg::persistence::KgStore;
use kg_builder::kg::persistence::schema::SchemaProvisioner;
use kg_builder::kg::persistence::tasks::{CANCELLED, ChunkCompletion, INTERRUPTED, TaskRepository};
use kg_builder::kg::scheduler::{EmbeddingPhase, ExtractionScheduler, Scheduler};
use kg_builder::kg::submit::SubmitParams;

const ONE: &str = "entity<|#|>Acme<|#|>organization<|#|>Acme appears in one\n\
                   entity<|#|>Bob<|#|>person<|#|>Bob works at Acme\n\
                   relation<|#|>Acme<|#|>Bob<|#|>employment<|#|>Bob works for Acme\n\
                   <|COMPLETE|>";
const TWO: &str = "entity<|#|>Acme<|#|>organization<|#|>Acme appears in two\n\
                   entity<|#|>Carol<|#|>person<|#|>Carol audits Acme\n\
                   relation<|#|>Carol<|#|>Acme<|#|>audit<|#|>Carol audits Acme\n\
                   <|COMPLETE|>";
const THREE: &str = "entity<|#|>Acme<|#|>organization<|#|>Acme appears in three\n\
                     relation<|#|>Bob<|#|>Acme<|#|>employment, tenure<|#|>Bob stays at Acme\n\
                     <|COMPLETE|>";

fn three_chunk_model() -> FakeModel {
    FakeModel::new(vec![
        ("sector one", Some(ONE)),
        ("sector two", Some(TWO)),
        ("sector three", Some(THREE)),
    ])
}

const ROWS: [(&str, i64, &str); 3] = [
    ("a", 0, "Acme hires Bob in sector one."),
    ("b", 1, "Carol audits Acme in sector two."),
    ("c", 2, "Bob stays at Acme in sector three."),
];

#[derive(Debug, Deserialize)]
struct EntityRow {
    entity_name: String,
    entity_type: String,
    description: String,
    source_chunk_ids: Vec<String>,
    file_keys: Vec<String>,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct RelationRow {
    relation_key: String,
    description: String,
    keywords: Vec<String>,
    source_chunk_ids: Vec<String>,
    weight: i64,
}

async fn entities(store: &KgStore, params: &SubmitParams) -> Vec<EntityRow> {
    store
        .within(&params.target.db_target(), |db| async move {
            Ok(db
                .query("SELECT * FROM docs_entity ORDER BY entity_name")
                .await?
                .take(0)?)
        })
        .await
        .expect("entities")
}

async fn relations(store: &KgStore, params: &SubmitParams) -> Vec<RelationRow> {
    store
        .within(&params.target.db_target(), |db| async move {
            Ok(db
                .query("SELECT * FROM docs_relation ORDER BY relation_key")
                .await?
                .take(0)?)
        })
        .await
        .expect("relations")
}

#[tokio::test]
async fn test_three_chunks_end_to_end() {
    let fx = fixture(three_chunk_model()).await;
    seed_rows(&fx.store, &fx.params, &ROWS).await;
    let mut rx = fx.service.subscribe();

    let task = fx.service.submit_task(&fx.params).await.unwrap().unwrap();
    assert_eq!(task.chunks_total, 3);
    assert_eq!(task.status, WorkStatus::Pending);

    // Stage 1
    assert_eq!(drain(fx.service.extraction_scheduler()).await, 3);
    let tasks = fx.service.query_status().await.unwrap();
    assert_eq!(tasks[0].status, WorkStatus::Completed);
    assert_eq!(tasks[0].chunks_completed, 3);
    assert!(tasks[0].finished_at.is_some());

    let repo = TaskRepository::new(fx.store.clone());
    let chunks = repo.chunks_for_task(Stage::Extraction, &task.key).await.unwrap();
    let results: Vec<&str> = chunks.iter().filter_map(|c| c.result.as_deref()).collect();
    assert_eq!(results.len(), 3);
    assert!(results[0].contains("appears in one"));
    assert!(results[2].contains("appears in three"));

    // Stage 2: bridge, then one chunk per tick.
    assert_eq!(drain(fx.service.build_scheduler()).await, 4);
    let builds = fx.service.query_build_status().await.unwrap();
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].key, task.key);
    assert_eq!(builds[0].status, WorkStatus::Completed);
    assert_eq!(builds[0].chunks_completed, 3);
    // Chunk three names Bob only as a relation endpoint.
    assert_eq!(builds[0].entities_total, 2 + 2 + 2);
    assert_eq!(builds[0].relations_total, 3);

    let rows = entities(&fx.store, &fx.params).await;
    let names: Vec<&str> = rows.iter().map(|e| e.entity_name.as_str()).collect();
    assert_eq!(names, vec!["Acme", "Bob", "Carol"]);

    let acme = &rows[0];
    assert_eq!(acme.entity_type, "organization");
    for part in ["appears in one", "appears in two", "appears in three"] {
        assert_eq!(acme.description.matches(part).count(), 1, "{part}");
    }
    let mut provenance = acme.source_chunk_ids.clone();
    provenance.sort();
    assert_eq!(provenance, vec!["chunks:a", "chunks:b", "chunks:c"]);
    assert_eq!(acme.file_keys, vec!["report.md"]);

    // (Acme, Bob) and (Bob, Acme) land on one edge.
    let rels = relations(&fx.store, &fx.params).await;
    assert_eq!(rels.len(), 2);
    let acme_bob = rels.iter().find(|r| r.relation_key == "Acme|Bob").unwrap();
    assert_eq!(acme_bob.weight, 2);
    assert_eq!(acme_bob.source_chunk_ids.len(), 2);
    assert!(acme_bob.keywords.contains(&"tenure".to_string()));
    assert!(acme_bob.description.contains("Bob stays at Acme"));

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(e, KgEvent::TaskCompleted { task_id, .. } if *task_id == task.key)));
    let completed = events
        .iter()
        .filter(|e| matches!(e, KgEvent::BuildCompleted { .. }))
        .count();
    assert_eq!(completed, 1);
}

#[tokio::test]
async fn test_embedding_stage_embeds_then_indexes() {
    let fx = fixture(three_chunk_model()).await;
    seed_rows(&fx.store, &fx.params, &ROWS).await;
    fx.service.submit_task(&fx.params).await.unwrap();
    drain(fx.service.extraction_scheduler()).await;
    drain(fx.service.build_scheduler()).await;
    let mut rx = fx.service.subscribe();

    let embedding = fx.service.embedding_scheduler();
    // One batch embeds all three entities, then the index is refreshed.
    assert_eq!(drain(embedding).await, 2);
    assert_eq!(embedding.phase().await, EmbeddingPhase::Idle);
    assert_eq!(fx.embedder.calls.load(Ordering::SeqCst), 1);

    let rows = entities(&fx.store, &fx.params).await;
    assert!(rows.iter().all(|e| e.embedding.as_ref().is_some_and(|v| v.len() == 4)));

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(e, KgEvent::EmbeddingProgress { embedded: 3, .. })));
    assert!(events.iter().any(|e| matches!(e, KgEvent::IndexRebuilt { dimensions: 4, .. })));

    // Nothing stale: no further provider calls.
    assert_eq!(drain(embedding).await, 0);
    assert_eq!(fx.embedder.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_description_growth_invalidates_embedding() {
    let fx = fixture(three_chunk_model()).await;
    seed_rows(&fx.store, &fx.params, &ROWS[..1]).await;
    fx.service.submit_task(&fx.params).await.unwrap();
    drain(fx.service.extraction_scheduler()).await;
    drain(fx.service.build_scheduler()).await;
    drain(fx.service.embedding_scheduler()).await;

    // A new row of the same file mentions Acme again.
    seed_rows(&fx.store, &fx.params, &ROWS[1..2]).await;
    fx.service.submit_task(&fx.params).await.unwrap().unwrap();
    drain(fx.service.extraction_scheduler()).await;
    drain(fx.service.build_scheduler()).await;

    let rows = entities(&fx.store, &fx.params).await;
    let acme = rows.iter().find(|e| e.entity_name == "Acme").unwrap();
    assert!(acme.embedding.is_none());
    let bob = rows.iter().find(|e| e.entity_name == "Bob").unwrap();
    assert!(bob.embedding.is_some());

    drain(fx.service.embedding_scheduler()).await;
    let rows = entities(&fx.store, &fx.params).await;
    assert!(rows.iter().all(|e| e.embedding.is_some()));
}

#[tokio::test]
async fn test_replayed_merge_is_idempotent() {
    let store = KgStore::memory("kg", "system").await.unwrap();
    let params = common::submit_params();
    let upserter = GraphUpserter::new(store.clone(), 2);
    let parsed = parse_extraction(ONE);

    SchemaProvisioner::new(store.clone())
        .ensure(&params.target)
        .await
        .unwrap();
    for _ in 0..2 {
        upserter
            .upsert(&params.target, &parsed, "a", "report.md")
            .await
            .unwrap();
    }

    let rows = entities(&store, &params).await;
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!(row.source_chunk_ids, vec!["a"]);
        assert_eq!(row.file_keys, vec!["report.md"]);
    }
    assert_eq!(rows[0].description, "Acme appears in one");

    let rels = relations(&store, &params).await;
    assert_eq!(rels.len(), 1);
    assert_eq!(rels[0].weight, 1);
    assert_eq!(rels[0].source_chunk_ids, vec!["a"]);
    assert_eq!(rels[0].description, "Bob works for Acme");
}

#[tokio::test]
async fn test_failed_chunk_fails_task_but_not_siblings() {
    let fx = fixture(FakeModel::new(vec![
        ("sector one", Some(ONE)),
        ("sector two", None),
        ("sector three", Some(THREE)),
    ]))
    .await;
    seed_rows(&fx.store, &fx.params, &ROWS).await;
    let mut rx = fx.service.subscribe();

    let task = fx.service.submit_task(&fx.params).await.unwrap().unwrap();
    drain(fx.service.extraction_scheduler()).await;

    let tasks = fx.service.query_status().await.unwrap();
    assert_eq!(tasks[0].status, WorkStatus::Failed);
    assert_eq!(tasks[0].chunks_completed, 2);
    assert_eq!(tasks[0].chunks_failed, 1);
    assert!(tasks[0].error.as_deref().unwrap().contains("rate limited"));

    let events = drain_events(&mut rx);
    let failed: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, KgEvent::TaskFailed { .. }))
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].task_id(), Some(task.key.as_str()));

    // A failed extraction task is never bridged.
    drain(fx.service.build_scheduler()).await;
    assert!(fx.service.query_build_status().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_startup_sweep_fails_interrupted_chunks() {
    let fx = fixture(three_chunk_model()).await;
    seed_rows(&fx.store, &fx.params, &ROWS).await;
    let task = fx.service.submit_task(&fx.params).await.unwrap().unwrap();

    // A previous process claimed two chunks and died.
    let repo = TaskRepository::new(fx.store.clone());
    let claimed = repo.claim_pending(Stage::Extraction, 2).await.unwrap();
    assert_eq!(claimed.len(), 2);
    assert_eq!(claimed[0].status, WorkStatus::Progressing);

    let restarted = ExtractionScheduler::new(
        repo.clone(),
        Extractor::new(fx.model.clone(), common::test_config().extraction),
        fx.service.events().clone(),
        std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(1)),
        Duration::from_millis(10),
    );
    restarted.startup().await.unwrap();

    let chunks = repo.chunks_for_task(Stage::Extraction, &task.key).await.unwrap();
    let failed: Vec<_> = chunks.iter().filter(|c| c.status == WorkStatus::Failed).collect();
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().all(|c| c.error.as_deref() == Some(INTERRUPTED)));

    let record = repo.get_task(Stage::Extraction, &task.key).await.unwrap().unwrap();
    assert_eq!(record.chunks_failed, 2);
    assert_eq!(record.chunks_completed, 0);
    assert_eq!(record.status, WorkStatus::Progressing);
    assert!(record.counters_consistent());

    // The remaining chunk still runs, finishing the task as failed.
    drain(&restarted).await;
    let record = repo.get_task(Stage::Extraction, &task.key).await.unwrap().unwrap();
    assert_eq!(record.status, WorkStatus::Failed);
    assert_eq!(record.chunks_completed, 1);
}

#[tokio::test]
async fn test_cancel_then_retry() {
    let fx = fixture(three_chunk_model()).await;
    seed_rows(&fx.store, &fx.params, &ROWS).await;
    let task = fx.service.submit_task(&fx.params).await.unwrap().unwrap();

    let touched = fx.service.cancel_task(&task.key).await.unwrap();
    assert_eq!(touched.len(), 1);
    assert_eq!(touched[0].0, Stage::Extraction);
    assert_eq!(touched[0].1.status, WorkStatus::Failed);
    assert_eq!(touched[0].1.chunks_failed, 3);
    assert_eq!(touched[0].1.error.as_deref(), Some(CANCELLED));

    // Nothing left to claim.
    assert_eq!(drain(fx.service.extraction_scheduler()).await, 0);
    assert_eq!(fx.model.calls.load(Ordering::SeqCst), 0);

    let touched = fx.service.retry_task(&task.key).await.unwrap();
    assert_eq!(touched[0].1.status, WorkStatus::Pending);
    assert_eq!(touched[0].1.chunks_failed, 0);
    assert!(touched[0].1.error.is_none());

    drain(fx.service.extraction_scheduler()).await;
    let tasks = fx.service.query_status().await.unwrap();
    assert_eq!(tasks[0].status, WorkStatus::Completed);
    assert_eq!(tasks[0].chunks_completed, 3);
}

#[tokio::test]
async fn test_concurrency_claims_several_chunks_per_cycle() {
    let fx = fixture(three_chunk_model()).await;
    seed_rows(&fx.store, &fx.params, &ROWS).await;
    fx.service.submit_task(&fx.params).await.unwrap();

    fx.service.update_concurrency(3).unwrap();
    assert!(fx.service.update_concurrency(0).is_err());

    // All three chunks in one cycle.
    assert_eq!(drain(fx.service.extraction_scheduler()).await, 1);
    let tasks = fx.service.query_status().await.unwrap();
    assert_eq!(tasks[0].status, WorkStatus::Completed);
}

#[tokio::test]
async fn test_housekeeping_removes_finished_pairs() {
    let fx = fixture(three_chunk_model()).await;
    seed_rows(&fx.store, &fx.params, &ROWS).await;
    let task = fx.service.submit_task(&fx.params).await.unwrap().unwrap();
    drain(fx.service.extraction_scheduler()).await;
    drain(fx.service.build_scheduler()).await;

    let report = fx.service.housekeeping().await.unwrap();
    assert_eq!(report.removed, 1);
    assert!(fx.service.query_status().await.unwrap().is_empty());
    assert!(fx.service.query_build_status().await.unwrap().is_empty());

    // Graph content survives.
    assert_eq!(entities(&fx.store, &fx.params).await.len(), 3);
    assert!(fx.service.remove_task(&task.key).await.is_err());
}

#[tokio::test]
async fn test_housekeeping_leaves_in_flight_chunks_alone() {
    let fx = fixture(three_chunk_model()).await;
    seed_rows(&fx.store, &fx.params, &ROWS[..1]).await;
    fx.service.submit_task(&fx.params).await.unwrap().unwrap();

    let repo = TaskRepository::new(fx.store.clone());
    let claimed = repo.claim_pending(Stage::Extraction, 1).await.unwrap();
    let report = fx.service.housekeeping().await.unwrap();
    assert_eq!(report.interrupted, 0);

    // The answer arriving after the sweep is still recorded.
    let outcome = repo
        .complete_chunk(
            Stage::Extraction,
            &claimed[0],
            ChunkCompletion {
                result: Some(ONE.to_string()),
                ..ChunkCompletion::default()
            },
        )
        .await
        .unwrap()
        .expect("completion accepted");
    assert!(outcome.finished);
    assert_eq!(outcome.task.status, WorkStatus::Completed);
}

#[tokio::test]
async fn test_startup_housekeeping_fails_stuck_chunks() {
    let fx = fixture(three_chunk_model()).await;
    seed_rows(&fx.store, &fx.params, &ROWS[..1]).await;
    let task = fx.service.submit_task(&fx.params).await.unwrap().unwrap();

    let repo = TaskRepository::new(fx.store.clone());
    let claimed = repo.claim_pending(Stage::Extraction, 1).await.unwrap();
    let report = fx.service.startup_housekeeping().await.unwrap();
    assert_eq!(report.interrupted, 1);

    let record = repo.get_task(Stage::Extraction, &task.key).await.unwrap().unwrap();
    assert_eq!(record.status, WorkStatus::Failed);
    assert_eq!(record.error.as_deref(), Some(INTERRUPTED));
    let late = repo
        .complete_chunk(Stage::Extraction, &claimed[0], ChunkCompletion::default())
        .await
        .unwrap();
    assert!(late.is_none());
}

#[tokio::test]
async fn test_rejected_entity_does_not_block_the_rest() {
    let fx = fixture_with(three_chunk_model(), FakeEmbedder::rejecting("Carol audits")).await;
    seed_rows(&fx.store, &fx.params, &ROWS[..2]).await;
    fx.service.submit_task(&fx.params).await.unwrap();
    drain(fx.service.extraction_scheduler()).await;
    drain(fx.service.build_scheduler()).await;
    let mut rx = fx.service.subscribe();

    // The batch fails, then each entity is embedded on its own: one batch
    // call plus three single calls, then the index refresh.
    let embedding = fx.service.embedding_scheduler();
    assert_eq!(drain(embedding).await, 2);
    assert_eq!(fx.embedder.calls.load(Ordering::SeqCst), 4);

    let rows = entities(&fx.store, &fx.params).await;
    for row in &rows {
        let embedded = row.embedding.is_some();
        assert_eq!(embedded, row.entity_name != "Carol", "{}", row.entity_name);
    }

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(e, KgEvent::EmbeddingProgress { embedded: 2, .. })));

    // Carol is set aside rather than retried every cycle.
    assert_eq!(drain(embedding).await, 0);
    assert_eq!(fx.embedder.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_rows_of_different_tables_keep_separate_provenance() {
    let fx = fixture(three_chunk_model()).await;
    let mut pages = fx.params.clone();
    pages.source.table = "pages".to_string();

    // Same row key in two source tables feeding one graph.
    seed_rows(&fx.store, &fx.params, &ROWS[..1]).await;
    seed_rows(&fx.store, &pages, &[("a", 0, "Carol audits Acme in sector two.")]).await;
    fx.service.submit_task(&fx.params).await.unwrap().unwrap();
    fx.service.submit_task(&pages).await.unwrap().unwrap();
    drain(fx.service.extraction_scheduler()).await;
    drain(fx.service.build_scheduler()).await;

    let rows = entities(&fx.store, &fx.params).await;
    let acme = rows.iter().find(|e| e.entity_name == "Acme").unwrap();
    assert!(acme.description.contains("appears in one"));
    assert!(acme.description.contains("appears in two"));
    let mut provenance = acme.source_chunk_ids.clone();
    provenance.sort();
    assert_eq!(provenance, vec!["chunks:a", "pages:a"]);
}

async fn chunk_statuses(repo: &TaskRepository, task: &str) -> Vec<(String, WorkStatus)> {
    repo.chunks_for_task(Stage::Extraction, task)
        .await
        .unwrap()
        .into_iter()
        .map(|c| (c.key, c.status))
        .collect()
}

/// Same status, one transition, or two via `progressing` (a claim and its
/// outcome can land within one observed step).
fn reachable(from: WorkStatus, to: WorkStatus) -> bool {
    from == to
        || from.can_transition_to(to)
        || (from.can_transition_to(WorkStatus::Progressing)
            && WorkStatus::Progressing.can_transition_to(to))
}

#[tokio::test]
async fn test_chunk_statuses_only_move_forward() {
    let fx = fixture(FakeModel::new(vec![
        ("sector one", Some(ONE)),
        ("sector two", None),
        ("sector three", Some(THREE)),
    ]))
    .await;
    seed_rows(&fx.store, &fx.params, &ROWS).await;
    let task = fx.service.submit_task(&fx.params).await.unwrap().unwrap();
    let repo = TaskRepository::new(fx.store.clone());

    let mut snapshots = vec![chunk_statuses(&repo, &task.key).await];

    // One chunk is left in flight by a process that then dies.
    repo.claim_pending(Stage::Extraction, 1).await.unwrap();
    snapshots.push(chunk_statuses(&repo, &task.key).await);
    let restarted = ExtractionScheduler::new(
        repo.clone(),
        Extractor::new(fx.model.clone(), common::test_config().extraction),
        fx.service.events().clone(),
        std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(1)),
        Duration::from_millis(10),
    );
    restarted.startup().await.unwrap();
    snapshots.push(chunk_statuses(&repo, &task.key).await);

    for _ in 0..10 {
        let tick = restarted.tick().await.unwrap();
        snapshots.push(chunk_statuses(&repo, &task.key).await);
        if tick == kg_builder::kg::scheduler::Tick::Idle {
            break;
        }
    }

    for pair in snapshots.windows(2) {
        for ((key, before), (same, after)) in pair[0].iter().zip(&pair[1]) {
            assert_eq!(key, same);
            assert!(reachable(*before, *after), "{key}: {before} -> {after}");
        }
    }

    let last: Vec<WorkStatus> = snapshots.last().unwrap().iter().map(|(_, s)| *s).collect();
    assert_eq!(
        last,
        vec![WorkStatus::Failed, WorkStatus::Failed, WorkStatus::Completed]
    );
    let observed: Vec<WorkStatus> = snapshots.iter().map(|s| s[0].1).collect();
    assert!(observed.contains(&WorkStatus::Progressing));
}
