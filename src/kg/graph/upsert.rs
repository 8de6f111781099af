//! Graph upsert engine.
//!
//! Merges one chunk's parsed records into a knowledge base's graph tables.
//! Every write is keyed by content and carries the contributing chunk id:
//!
//! - provenance sets are merged with `array::union`;
//! - a description segment is appended only when the chunk id is not yet
//!   recorded on the row, so replaying a chunk never duplicates text;
//! - the stored embedding is dropped only when the description grew.
//!
//! Statements are grouped into fixed-size batches, each run as one
//! transaction; a failing batch aborts alone.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::kg::domain::{
    ExtractionResult, GraphTarget, MergeSummary, ParsedEntity, ParsedRelation,
};
use crate::kg::error::{KgError, Result};
use crate::kg::extraction::parser::MERGE_SEPARATOR;
use crate::kg::persistence::KgStore;
use crate::kg::persistence::schema::GraphTables;

/// One parameterized statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: BTreeMap<String, Value>,
}

/// Record id literal with an angle-bracketed key.
fn record_id(table: &str, key: &str) -> String {
    format!("{table}:⟨{}⟩", key.replace('⟩', "\\⟩"))
}

/// Condition under which a row takes this chunk's description segment.
fn takes_segment(desc_param: &str) -> String {
    format!("(${desc_param} != '' AND $chunk_id NOTINSIDE (source_chunk_ids ?? []))")
}

fn entity_statement(tables: &GraphTables, i: usize, entity: &ParsedEntity) -> Statement {
    let rid = record_id(&tables.entity, &entity.name);
    let grows = takes_segment(&format!("d{i}"));
    let sql = format!(
        "UPSERT {rid} SET
            entity_name = $n{i},
            entity_type = IF (entity_type ?? 'Other') = 'Other' THEN $t{i} ELSE entity_type END,
            embedding = IF {grows} THEN NONE ELSE embedding END,
            embedding_hash = IF {grows} THEN NONE ELSE embedding_hash END,
            description = IF {grows} THEN
                (IF (description ?? '') = '' THEN $d{i} ELSE string::concat(description, $sep, $d{i}) END)
                ELSE (description ?? '') END,
            source_chunk_ids = array::union(source_chunk_ids ?? [], [$chunk_id]),
            file_keys = array::union(file_keys ?? [], [$file_key])
         RETURN NONE;
         UPSERT {prov} SET entity = {rid}, chunk_ids = array::union(chunk_ids ?? [], [$chunk_id]) RETURN NONE;",
        prov = record_id(&tables.entity_chunk, &entity.name),
    );

    let mut params = BTreeMap::new();
    params.insert(format!("n{i}"), Value::String(entity.name.clone()));
    params.insert(format!("t{i}"), Value::String(entity.entity_type.clone()));
    params.insert(format!("d{i}"), Value::String(entity.description.clone()));
    Statement { sql, params }
}

fn relation_statement(tables: &GraphTables, i: usize, relation: &ParsedRelation) -> Statement {
    let key = relation.key();
    let rid = record_id(&tables.relation, &key);
    let grows = takes_segment(&format!("rd{i}"));
    let sql = format!(
        "IF array::len((SELECT id FROM {rid})) = 0 {{
            RELATE {src}->{rid}->{tgt} SET
                relation_key = $k{i},
                keywords = $kw{i},
                description = $rd{i},
                source_chunk_ids = [$chunk_id],
                file_keys = [$file_key],
                weight = 1
            RETURN NONE;
         }} ELSE {{
            UPDATE {rid} SET
                description = IF {grows} THEN
                    (IF (description ?? '') = '' THEN $rd{i} ELSE string::concat(description, $sep, $rd{i}) END)
                    ELSE (description ?? '') END,
                keywords = array::union(keywords ?? [], $kw{i}),
                source_chunk_ids = array::union(source_chunk_ids ?? [], [$chunk_id]),
                file_keys = array::union(file_keys ?? [], [$file_key]),
                weight = array::len(array::union(source_chunk_ids ?? [], [$chunk_id]))
            RETURN NONE;
         }};
         UPSERT {prov} SET relation = {rid}, chunk_ids = array::union(chunk_ids ?? [], [$chunk_id]) RETURN NONE;",
        src = record_id(&tables.entity, &relation.source),
        tgt = record_id(&tables.entity, &relation.target),
        prov = record_id(&tables.relation_chunk, &key),
    );

    let mut params = BTreeMap::new();
    params.insert(format!("k{i}"), Value::String(key));
    params.insert(
        format!("kw{i}"),
        Value::Array(relation.keywords.iter().cloned().map(Value::String).collect()),
    );
    params.insert(format!("rd{i}"), Value::String(relation.description.clone()));
    Statement { sql, params }
}

/// Entity statements first, so every edge's endpoints exist before it.
pub fn build_statements(tables: &GraphTables, result: &ExtractionResult) -> Vec<Statement> {
    let entities = result
        .entities
        .iter()
        .enumerate()
        .map(|(i, e)| entity_statement(tables, i, e));
    let relations = result
        .relations
        .iter()
        .enumerate()
        .map(|(i, r)| relation_statement(tables, i, r));
    entities.chain(relations).collect()
}

/// Merges parsed records into graph tables.
#[derive(Debug, Clone)]
pub struct GraphUpserter {
    store: KgStore,
    batch_size: usize,
}

impl GraphUpserter {
    pub fn new(store: KgStore, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Merge `result`, attributed to `chunk_id` from `file_key`, into `target`.
    pub async fn upsert(
        &self,
        target: &GraphTarget,
        result: &ExtractionResult,
        chunk_id: &str,
        file_key: &str,
    ) -> Result<MergeSummary> {
        let summary = MergeSummary {
            entities: result.entities.len() as u64,
            relations: result.relations.len() as u64,
        };
        if result.is_empty() {
            return Ok(summary);
        }

        let tables = GraphTables::new(&target.table_base)?;
        let statements = build_statements(&tables, result);
        let batch_size = self.batch_size;
        let (chunk_id, file_key) = (chunk_id.to_string(), file_key.to_string());

        self.store
            .within(&target.db_target(), |db| async move {
                for (n, batch) in statements.chunks(batch_size).enumerate() {
                    let mut sql = String::from("BEGIN TRANSACTION;\n");
                    let mut params: BTreeMap<String, Value> = BTreeMap::new();
                    for statement in batch {
                        sql.push_str(&statement.sql);
                        sql.push('\n');
                        params.extend(statement.params.clone());
                    }
                    sql.push_str("COMMIT TRANSACTION;");
                    params.insert("chunk_id".to_string(), Value::String(chunk_id.clone()));
                    params.insert("file_key".to_string(), Value::String(file_key.clone()));
                    params.insert("sep".to_string(), Value::String(MERGE_SEPARATOR.to_string()));

                    db.query(sql)
                        .bind(params)
                        .await
                        .and_then(surrealdb::Response::check)
                        .map_err(|e| KgError::Upsert(format!("batch {n}: {e}")))?;
                    debug!(batch = n, statements = batch.len(), "Upsert batch applied");
                }
                Ok(())
            })
            .await?;

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kg::extraction::parser::parse_extraction;

    #[test]
    fn test_statements_order_entities_first() {
        let tables = GraphTables::new("kb").unwrap();
        let parsed = parse_extraction("relation<|#|>Alice<|#|>Bob<|#|>knows<|#|>friends");
        let statements = build_statements(&tables, &parsed);

        // Two placeholder entities, then the relation.
        assert_eq!(statements.len(), 3);
        assert!(statements[0].sql.starts_with("UPSERT kb_entity:⟨Alice⟩"));
        assert!(statements[2].sql.contains("RELATE kb_entity:⟨Alice⟩->kb_relation:⟨Alice|Bob⟩->kb_entity:⟨Bob⟩"));
        assert_eq!(statements[2].params["k0"], "Alice|Bob");
    }

    #[test]
    fn test_params_are_indexed_per_statement() {
        let tables = GraphTables::new("kb").unwrap();
        let parsed = parse_extraction("entity<|#|>A<|#|>person<|#|>x\nentity<|#|>B<|#|>person<|#|>y");
        let statements = build_statements(&tables, &parsed);
        assert_eq!(statements[0].params["d0"], "x");
        assert_eq!(statements[1].params["d1"], "y");
        assert!(statements[1].sql.contains("$n1"));
    }

    #[test]
    fn test_record_id_escapes_closing_bracket() {
        assert_eq!(record_id("t", "a⟩b"), "t:⟨a\\⟩b⟩");
    }
}
