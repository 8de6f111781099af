//! Extraction response parser.
//!
//! Turns the raw model answer into entity and relation records. The grammar
//! is one record per line, fields split by [`TUPLE_DELIMITER`]:
//!
//! ```text
//! entity<|#|>name<|#|>type<|#|>description
//! relation<|#|>source<|#|>target<|#|>keywords<|#|>description
//! <|COMPLETE|>
//! ```
//!
//! Parsing never fails: lines that do not fit are skipped.

use std::collections::HashMap;

use crate::kg::domain::graph::DEFAULT_ENTITY_TYPE;
use crate::kg::domain::{ExtractionResult, ParsedEntity, ParsedRelation};
use crate::kg::graph::keys::sanitize_name;

pub const TUPLE_DELIMITER: &str = "<|#|>";
pub const COMPLETION_MARKER: &str = "<|COMPLETE|>";
/// Joins descriptions of the same entity or relation.
pub const MERGE_SEPARATOR: &str = "<SEP>";

/// Parse one chunk's raw extraction text.
pub fn parse_extraction(raw: &str) -> ExtractionResult {
    let mut entities: Vec<ParsedEntity> = Vec::new();
    let mut entity_index: HashMap<String, usize> = HashMap::new();
    let mut relations: Vec<ParsedRelation> = Vec::new();
    let mut relation_index: HashMap<String, usize> = HashMap::new();
    let mut completed = false;

    for line in raw.lines() {
        let (line, stop) = match line.find(COMPLETION_MARKER) {
            Some(pos) => (&line[..pos], true),
            None => (line, false),
        };

        match parse_line(line) {
            Some(Record::Entity(entity)) => merge_entity(&mut entities, &mut entity_index, entity),
            Some(Record::Relation(relation)) => {
                merge_relation(&mut relations, &mut relation_index, relation);
            }
            None => {}
        }

        if stop {
            completed = true;
            break;
        }
    }

    // Every edge needs both endpoint rows.
    for relation in &relations {
        for name in [&relation.source, &relation.target] {
            if !entity_index.contains_key(name.as_str()) {
                entity_index.insert(name.clone(), entities.len());
                entities.push(ParsedEntity {
                    name: name.clone(),
                    entity_type: DEFAULT_ENTITY_TYPE.to_string(),
                    description: String::new(),
                });
            }
        }
    }

    ExtractionResult {
        entities,
        relations,
        completed,
    }
}

/// Whether the text contains anything the parser recognizes.
pub fn has_records(raw: &str) -> bool {
    raw.contains(COMPLETION_MARKER) || raw.lines().any(|l| parse_line(l).is_some())
}

enum Record {
    Entity(ParsedEntity),
    Relation(ParsedRelation),
}

fn parse_line(line: &str) -> Option<Record> {
    let line = strip_wrapping(line.trim());
    if !line.contains(TUPLE_DELIMITER) {
        return None;
    }
    let fields: Vec<&str> = line.split(TUPLE_DELIMITER).map(clean_field).collect();

    match fields[0].to_lowercase().as_str() {
        "entity" => {
            let name = sanitize_name(fields.get(1)?);
            if name.is_empty() {
                return None;
            }
            let entity_type = fields
                .get(2)
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .unwrap_or(DEFAULT_ENTITY_TYPE)
                .to_string();
            let description = fields.get(3).map(|d| d.to_string()).unwrap_or_default();
            Some(Record::Entity(ParsedEntity {
                name,
                entity_type,
                description,
            }))
        }
        "relation" | "relationship" => {
            let source = sanitize_name(fields.get(1)?);
            let target = sanitize_name(fields.get(2)?);
            if source.is_empty() || target.is_empty() || source == target {
                return None;
            }
            let keywords = fields
                .get(3)
                .map(|k| split_keywords(k))
                .unwrap_or_default();
            let description = fields.get(4).map(|d| d.to_string()).unwrap_or_default();
            Some(Record::Relation(ParsedRelation {
                source,
                target,
                keywords,
                description,
            }))
        }
        _ => None,
    }
}

/// Drop a surrounding `( ... )` that some models wrap records in.
fn strip_wrapping(line: &str) -> &str {
    let line = line.strip_prefix('(').unwrap_or(line);
    line.strip_suffix(')').unwrap_or(line)
}

fn clean_field(field: &str) -> &str {
    field.trim().trim_matches(|c| c == '"' || c == '\'').trim()
}

fn split_keywords(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for kw in raw.split([',', '，', ';']) {
        let kw = kw.trim();
        if !kw.is_empty() && !out.iter().any(|k| k == kw) {
            out.push(kw.to_string());
        }
    }
    out
}

fn append_description(existing: &mut String, incoming: &str) {
    if incoming.is_empty() || existing.split(MERGE_SEPARATOR).any(|d| d == incoming) {
        return;
    }
    if !existing.is_empty() {
        existing.push_str(MERGE_SEPARATOR);
    }
    existing.push_str(incoming);
}

fn merge_entity(
    entities: &mut Vec<ParsedEntity>,
    index: &mut HashMap<String, usize>,
    entity: ParsedEntity,
) {
    match index.get(&entity.name) {
        Some(&i) => {
            let existing = &mut entities[i];
            if existing.entity_type == DEFAULT_ENTITY_TYPE {
                existing.entity_type = entity.entity_type;
            }
            append_description(&mut existing.description, &entity.description);
        }
        None => {
            index.insert(entity.name.clone(), entities.len());
            entities.push(entity);
        }
    }
}

fn merge_relation(
    relations: &mut Vec<ParsedRelation>,
    index: &mut HashMap<String, usize>,
    relation: ParsedRelation,
) {
    let key = relation.key();
    match index.get(&key) {
        Some(&i) => {
            let existing = &mut relations[i];
            for kw in relation.keywords {
                if !existing.keywords.contains(&kw) {
                    existing.keywords.push(kw);
                }
            }
            append_description(&mut existing.description, &relation.description);
        }
        None => {
            index.insert(key, relations.len());
            relations.push(relation);
        }
    }
}
