//! Graph Domain Models
//!
//! Entity and relation records produced by the response parser, addressed
//! purely by deterministic string keys. Nothing here holds references to
//! other records; the graph lives in the store.

use serde::{Deserialize, Serialize};

/// Entity type used when the extraction leaves the type out.
pub const DEFAULT_ENTITY_TYPE: &str = "Other";

// =============================================================================
// Entity
// =============================================================================

/// An entity parsed from one chunk's extraction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedEntity {
    /// Sanitized name; doubles as the record key.
    pub name: String,
    pub entity_type: String,
    pub description: String,
}

// =============================================================================
// Relation
// =============================================================================

/// A relation parsed from one chunk's extraction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedRelation {
    /// Sanitized source entity name.
    pub source: String,
    /// Sanitized target entity name.
    pub target: String,
    pub keywords: Vec<String>,
    pub description: String,
}

impl ParsedRelation {
    /// Deterministic edge key, independent of endpoint order.
    pub fn key(&self) -> String {
        crate::kg::graph::keys::relation_key(&self.source, &self.target)
    }
}

// =============================================================================
// Extraction Result
// =============================================================================

/// Result of parsing one chunk's raw extraction text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub entities: Vec<ParsedEntity>,
    pub relations: Vec<ParsedRelation>,
    /// Whether the completion marker was seen.
    pub completed: bool,
}

impl ExtractionResult {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty()
    }
}

// =============================================================================
// Stored rows read back by the schedulers
// =============================================================================

/// An entity whose embedding is missing or stale.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StaleEntity {
    pub entity_name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl StaleEntity {
    /// Text handed to the embedding provider.
    pub fn embedding_text(&self) -> String {
        match self.description.as_deref() {
            Some(desc) if !desc.is_empty() => format!("{}: {}", self.entity_name, desc),
            _ => self.entity_name.clone(),
        }
    }

    /// Content hash the stored embedding is stamped with.
    pub fn content_hash(&self) -> String {
        crate::kg::graph::keys::content_hash(self.description.as_deref().unwrap_or_default())
    }
}

/// Counts of what one upsert call merged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub entities: u64,
    pub relations: u64,
}
