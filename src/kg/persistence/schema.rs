//! Schema provisioning.
//!
//! Graph tables are derived from a knowledge base's table base `B`:
//! `B_entity`, `B_relation`, `B_entity_chunk` and `B_relation_chunk`. All
//! definitions use `IF NOT EXISTS`, so provisioning never alters an existing
//! structure and is safe to repeat.

use std::collections::HashSet;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::KgStore;
use crate::kg::domain::GraphTarget;
use crate::kg::error::{KgError, Result};

/// Table names derived from one table base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphTables {
    pub entity: String,
    pub relation: String,
    pub entity_chunk: String,
    pub relation_chunk: String,
}

impl GraphTables {
    /// Derive the four table names; the base must be non-empty `[A-Za-z0-9_]`.
    pub fn new(table_base: &str) -> Result<Self> {
        if table_base.is_empty()
            || !table_base
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(KgError::InvalidInput(format!(
                "graph table base must match [A-Za-z0-9_]+, got {table_base:?}"
            )));
        }
        Ok(Self {
            entity: format!("{table_base}_entity"),
            relation: format!("{table_base}_relation"),
            entity_chunk: format!("{table_base}_entity_chunk"),
            relation_chunk: format!("{table_base}_relation_chunk"),
        })
    }

    /// Name of the vector index over entity embeddings.
    pub fn vector_index(&self) -> String {
        format!("{}_embedding_idx", self.entity)
    }

    /// DDL creating all four tables with their fields and indexes.
    pub fn definitions(&self) -> String {
        let Self {
            entity: e,
            relation: r,
            entity_chunk: ec,
            relation_chunk: rc,
        } = self;
        format!(
            r"
DEFINE TABLE IF NOT EXISTS {e} TYPE NORMAL SCHEMALESS;
DEFINE FIELD IF NOT EXISTS entity_name ON {e} TYPE string;
DEFINE FIELD IF NOT EXISTS entity_type ON {e} TYPE string DEFAULT 'Other';
DEFINE FIELD IF NOT EXISTS description ON {e} TYPE string DEFAULT '';
DEFINE FIELD IF NOT EXISTS source_chunk_ids ON {e} TYPE array<string> DEFAULT [];
DEFINE FIELD IF NOT EXISTS file_keys ON {e} TYPE array<string> DEFAULT [];
DEFINE FIELD IF NOT EXISTS embedding ON {e} TYPE option<array<float>>;
DEFINE FIELD IF NOT EXISTS embedding_hash ON {e} TYPE option<string>;
DEFINE INDEX IF NOT EXISTS {e}_name_idx ON {e} FIELDS entity_name UNIQUE;
DEFINE INDEX IF NOT EXISTS {e}_hash_idx ON {e} FIELDS embedding_hash;

DEFINE TABLE IF NOT EXISTS {r} TYPE RELATION IN {e} OUT {e} SCHEMALESS;
DEFINE FIELD IF NOT EXISTS relation_key ON {r} TYPE string;
DEFINE FIELD IF NOT EXISTS keywords ON {r} TYPE array<string> DEFAULT [];
DEFINE FIELD IF NOT EXISTS description ON {r} TYPE string DEFAULT '';
DEFINE FIELD IF NOT EXISTS weight ON {r} TYPE number DEFAULT 0;
DEFINE FIELD IF NOT EXISTS source_chunk_ids ON {r} TYPE array<string> DEFAULT [];
DEFINE FIELD IF NOT EXISTS file_keys ON {r} TYPE array<string> DEFAULT [];
DEFINE INDEX IF NOT EXISTS {r}_key_idx ON {r} FIELDS relation_key UNIQUE;

DEFINE TABLE IF NOT EXISTS {ec} TYPE NORMAL SCHEMALESS;
DEFINE FIELD IF NOT EXISTS entity ON {ec} TYPE record<{e}>;
DEFINE FIELD IF NOT EXISTS chunk_ids ON {ec} TYPE array<string> DEFAULT [];

DEFINE TABLE IF NOT EXISTS {rc} TYPE NORMAL SCHEMALESS;
DEFINE FIELD IF NOT EXISTS relation ON {rc} TYPE record<{r}>;
DEFINE FIELD IF NOT EXISTS chunk_ids ON {rc} TYPE array<string> DEFAULT [];
"
        )
    }
}

/// Provisions graph schemas, at most once per target per process.
#[derive(Debug)]
pub struct SchemaProvisioner {
    store: KgStore,
    provisioned: Mutex<HashSet<GraphTarget>>,
}

impl SchemaProvisioner {
    pub fn new(store: KgStore) -> Self {
        Self {
            store,
            provisioned: Mutex::new(HashSet::new()),
        }
    }

    /// Create the graph tables for `target` unless this process already did.
    ///
    /// Returns `true` when DDL was issued.
    pub async fn ensure(&self, target: &GraphTarget) -> Result<bool> {
        let tables = GraphTables::new(&target.table_base)?;

        // Held across the DDL so concurrent first callers issue it once.
        let mut provisioned = self.provisioned.lock().await;
        if provisioned.contains(target) {
            return Ok(false);
        }

        let ddl = tables.definitions();
        self.store
            .within(&target.db_target(), |db| async move {
                db.query(ddl).await?.check()?;
                Ok(())
            })
            .await?;

        provisioned.insert(target.clone());
        info!(
            namespace = %target.namespace,
            database = %target.database,
            table_base = %target.table_base,
            "Provisioned graph schema"
        );
        Ok(true)
    }

    /// Drop the in-memory record for `target` so the next call re-issues DDL.
    pub async fn forget(&self, target: &GraphTarget) {
        self.provisioned.lock().await.remove(target);
    }
}

/// Define the vector index over entity embeddings, then rebuild it.
///
/// Called by the indexing phase once the embedding dimension is known.
pub async fn refresh_vector_index(
    store: &KgStore,
    target: &GraphTarget,
    dimensions: usize,
) -> Result<()> {
    let tables = GraphTables::new(&target.table_base)?;
    let index = tables.vector_index();
    let entity = tables.entity;
    let sql = format!(
        "DEFINE INDEX IF NOT EXISTS {index} ON {entity} FIELDS embedding HNSW DIMENSION {dimensions} DIST COSINE;
         REBUILD INDEX IF EXISTS {index} ON {entity};"
    );
    store
        .within(&target.db_target(), |db| async move {
            db.query(sql).await?.check()?;
            Ok(())
        })
        .await?;
    debug!(index = %index, dimensions, "Vector index refreshed");
    Ok(())
}

/// Bookkeeping tables in the home database.
pub(crate) async fn ensure_home_schema(store: &KgStore) -> Result<()> {
    let mut ddl = String::new();
    for table in ["kg_task", "kg_build_task"] {
        ddl.push_str(&format!(
            "DEFINE TABLE IF NOT EXISTS {table} TYPE NORMAL SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS {table}_status_idx ON {table} FIELDS status;
             DEFINE INDEX IF NOT EXISTS {table}_file_idx ON {table} FIELDS kb_id, file_key;\n"
        ));
    }
    for table in ["kg_chunk", "kg_build_chunk"] {
        ddl.push_str(&format!(
            "DEFINE TABLE IF NOT EXISTS {table} TYPE NORMAL SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS {table}_status_idx ON {table} FIELDS status;
             DEFINE INDEX IF NOT EXISTS {table}_task_idx ON {table} FIELDS task_id;\n"
        ));
    }
    store
        .home(|db| async move {
            db.query(ddl).await?.check()?;
            Ok(())
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names() {
        let tables = GraphTables::new("kb1").unwrap();
        assert_eq!(tables.entity, "kb1_entity");
        assert_eq!(tables.relation, "kb1_relation");
        assert_eq!(tables.entity_chunk, "kb1_entity_chunk");
        assert_eq!(tables.relation_chunk, "kb1_relation_chunk");
    }

    #[test]
    fn test_rejects_injection_in_base() {
        assert!(GraphTables::new("kb; REMOVE TABLE x").is_err());
        assert!(GraphTables::new("").is_err());
        assert!(GraphTables::new("kb-1").is_err());
    }

    #[tokio::test]
    async fn test_provisioning_is_once_per_target() {
        let store = KgStore::memory("kg", "system").await.unwrap();
        let provisioner = SchemaProvisioner::new(store.clone());
        let target = GraphTarget {
            namespace: "kb".to_string(),
            database: "kb".to_string(),
            table_base: "docs".to_string(),
        };

        assert!(provisioner.ensure(&target).await.unwrap());
        assert!(!provisioner.ensure(&target).await.unwrap());

        // Re-issuing the DDL against existing tables is harmless.
        provisioner.forget(&target).await;
        assert!(provisioner.ensure(&target).await.unwrap());
    }
}
