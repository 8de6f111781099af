use serde::{Deserialize, Serialize};

/// Pipeline events delivered to subscribers of the event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum KgEvent {
    TaskProgress {
        task_id: String,
        kb_id: String,
        chunks_total: u32,
        chunks_completed: u32,
        chunks_failed: u32,
    },
    TaskCompleted {
        task_id: String,
        kb_id: String,
    },
    TaskFailed {
        task_id: String,
        kb_id: String,
        chunks_failed: u32,
        error: Option<String>,
    },

    BuildProgress {
        task_id: String,
        kb_id: String,
        chunks_total: u32,
        chunks_completed: u32,
        chunks_failed: u32,
        entities_total: u64,
        relations_total: u64,
    },
    BuildCompleted {
        task_id: String,
        kb_id: String,
        entities_total: u64,
        relations_total: u64,
    },
    BuildFailed {
        task_id: String,
        kb_id: String,
        chunks_failed: u32,
        error: Option<String>,
    },

    EmbeddingProgress {
        namespace: String,
        database: String,
        table_base: String,
        embedded: usize,
    },
    IndexRebuilt {
        namespace: String,
        database: String,
        table_base: String,
        dimensions: usize,
    },
}

impl KgEvent {
    /// Task id the event refers to, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskProgress { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::BuildProgress { task_id, .. }
            | Self::BuildCompleted { task_id, .. }
            | Self::BuildFailed { task_id, .. } => Some(task_id),
            Self::EmbeddingProgress { .. } | Self::IndexRebuilt { .. } => None,
        }
    }

    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskProgress { .. } => "task-progress",
            Self::TaskCompleted { .. } => "task-completed",
            Self::TaskFailed { .. } => "task-failed",
            Self::BuildProgress { .. } => "build-progress",
            Self::BuildCompleted { .. } => "build-completed",
            Self::BuildFailed { .. } => "build-failed",
            Self::EmbeddingProgress { .. } => "embedding-progress",
            Self::IndexRebuilt { .. } => "index-rebuilt",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_tagged() {
        let event = KgEvent::TaskCompleted {
            task_id: "t1".to_string(),
            kb_id: "kb".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "TaskCompleted");
        assert_eq!(json["data"]["task_id"], "t1");
        assert_eq!(event.name(), "task-completed");
        assert_eq!(event.task_id(), Some("t1"));
    }
}
