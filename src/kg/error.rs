//! Error taxonomy for the pipeline.

/// Errors surfaced by the knowledge-graph pipeline.
///
/// Variants follow the failure scopes the schedulers distinguish: store
/// connectivity is reported to the caller and leaves work untouched, while
/// provider and upsert failures are recorded on the chunk being processed.
#[derive(Debug, thiserror::Error)]
pub enum KgError {
    /// The store rejected a statement or could not be reached.
    #[error("Store error: {0}")]
    Store(#[from] surrealdb::Error),

    /// Transport failure talking to a model or embedding provider.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The model or embedding provider returned an error or unusable output.
    #[error("Provider error: {0}")]
    Provider(String),

    /// A batch of merge statements failed.
    #[error("Upsert error: {0}")]
    Upsert(String),

    /// Caller supplied an unusable parameter.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl KgError {
    /// Whether the error means the store itself is unavailable.
    pub fn is_connectivity(&self) -> bool {
        match self {
            Self::Store(surrealdb::Error::Api(api)) => {
                matches!(api, surrealdb::error::Api::ConnectionUninitialised)
                    || api.to_string().to_lowercase().contains("connection")
            }
            _ => false,
        }
    }
}

pub type Result<T, E = KgError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_is_not_connectivity() {
        let err = KgError::Provider("rate limited".to_string());
        assert!(!err.is_connectivity());
        assert_eq!(err.to_string(), "Provider error: rate limited");
    }
}
