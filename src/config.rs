use crate::llm::{LlmProtocol, LlmSettings, Provider};
use clap::Parser;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::env;
use std::path::Path;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// SurrealDB connection string (`mem://`, `surrealkv://path`, `ws://host:port`)
    #[arg(long, env = "STORE_URL")]
    pub store_url: Option<String>,

    /// Chunks claimed per extraction cycle
    #[arg(long, env = "KG_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Fail stuck chunks and drop finished tasks at startup
    #[arg(long, env = "HOUSEKEEPING_ON_START")]
    pub housekeeping_on_start: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub extraction: ExtractionConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub url: String,
    /// Home namespace holding the bookkeeping tables.
    pub namespace: String,
    /// Home database holding the bookkeeping tables.
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    pub extraction_poll_ms: u64,
    pub build_poll_ms: u64,
    pub embedding_poll_ms: u64,
    pub concurrency: usize,
    pub upsert_batch_size: usize,
    pub embedding_batch_size: usize,
    pub housekeeping_on_start: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    pub language: String,
    pub entity_types: Vec<String>,
    pub max_gleaning: usize,
    pub use_examples: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `fastembed` or `openai`.
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub request_timeout_secs: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            language: "English".to_string(),
            entity_types: ["organization", "person", "geo", "event", "category"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            max_gleaning: 1,
            use_examples: true,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder();

        // 1. Defaults
        builder = builder
            .set_default("server.port", 3000)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("store.url", "mem://")?
            .set_default("store.namespace", "kg")?
            .set_default("store.database", "system")?
            .set_default("scheduler.extraction_poll_ms", 2000)?
            .set_default("scheduler.build_poll_ms", 2000)?
            .set_default("scheduler.embedding_poll_ms", 5000)?
            .set_default("scheduler.concurrency", 1)?
            .set_default("scheduler.upsert_batch_size", 30)?
            .set_default("scheduler.embedding_batch_size", 32)?
            .set_default("scheduler.housekeeping_on_start", false)?
            .set_default("extraction.language", "English")?
            .set_default(
                "extraction.entity_types",
                ExtractionConfig::default().entity_types,
            )?
            .set_default("extraction.max_gleaning", 1)?
            .set_default("extraction.use_examples", true)?
            .set_default("embedding.provider", "fastembed")?
            .set_default("embedding.model", "BAAI/bge-small-en-v1.5")?
            .set_default("embedding.dimensions", 384)?
            .set_default("llm.request_timeout_secs", 120)?;

        // 2. Config file: explicit path, else ./config.yaml when present
        if let Some(path) = cli.config.as_deref() {
            builder = builder.add_source(File::new(path, FileFormat::Yaml).required(true));
        } else if Path::new("config.yaml").exists() {
            builder = builder.add_source(File::new("config.yaml", FileFormat::Yaml).required(false));
        }

        // 3. Environment variables prefixed with KG_, e.g. KG_STORE__URL=ws://localhost:8000
        builder = builder.add_source(
            Environment::with_prefix("KG")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("extraction.entity_types")
                .try_parsing(true),
        );

        // 4. CLI flags (and their clap env aliases) win over everything
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(url) = cli.store_url {
            builder = builder.set_override("store.url", url)?;
        }
        if let Some(n) = cli.concurrency {
            builder = builder.set_override("scheduler.concurrency", n as u64)?;
        }
        if let Some(hk) = cli.housekeeping_on_start {
            builder = builder.set_override("scheduler.housekeeping_on_start", hk)?;
        }

        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.scheduler.concurrency == 0 {
            return Err(config::ConfigError::Message(
                "scheduler.concurrency must be at least 1".to_string(),
            ));
        }
        if self.scheduler.upsert_batch_size == 0 || self.scheduler.embedding_batch_size == 0 {
            return Err(config::ConfigError::Message(
                "scheduler batch sizes must be at least 1".to_string(),
            ));
        }
        match self.embedding.provider.as_str() {
            "fastembed" | "openai" => Ok(()),
            other => Err(config::ConfigError::Message(format!(
                "unknown embedding.provider: {other}"
            ))),
        }
    }
}

pub fn load_llm_settings() -> Result<LlmSettings, String> {
    let base_url = std::env::var("LLM_BASE_URL")
        .map_err(|_| "Missing required env var: LLM_BASE_URL".to_string())?;
    if base_url.trim().is_empty() {
        return Err("LLM_BASE_URL cannot be empty".to_string());
    }

    let model = std::env::var("LLM_MODEL")
        .map_err(|_| "Missing required env var: LLM_MODEL".to_string())?;
    if model.trim().is_empty() {
        return Err("LLM_MODEL cannot be empty".to_string());
    }

    let api_key = std::env::var("LLM_API_KEY")
        .ok()
        .filter(|s| !s.trim().is_empty());

    let protocol = match std::env::var("LLM_PROTOCOL")
        .unwrap_or_else(|_| "auto".to_string())
        .to_lowercase()
        .as_str()
    {
        "responses" => LlmProtocol::Responses,
        "chat" => LlmProtocol::Chat,
        _ => LlmProtocol::Auto,
    };

    let mut provider = Provider::detect_from_url(&base_url);

    let deployment_name = env::var("AZURE_DEPLOYMENT_NAME").ok();
    let api_version = env::var("AZURE_API_VERSION").ok();

    if let (Provider::AzureOpenAI { .. }, Some(deployment)) = (&provider, &deployment_name) {
        provider = Provider::AzureOpenAI {
            deployment_name: deployment.clone(),
            api_version: api_version
                .clone()
                .unwrap_or_else(|| "2024-08-01-preview".to_string()),
        };
    }

    Ok(LlmSettings {
        base_url,
        api_key,
        model,
        protocol,
        provider,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_args() {
        let cfg = AppConfig::load_from_args(["kg-builder"]).unwrap();
        assert_eq!(cfg.store.namespace, "kg");
        assert_eq!(cfg.store.database, "system");
        assert_eq!(cfg.scheduler.upsert_batch_size, 30);
        assert_eq!(cfg.extraction.entity_types.len(), 5);
    }

    #[test]
    fn test_cli_overrides() {
        let cfg = AppConfig::load_from_args([
            "kg-builder",
            "--port",
            "8088",
            "--store-url",
            "surrealkv://data/kg",
            "--concurrency",
            "4",
        ])
        .unwrap();
        assert_eq!(cfg.server.port, 8088);
        assert_eq!(cfg.store.url, "surrealkv://data/kg");
        assert_eq!(cfg.scheduler.concurrency, 4);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = AppConfig::load_from_args(["kg-builder", "--concurrency", "0"]).unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }
}
