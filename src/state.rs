use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::answer::AnswerAssembler;
use crate::docs::ingest::{FsExportSink, JsonBlockSource};
use crate::docs::DocumentStore;
use crate::error::ConfigError;
use crate::llm::{parse_var, LlmClient};
use crate::matcher::keywords::KeywordExtractor;
use crate::matcher::{MatchEngine, MatchOptions};
use crate::orchestrator::QuestionOrchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Keyword,
    Embedding,
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "keyword" => Ok(Self::Keyword),
            "embedding" => Ok(Self::Embedding),
            other => Err(format!("expected 'keyword' or 'embedding', got '{}'", other)),
        }
    }
}

/// Retrieval and answering tunables.
#[derive(Debug, Clone)]
pub struct QaConfig {
    /// `None` keeps every scoring block.
    pub top_n: Option<usize>,
    pub include_neighbors: bool,
    pub max_references: usize,
    pub strategy: StrategyKind,
    pub similarity_threshold: f32,
    pub stopwords_path: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub export_dir: PathBuf,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            top_n: Some(8),
            include_neighbors: true,
            max_references: 3,
            strategy: StrategyKind::Keyword,
            similarity_threshold: 0.3,
            stopwords_path: None,
            data_dir: PathBuf::from("./data/docs"),
            export_dir: PathBuf::from("./data/exports"),
        }
    }
}

impl QaConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let top_n: usize = parse_var("QA_TOP_N", 8)?;
        let similarity_threshold: f32 = parse_var("QA_SIMILARITY_THRESHOLD", 0.3)?;
        if !(-1.0..=1.0).contains(&similarity_threshold) {
            return Err(ConfigError::Invalid {
                var: "QA_SIMILARITY_THRESHOLD",
                value: similarity_threshold.to_string(),
                reason: "cosine cutoff must be within [-1, 1]".to_string(),
            });
        }

        Ok(Self {
            top_n: (top_n > 0).then_some(top_n),
            include_neighbors: parse_var("QA_INCLUDE_NEIGHBORS", true)?,
            max_references: parse_var("QA_MAX_REFERENCES", 3)?,
            strategy: parse_var("QA_STRATEGY", StrategyKind::Keyword)?,
            similarity_threshold,
            stopwords_path: dotenv::var("QA_STOPWORDS_PATH")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            data_dir: dotenv::var("QA_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            export_dir: dotenv::var("QA_EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.export_dir),
        })
    }

    pub fn match_options(&self) -> MatchOptions {
        MatchOptions {
            top_n: self.top_n,
            include_neighbors: self.include_neighbors,
        }
    }
}

/// Long-lived components, built once at startup.
pub struct AppState {
    pub config: QaConfig,
    pub llm: Arc<LlmClient>,
    pub orchestrator: QuestionOrchestrator,
}

impl AppState {
    pub async fn init(config: QaConfig, llm: LlmClient) -> anyhow::Result<Self> {
        let llm = Arc::new(llm);

        let keywords = Arc::new(KeywordExtractor::load(config.stopwords_path.as_deref())?);

        let store = Arc::new(
            DocumentStore::new(&config.data_dir)
                .await
                .with_context(|| format!("Failed to open document store at {:?}", config.data_dir))?,
        );
        info!("Document store initialized at {:?}", config.data_dir);

        let mut matcher = MatchEngine::new(keywords)
            .with_export(Arc::new(FsExportSink::new(config.export_dir.clone())));
        if config.strategy == StrategyKind::Embedding {
            matcher = matcher.with_embedder(llm.clone(), config.similarity_threshold);
        }
        info!(strategy = ?matcher.strategy(), "Match engine ready");

        let assembler = AnswerAssembler::new(llm.clone(), config.max_references.max(1));
        let orchestrator = QuestionOrchestrator::new(
            store,
            Arc::new(JsonBlockSource::new(llm.http())),
            Arc::new(matcher),
            Arc::new(assembler),
            config.match_options(),
        );

        Ok(Self {
            config,
            llm,
            orchestrator,
        })
    }
}
