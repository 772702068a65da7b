use thiserror::Error;

/// Startup-time configuration failures. Never raised while answering questions.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error(
        "LLM_API_KEY is not set and {base_url} is not a loopback endpoint; \
         set LLM_API_KEY in your .env"
    )]
    MissingCredentials { base_url: String },

    #[error("failed to load keyword resource {path}: {source}")]
    Resource {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Failure of a single generator call.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    /// 401/403 from the generator. Fatal, never retried.
    #[error(
        "generator rejected the request (HTTP {status}); verify LLM_API_KEY in your .env \
         and confirm the key has access to the '{model}' model"
    )]
    Unauthorized { status: u16, model: String },

    /// Anything else: timeouts, 5xx, undecodable bodies.
    #[error("{0}")]
    Transient(String),
}

impl GenerationError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, GenerationError::Unauthorized { .. })
    }
}

/// Batch-level failure returned by the orchestrator.
#[derive(Debug, Error)]
pub enum QaError {
    #[error("generator rejected credentials (HTTP {status}); verify LLM_API_KEY and access to model '{model}'")]
    Unauthorized { status: u16, model: String },

    #[error("failed to ingest document '{document}': {reason}")]
    Ingest { document: String, reason: String },
}
