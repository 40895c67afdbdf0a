//! Runtime settings: built-in defaults, then an optional JSON file, then
//! environment variables.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::{Agent, DEFAULT_MODEL};
use crate::archive::{ArchiveError, RunArchive};
use crate::chat::ChatService;
use crate::gateway::{
    GatewayConfig, OllamaSampler, ProviderError, Sampler, SamplerGateway, TracingUsageSink,
    DEFAULT_NUM_CTX, DEFAULT_OLLAMA_URL,
};
use crate::pedal::{Pedal, PedalError, SamplingRanges};
use crate::session::context::TokenizerError;
use crate::session::{
    CharRatioEstimator, ContextBudget, JsonDirSessionBackend, SessionError, SessionStore,
    SqliteSessionBackend, TiktokenEstimator, TokenEstimator,
};
use crate::web::search::{BRAVE_API_URL, DUCKDUCKGO_HTML_URL};
use crate::web::{
    BraveSearch, DuckDuckGoSearch, FetchError, PageFetcher, SearchError, WebEnricher,
    WebSearchClient,
};

pub const CONFIG_ENV: &str = "TWISTEDPAIR_CONFIG";

pub const AVAILABLE_MODELS: [&str; 9] = [
    "deepseek-r1:8b",
    "dolphin3:latest",
    "gemma3:4b",
    "gpt-oss:20b",
    "llama3.1:8b",
    "mistral:latest",
    "openchat:latest",
    "phi3:14b",
    "qwen3:latest",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value for {name}: {value}")]
    Env { name: &'static str, value: String },
    #[error("invalid settings: {0}")]
    Invalid(String),
    #[error(transparent)]
    Pedal(#[from] PedalError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackendKind {
    #[default]
    Sqlite,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    #[default]
    CharRatio,
    Tiktoken,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Generation
    pub ollama_url: String,
    pub default_model: String,
    pub available_models: Vec<String>,
    pub num_ctx: u32,
    pub sampling: SamplingRanges,
    pub generation_timeout_secs: u64,
    pub max_retries: u32,
    pub ensemble_parallelism: usize,

    // Sessions
    pub session_dir: PathBuf,
    pub session_backend: SessionBackendKind,
    pub session_idle_timeout_secs: i64,
    pub context_max_tokens: usize,
    pub context_min_lines: usize,
    pub token_estimator: EstimatorKind,

    // Archive
    pub archive_dir: PathBuf,

    // Web
    pub brave_api_url: String,
    pub brave_api_key: Option<String>,
    pub duckduckgo_url: String,
    pub search_max_results: usize,
    pub search_timeout_secs: u64,
    pub fetch_max_chars_per_url: usize,
    pub fetch_timeout_secs: u64,
    /// Empty means the built-in pool.
    pub user_agents: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            available_models: AVAILABLE_MODELS.iter().map(|m| m.to_string()).collect(),
            num_ctx: DEFAULT_NUM_CTX,
            sampling: SamplingRanges::default(),
            generation_timeout_secs: 120,
            max_retries: 0,
            ensemble_parallelism: 1,
            session_dir: PathBuf::from("./sessions"),
            session_backend: SessionBackendKind::default(),
            session_idle_timeout_secs: crate::session::store::DEFAULT_IDLE_TIMEOUT_SECS,
            context_max_tokens: crate::session::context::DEFAULT_MAX_CONTEXT_TOKENS,
            context_min_lines: crate::session::context::DEFAULT_MIN_KEPT_LINES,
            token_estimator: EstimatorKind::default(),
            archive_dir: PathBuf::from("./runs"),
            brave_api_url: BRAVE_API_URL.to_string(),
            brave_api_key: None,
            duckduckgo_url: DUCKDUCKGO_HTML_URL.to_string(),
            search_max_results: crate::web::DEFAULT_MAX_RESULTS,
            search_timeout_secs: 10,
            fetch_max_chars_per_url: crate::web::DEFAULT_MAX_CHARS_PER_URL,
            fetch_timeout_secs: 15,
            user_agents: Vec::new(),
        }
    }
}

impl Settings {
    /// Defaults, overlaid by `path` (or `$TWISTEDPAIR_CONFIG`), overlaid by
    /// environment variables. The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut settings = match file {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        settings.apply_env(|name| std::env::var(name).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay values from `lookup` (normally the process environment).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("TWISTEDPAIR_OLLAMA_URL") {
            self.ollama_url = v;
        }
        if let Some(v) = get("TWISTEDPAIR_MODEL") {
            self.default_model = v;
        }
        if let Some(v) = get("TWISTEDPAIR_SESSION_DIR") {
            self.session_dir = PathBuf::from(v);
        }
        if let Some(v) = get("TWISTEDPAIR_ARCHIVE_DIR") {
            self.archive_dir = PathBuf::from(v);
        }
        if let Some(v) = get("TWISTEDPAIR_SESSION_BACKEND") {
            self.session_backend = match v.to_ascii_lowercase().as_str() {
                "sqlite" => SessionBackendKind::Sqlite,
                "json" => SessionBackendKind::Json,
                _ => {
                    return Err(ConfigError::Env {
                        name: "TWISTEDPAIR_SESSION_BACKEND",
                        value: v,
                    })
                }
            };
        }
        if let Some(v) = get("TWISTEDPAIR_NUM_CTX") {
            self.num_ctx = parse_env("TWISTEDPAIR_NUM_CTX", v)?;
        }
        if let Some(v) = get("TWISTEDPAIR_PARALLELISM") {
            self.ensemble_parallelism = parse_env("TWISTEDPAIR_PARALLELISM", v)?;
        }
        if let Some(v) = get("BRAVE_API_KEY") {
            self.brave_api_key = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sampling.validate()?;
        if self.ollama_url.trim().is_empty() {
            return Err(ConfigError::Invalid("ollama_url is empty".into()));
        }
        if self.default_model.trim().is_empty() {
            return Err(ConfigError::Invalid("default_model is empty".into()));
        }
        if self.session_idle_timeout_secs <= 0 {
            return Err(ConfigError::Invalid(
                "session_idle_timeout_secs must be positive".into(),
            ));
        }
        if self.context_max_tokens == 0 {
            return Err(ConfigError::Invalid("context_max_tokens must be positive".into()));
        }
        if self.context_min_lines == 0 {
            return Err(ConfigError::Invalid(
                "context_min_lines must keep at least the newest line".into(),
            ));
        }
        if self.ensemble_parallelism == 0 {
            return Err(ConfigError::Invalid(
                "ensemble_parallelism must be positive".into(),
            ));
        }
        Ok(())
    }

    // ---- component construction -------------------------------------------

    pub fn pedal(&self) -> Result<Pedal, ConfigError> {
        Ok(Pedal::new(self.sampling)?)
    }

    pub fn sampler(&self) -> Result<Arc<dyn Sampler>, ConfigError> {
        let ollama = OllamaSampler::with_config(
            &self.ollama_url,
            Duration::from_secs(self.generation_timeout_secs),
            self.num_ctx,
        )?;
        let gateway = SamplerGateway::with_config(
            ollama,
            Arc::new(TracingUsageSink),
            GatewayConfig {
                max_retries: self.max_retries,
                ..GatewayConfig::default()
            },
        );
        Ok(Arc::new(gateway))
    }

    /// Agent for `model`, or the default model.
    pub fn agent(&self, model: Option<&str>) -> Result<Agent, ConfigError> {
        let model = model.unwrap_or(&self.default_model);
        Ok(Agent::new("twistedpair", model, self.pedal()?, self.sampler()?)
            .with_parallelism(self.ensemble_parallelism))
    }

    pub fn session_store(&self) -> Result<SessionStore, ConfigError> {
        let idle = chrono::Duration::seconds(self.session_idle_timeout_secs);
        let store = match self.session_backend {
            SessionBackendKind::Sqlite => SessionStore::open(
                SqliteSessionBackend::open(self.session_dir.join("sessions.sqlite"))?,
                idle,
            )?,
            SessionBackendKind::Json => {
                SessionStore::open(JsonDirSessionBackend::open(&self.session_dir)?, idle)?
            }
        };
        Ok(store)
    }

    pub fn context_budget(&self) -> ContextBudget {
        ContextBudget {
            max_tokens: self.context_max_tokens,
            min_kept_lines: self.context_min_lines,
        }
    }

    pub fn token_estimator(&self) -> Result<Arc<dyn TokenEstimator>, ConfigError> {
        Ok(match self.token_estimator {
            EstimatorKind::CharRatio => Arc::new(CharRatioEstimator::default()),
            EstimatorKind::Tiktoken => Arc::new(TiktokenEstimator::cl100k()?),
        })
    }

    pub fn chat_service(&self) -> Result<ChatService, ConfigError> {
        Ok(
            ChatService::new(self.session_store()?, self.pedal()?, self.sampler()?)
                .with_budget(self.context_budget())
                .with_estimator(self.token_estimator()?),
        )
    }

    pub fn archive(&self) -> Result<RunArchive, ConfigError> {
        Ok(RunArchive::open(&self.archive_dir)?)
    }

    pub fn search_client(&self) -> Result<WebSearchClient, ConfigError> {
        let timeout = Duration::from_secs(self.search_timeout_secs);
        let brave = BraveSearch::with_config(&self.brave_api_url, self.brave_api_key.clone(), timeout)?;
        let ddg = DuckDuckGoSearch::with_config(&self.duckduckgo_url, timeout)?;
        Ok(WebSearchClient::new(Arc::new(brave), Arc::new(ddg)))
    }

    pub fn page_fetcher(&self) -> Result<PageFetcher, ConfigError> {
        Ok(PageFetcher::with_config(
            Duration::from_secs(self.fetch_timeout_secs),
            self.user_agents.clone(),
        )?)
    }

    pub fn web_enricher(&self) -> Result<WebEnricher, ConfigError> {
        Ok(WebEnricher::new(self.search_client()?, self.page_fetcher()?)
            .with_max_results(self.search_max_results)
            .with_max_chars_per_url(self.fetch_max_chars_per_url))
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { name, value })
}
