use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.yaml";

/// Default embedding model (384 dimensions, normalized output)
const DEFAULT_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2";
const DEFAULT_CHUNK_SIZE: usize = 2500;
const DEFAULT_CHUNK_OVERLAP: usize = 300;
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const DEFAULT_TOP_K: usize = 5;

const DEFAULT_MAX_STEPS: usize = 5;
const DEFAULT_OBSERVATION_BUDGET: usize = 3000;

/// Retrieval engine settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Directory scanned recursively for .html/.htm/.pdf sources.
    /// Relative paths resolve against the base directory.
    #[serde(default = "default_source_dir")]
    pub source_dir: String,

    /// Serialized document list
    #[serde(default = "default_documents_file")]
    pub documents_file: String,

    /// Serialized vectors
    #[serde(default = "default_vectors_file")]
    pub vectors_file: String,

    /// Window size in characters
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Characters shared between consecutive windows
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Embedding model name (e.g., "all-MiniLM-L6-v2")
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    /// Results per search
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            source_dir: default_source_dir(),
            documents_file: default_documents_file(),
            vectors_file: default_vectors_file(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            top_k: DEFAULT_TOP_K,
        }
    }
}

fn default_source_dir() -> String {
    "docs".to_string()
}

fn default_documents_file() -> String {
    "documents.json".to_string()
}

fn default_vectors_file() -> String {
    "vectors.bin".to_string()
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_chunk_overlap() -> usize {
    DEFAULT_CHUNK_OVERLAP
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// Any OpenAI-compatible chat completions endpoint
    #[default]
    OpenAi,
    /// Azure OpenAI deployment
    Azure,
}

/// Language model settings. The API key itself is read from the
/// environment variable named by `api_key_env`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,

    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Model name, or deployment name for Azure
    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Azure `api-version` query parameter
    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key_env: default_api_key_env(),
            api_version: default_api_version(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_api_version() -> String {
    "2024-06-01".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_llm_timeout_secs() -> u64 {
    120
}

/// A console entry point the navigation stage can choose.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Portal {
    pub name: String,
    pub base_url: String,
    /// Lowercase routing keywords; longer matches weigh more
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Web console settings. Credentials come from the environment variables
/// named by `email_env` / `password_env`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsoleConfig {
    #[serde(default = "default_portals")]
    pub portals: Vec<Portal>,

    #[serde(default = "default_portal")]
    pub default_portal: String,

    #[serde(default = "default_path")]
    pub default_path: String,

    #[serde(default = "default_email_env")]
    pub email_env: String,

    #[serde(default = "default_password_env")]
    pub password_env: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            portals: default_portals(),
            default_portal: default_portal(),
            default_path: default_path(),
            email_env: default_email_env(),
            password_env: default_password_env(),
        }
    }
}

impl ConsoleConfig {
    pub fn portal(&self, name: &str) -> Option<&Portal> {
        self.portals.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

fn keywords(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

fn default_portals() -> Vec<Portal> {
    vec![
        Portal {
            name: "console".to_string(),
            base_url: "https://console.example.com/".to_string(),
            keywords: keywords(&[
                "admin", "console", "policy", "policies", "gateway", "replica", "config",
                "configuration", "administrator", "rate limit", "관리", "콘솔", "설정", "정책",
                "게이트웨이", "관리자",
            ]),
        },
        Portal {
            name: "developers".to_string(),
            base_url: "https://developers.example.com/".to_string(),
            keywords: keywords(&[
                "developer", "dev", "docs", "documentation", "guide", "portal", "tutorial",
                "development", "개발자", "문서", "가이드", "사용법", "튜토리얼",
            ]),
        },
        Portal {
            name: "tenant".to_string(),
            base_url: "https://tenant.example.com/".to_string(),
            keywords: keywords(&[
                "user", "tenant", "account", "member", "permission", "role", "사용자",
                "테넌트", "계정", "멤버", "권한", "역할",
            ]),
        },
    ]
}

fn default_portal() -> String {
    "console".to_string()
}

fn default_path() -> String {
    "/gateway".to_string()
}

fn default_email_env() -> String {
    "QUERYBOT_CONSOLE_EMAIL".to_string()
}

fn default_password_env() -> String {
    "QUERYBOT_CONSOLE_PASSWORD".to_string()
}

/// Interaction loop and browser settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Upper bound on observe/decide/act iterations
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Character budget of a page observation
    #[serde(default = "default_observation_budget")]
    pub observation_budget: usize,

    /// Element wait timeout for clicks and form fills
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,

    /// Page navigation timeout
    #[serde(default = "default_navigation_timeout_secs")]
    pub navigation_timeout_secs: u64,

    /// Quiet period after every action before observing again
    #[serde(default = "default_settle_millis")]
    pub settle_millis: u64,

    /// Chromium binary; falls back to `CHROME_PATH`, then auto-detection
    #[serde(default)]
    pub chrome_path: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            observation_budget: DEFAULT_OBSERVATION_BUDGET,
            action_timeout_secs: default_action_timeout_secs(),
            navigation_timeout_secs: default_navigation_timeout_secs(),
            settle_millis: default_settle_millis(),
            chrome_path: None,
        }
    }
}

fn default_max_steps() -> usize {
    DEFAULT_MAX_STEPS
}

fn default_observation_budget() -> usize {
    DEFAULT_OBSERVATION_BUDGET
}

fn default_action_timeout_secs() -> u64 {
    10
}

fn default_navigation_timeout_secs() -> u64 {
    60
}

fn default_settle_millis() -> u64 {
    1500
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8001".to_string()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub console: ConsoleConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

/// `QUERYBOT_BASE_PATH`, or `~/.local/share/querybot`.
pub fn base_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("QUERYBOT_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }

    let home = homedir::my_home()
        .context("could not determine home directory")?
        .context("home directory path is empty")?;
    Ok(home.join(".local/share/querybot"))
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        let retrieval = &self.retrieval;
        if retrieval.chunk_size == 0 {
            bail!("retrieval.chunk_size must be greater than 0");
        }
        if retrieval.chunk_overlap >= retrieval.chunk_size {
            bail!(
                "retrieval.chunk_overlap ({}) must be smaller than retrieval.chunk_size ({})",
                retrieval.chunk_overlap,
                retrieval.chunk_size
            );
        }
        if retrieval.top_k == 0 {
            bail!("retrieval.top_k must be greater than 0");
        }
        if retrieval.download_timeout_secs == 0 {
            bail!("retrieval.download_timeout_secs must be greater than 0");
        }

        if !(0.0..=2.0).contains(&self.llm.temperature) {
            bail!(
                "llm.temperature must be between 0.0 and 2.0, got {}",
                self.llm.temperature
            );
        }
        if self.llm.timeout_secs == 0 {
            bail!("llm.timeout_secs must be greater than 0");
        }

        if self.console.portals.is_empty() {
            bail!("console.portals must not be empty");
        }
        if self.console.portal(&self.console.default_portal).is_none() {
            bail!(
                "console.default_portal '{}' is not one of the configured portals",
                self.console.default_portal
            );
        }
        for portal in &self.console.portals {
            url::Url::parse(&portal.base_url).with_context(|| {
                format!("console portal '{}' has an invalid base_url", portal.name)
            })?;
        }

        let agent = &self.agent;
        if agent.max_steps == 0 {
            bail!("agent.max_steps must be at least 1");
        }
        if agent.observation_budget == 0 {
            bail!("agent.observation_budget must be greater than 0");
        }
        if agent.action_timeout_secs == 0 || agent.navigation_timeout_secs == 0 {
            bail!("agent timeouts must be greater than 0");
        }

        Ok(())
    }

    pub fn load() -> anyhow::Result<Self> {
        Self::load_with(&base_path()?)
    }

    /// Read `config.yaml` under `base_path`, creating it with defaults if
    /// missing and re-saving it when new fields were filled in.
    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;

        let path = base_path.join(CONFIG_FILE);
        if !path.exists() {
            write_atomic(&path, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_str = serde_yml::to_string(&self)?;
        write_atomic(&self.base_path.join(CONFIG_FILE), config_str.as_bytes())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = PathBuf::from(path);
        if path.is_absolute() {
            path
        } else {
            self.base_path.join(path)
        }
    }

    pub fn source_dir(&self) -> PathBuf {
        self.resolve(&self.retrieval.source_dir)
    }

    pub fn documents_path(&self) -> PathBuf {
        self.resolve(&self.retrieval.documents_file)
    }

    pub fn vectors_path(&self) -> PathBuf {
        self.resolve(&self.retrieval.vectors_file)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let temp_path = path.with_extension("yaml.tmp");
    std::fs::write(&temp_path, data)
        .with_context(|| format!("failed to write {}", temp_path.display()))?;
    std::fs::rename(&temp_path, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
