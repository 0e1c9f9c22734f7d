use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Session store
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_max_db_connections")]
    pub max_db_connections: usize,
    /// Identifies this worker process on the sessions it owns.
    #[serde(default = "default_server_id")]
    pub server_id: String,

    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_llm_temperature")]
    pub llm_temperature: f32,
    #[serde(default = "default_llm_max_tokens")]
    pub llm_max_tokens: u32,

    // Response loop ceilings
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    // Liveness and recovery
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_stale_session_secs")]
    pub stale_session_secs: u64,
    #[serde(default = "default_recovery_sweep_interval_secs")]
    pub recovery_sweep_interval_secs: u64,

    // Tools
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

fn default_database_path() -> String {
    "persona_sessions.db".to_string()
}

fn default_max_db_connections() -> usize {
    4
}

fn default_server_id() -> String {
    env::var("PERSONA_SERVER_ID")
        .ok()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()))
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_llm_temperature() -> f32 {
    0.7
}

fn default_llm_max_tokens() -> u32 {
    2048
}

fn default_max_iterations() -> usize {
    20
}

fn default_max_messages() -> usize {
    5
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

fn default_stale_session_secs() -> u64 {
    60
}

fn default_recovery_sweep_interval_secs() -> u64 {
    30
}

fn default_fetch_timeout_secs() -> u64 {
    20
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            max_db_connections: default_max_db_connections(),
            server_id: default_server_id(),
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            llm_temperature: default_llm_temperature(),
            llm_max_tokens: default_llm_max_tokens(),
            max_iterations: default_max_iterations(),
            max_messages: default_max_messages(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            stale_session_secs: default_stale_session_secs(),
            recovery_sweep_interval_secs: default_recovery_sweep_interval_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

impl AgentConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("persona_agent.toml")
    }

    /// Load config from persona_agent.toml (next to executable), falling back
    /// to defaults + env vars.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match Self::from_toml_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {:#}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str::<AgentConfig>(contents).context("Invalid persona agent config")
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Defaults with environment variable overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = env::var("PERSONA_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Ok(url) = env::var("LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }

        if let Some(value) = parse_env("PERSONA_MAX_ITERATIONS") {
            config.max_iterations = value;
        }

        if let Some(value) = parse_env("PERSONA_MAX_MESSAGES") {
            config.max_messages = value;
        }

        if let Some(value) = parse_env("PERSONA_HEARTBEAT_INTERVAL_SECS") {
            config.heartbeat_interval_secs = value;
        }

        if let Some(value) = parse_env("PERSONA_STALE_SESSION_SECS") {
            config.stale_session_secs = value;
        }

        config
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Staleness threshold for orphan detection. Always longer than the
    /// heartbeat interval so a live session is never swept.
    pub fn stale_after(&self) -> Duration {
        let floor = self.heartbeat_interval_secs.max(1) * 2;
        Duration::from_secs(self.stale_session_secs.max(floor))
    }

    pub fn recovery_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_sweep_interval_secs.max(1))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring unparsable value for {}: {:?}", key, raw);
            None
        }
    }
}
