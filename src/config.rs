//! Configuration management
//!
//! Provider endpoints and credentials, dispatch budgets, server binding,
//! and storage locations. Loaded from a TOML file; a default file is
//! written on first run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::dispatch::DispatchOptions;
use crate::providers::ProviderId;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server binding
    #[serde(default)]
    pub server: ServerConfig,
    /// Dispatch timeouts and buffering
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Database location
    #[serde(default)]
    pub storage: StorageConfig,
    /// Per-provider endpoints and credentials
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Seconds a provider gets to produce its first event.
    #[serde(default = "default_first_event_timeout")]
    pub first_event_timeout_secs: u64,
    /// Seconds of mid-stream silence tolerated once committed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Event buffer between the provider pump and the consumer.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_first_event_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_channel_capacity() -> usize {
    32
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            first_event_timeout_secs: default_first_event_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl DispatchConfig {
    pub fn options(&self) -> DispatchOptions {
        DispatchOptions {
            first_event_timeout: Duration::from_secs(self.first_event_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            channel_capacity: self.channel_capacity,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file; defaults to `interactions.db` under the data
    /// directory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
}

impl StorageConfig {
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("interactions.db")),
        }
    }
}

/// Connection settings for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    /// Inline key; prefer `api_key_env` so the file stays secret-free.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable to read the key from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ProviderSettings {
    /// Resolve the API key: inline value first, then the named env var.
    pub fn resolve_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            if !key.trim().is_empty() {
                return Some(key.clone());
            }
        }
        if let Some(var) = &self.api_key_env {
            if let Ok(key) = std::env::var(var) {
                if !key.trim().is_empty() {
                    return Some(key);
                }
            }
        }
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_openai")]
    pub openai: ProviderSettings,
    #[serde(default = "default_deepseek")]
    pub deepseek: ProviderSettings,
    #[serde(default = "default_anthropic")]
    pub anthropic: ProviderSettings,
    #[serde(default = "default_gemini")]
    pub gemini: ProviderSettings,
    #[serde(default = "default_ollama")]
    pub ollama: ProviderSettings,
}

fn default_openai() -> ProviderSettings {
    ProviderSettings {
        enabled: true,
        base_url: "https://api.openai.com/v1".to_string(),
        model: "gpt-4o-mini".to_string(),
        api_key: None,
        api_key_env: Some("OPENAI_API_KEY".to_string()),
    }
}

fn default_deepseek() -> ProviderSettings {
    ProviderSettings {
        enabled: true,
        base_url: "https://api.deepseek.com/v1".to_string(),
        model: "deepseek-chat".to_string(),
        api_key: None,
        api_key_env: Some("DEEPSEEK_API_KEY".to_string()),
    }
}

fn default_anthropic() -> ProviderSettings {
    ProviderSettings {
        enabled: true,
        base_url: "https://api.anthropic.com".to_string(),
        model: "claude-3-5-sonnet-latest".to_string(),
        api_key: None,
        api_key_env: Some("ANTHROPIC_API_KEY".to_string()),
    }
}

fn default_gemini() -> ProviderSettings {
    ProviderSettings {
        enabled: true,
        base_url: "https://generativelanguage.googleapis.com".to_string(),
        model: "gemini-2.0-flash".to_string(),
        api_key: None,
        api_key_env: Some("GOOGLE_API_KEY".to_string()),
    }
}

fn default_ollama() -> ProviderSettings {
    ProviderSettings {
        enabled: false,
        base_url: std::env::var("OLLAMA_URL")
            .unwrap_or_else(|_| "http://localhost:11434".to_string()),
        model: "llama3.2".to_string(),
        api_key: None,
        api_key_env: None,
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            openai: default_openai(),
            deepseek: default_deepseek(),
            anthropic: default_anthropic(),
            gemini: default_gemini(),
            ollama: default_ollama(),
        }
    }
}

impl ProvidersConfig {
    /// Settings for one provider.
    pub fn get(&self, id: ProviderId) -> &ProviderSettings {
        match id {
            ProviderId::Openai => &self.openai,
            ProviderId::Deepseek => &self.deepseek,
            ProviderId::Anthropic => &self.anthropic,
            ProviderId::Gemini => &self.gemini,
            ProviderId::Ollama => &self.ollama,
        }
    }
}

impl Config {
    /// Load configuration from the default location, writing a default
    /// file on first run.
    pub fn load() -> Result<Self> {
        Self::load_from(config_path()?)
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: PathBuf) -> Result<Self> {
        if path.exists() {
            let contents =
                std::fs::read_to_string(&path).context("Failed to read config file")?;
            let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(&path)?;
            Ok(config)
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path()?)
    }

    fn save_to(&self, path: &std::path::Path) -> Result<()> {
        let parent = path.parent().context("Config path has no parent")?;

        std::fs::create_dir_all(parent).context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Reject values that would fail at request time in confusing ways.
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.first_event_timeout_secs == 0 || self.dispatch.idle_timeout_secs == 0 {
            anyhow::bail!("dispatch timeouts must be greater than zero");
        }
        if self.dispatch.channel_capacity == 0 {
            anyhow::bail!("dispatch channel_capacity must be greater than zero");
        }

        for id in ProviderId::ALL {
            let settings = self.providers.get(id);
            if !settings.enabled {
                continue;
            }
            Url::parse(&settings.base_url)
                .with_context(|| format!("invalid base_url for provider '{id}'"))?;
            if settings.model.trim().is_empty() {
                anyhow::bail!("provider '{id}' has an empty model name");
            }
        }

        Ok(())
    }
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "polymind", "polymind")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Get the data directory path
pub fn data_dir() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "polymind", "polymind")
        .context("Failed to get project directories")?;
    Ok(base.data_dir().to_path_buf())
}

/// Get default configuration as TOML string
pub fn default_config_toml() -> String {
    let config = Config::default();
    toml::to_string_pretty(&config).unwrap_or_else(|_| "# Default configuration\n".to_string())
}
