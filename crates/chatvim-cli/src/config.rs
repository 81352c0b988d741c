//! Configuration file support

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use chatvim_ai::Provider;
use chatvim_core::{
    AdmissionPolicy, EngineConfig, FlushPolicy, ProviderTransport, TranscriptFormat,
};
use serde::{Deserialize, Serialize};

/// Configuration for chatvim
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model used when the user turn carries no tag
    pub model: Option<String>,
    /// Tag prefixes (`4> ...`) and the models they select
    pub model_tags: Option<BTreeMap<String, String>>,
    /// Maximum tokens per response
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Characters to collect before writing a partial line
    pub flush_threshold: Option<usize>,
    /// What to do when a reply is already streaming (reject, replace)
    pub admission: Option<AdmissionPolicy>,
    pub assistant_prefix: Option<String>,
    pub user_prompt: Option<String>,
    /// Name of the system prompt file under the prompts directory
    pub prompt: Option<String>,
    /// API keys (alternative to environment variables)
    #[serde(default)]
    pub api_keys: ApiKeys,
}

/// API key configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeys {
    pub anthropic: Option<String>,
    pub openai: Option<String>,
    pub google: Option<String>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chatvim")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("CHATVIM_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match toml::from_str::<Config>(&content) {
                Ok(config) => config.validated(),
                Err(e) => {
                    tracing::warn!("Failed to parse config file {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Drop settings that would make replies unreadable as transcript turns
    fn validated(mut self) -> Self {
        for (key, value) in [
            ("assistant_prefix", &mut self.assistant_prefix),
            ("user_prompt", &mut self.user_prompt),
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                tracing::warn!("Ignoring blank {} in config; using the default", key);
                *value = None;
            }
        }
        self
    }

    /// Create a config file with the example contents if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, example_config())?;
        Ok(path)
    }

    /// Engine settings, with defaults for everything left unset
    pub fn engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        let mut format = TranscriptFormat::default();
        if let Some(prefix) = &self.assistant_prefix {
            format.assistant_prefix = prefix.clone();
        }
        if let Some(prompt) = &self.user_prompt {
            format.user_prompt = prompt.clone();
        }
        if let Some(tags) = &self.model_tags {
            format.model_tags = tags.clone();
        }

        EngineConfig {
            model: self.model.clone().unwrap_or(defaults.model),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system_prompt: None,
            format,
            flush: self
                .flush_threshold
                .map(|min_chars| FlushPolicy { min_chars })
                .unwrap_or(defaults.flush),
            admission: self.admission.unwrap_or(defaults.admission),
        }
    }

    /// Provider transport carrying the configured keys. Providers without
    /// a key here fall back to their environment variable.
    pub fn transport(&self) -> ProviderTransport {
        let keys = [
            (Provider::OpenAI, &self.api_keys.openai),
            (Provider::Anthropic, &self.api_keys.anthropic),
            (Provider::Google, &self.api_keys.google),
        ];
        keys.into_iter()
            .fold(ProviderTransport::new(), |transport, (provider, key)| match key {
                Some(key) => transport.with_api_key(provider, key.clone()),
                None => transport,
            })
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# chatvim configuration file
# Place at ~/.config/chatvim/config.toml (Linux) or set CHATVIM_CONFIG_PATH

# Model used when the user turn carries no tag
model = "gpt-4o-mini"

# Name of the system prompt file in ~/.config/chatvim/prompts/
prompt = "default"

# Characters to collect before a partial line is written to the file
flush_threshold = 20

# What to do when a reply is already streaming into the file: reject or replace
admission = "reject"

# Prefix written in front of every assistant turn
assistant_prefix = "LLM: "

# `3> question` and `4> question` pick a model for one request
[model_tags]
3 = "gpt-3.5-turbo"
4 = "gpt-4"

# API keys (optional - can also use environment variables)
# It's recommended to use environment variables instead for security
[api_keys]
# openai = "sk-..."
# anthropic = "sk-ant-..."
# google = "..."
"#
}
