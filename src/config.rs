use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

use crate::error::ConfigError;

pub const CONFIG_FILE: &str = "voisemail.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub gmail: GmailConfig,
    pub openai: OpenAiConfig,
    pub elevenlabs: ElevenLabsConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineSettings,
    pub vault: VaultConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:voisemail.db?mode=rwc".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GmailConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Google `credentials.json`, used when id/secret are not set directly.
    pub credentials_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElevenLabsConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    /// Bitrate of the returned MP3 stream, used to estimate durations.
    pub bitrate_kbps: u32,
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.elevenlabs.io/v1".to_string(),
            bitrate_kbps: 128,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub public_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("public/uploads/audio"),
            public_prefix: "/uploads/audio".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub inbox_page_size: u32,
    pub junk_page_size: u32,
    pub batch_limit: u32,
    /// Characters of body text sent for general analysis.
    pub analysis_window: usize,
    /// Characters of body text sent for junk analysis.
    pub junk_window: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            inbox_page_size: 50,
            junk_page_size: 30,
            batch_limit: 10,
            analysis_window: 3000,
            junk_window: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VaultConfig {
    /// 64 hex characters. Falls back to the OS keyring when unset.
    pub key: Option<String>,
}

impl Config {
    pub fn load() -> Self {
        use std::fs;
        let mut config = match fs::read_to_string(CONFIG_FILE) {
            Ok(content) => Self::from_toml(&content).unwrap_or_else(|e| {
                warn!("Ignoring malformed {}: {}", CONFIG_FILE, e);
                Self::default()
            }),
            Err(_) => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        config
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Secrets and the database URL may come from the environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(key) = get("OPENAI_API_KEY") {
            self.openai.api_key = Some(key);
        }
        if let Some(key) = get("ELEVENLABS_API_KEY") {
            self.elevenlabs.api_key = Some(key);
        }
        if let Some(id) = get("GMAIL_CLIENT_ID") {
            self.gmail.client_id = Some(id);
        }
        if let Some(secret) = get("GMAIL_CLIENT_SECRET") {
            self.gmail.client_secret = Some(secret);
        }
        if let Some(key) = get("VOISEMAIL_ENCRYPTION_KEY") {
            self.vault.key = Some(key);
        }
    }

    /// Reports every missing required setting at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        let unset = |v: &Option<String>| v.as_deref().is_none_or(|s| s.trim().is_empty());

        if self.database.url.trim().is_empty() {
            missing.push("DATABASE_URL is required".to_string());
        }
        if unset(&self.openai.api_key) {
            missing.push("OPENAI_API_KEY is required".to_string());
        }
        if unset(&self.elevenlabs.api_key) {
            missing.push("ELEVENLABS_API_KEY is required".to_string());
        }
        if self.gmail.credentials_file.is_none() {
            if unset(&self.gmail.client_id) {
                missing.push("GMAIL_CLIENT_ID is required".to_string());
            }
            if unset(&self.gmail.client_secret) {
                missing.push("GMAIL_CLIENT_SECRET is required".to_string());
            }
        }
        if let Some(key) = &self.vault.key {
            if key.trim().len() != 64 {
                missing.push(
                    "VOISEMAIL_ENCRYPTION_KEY must be 64 hex characters (32 bytes)".to_string(),
                );
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { missing })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [pipeline]
            inbox_page_size = 25

            [openai]
            model = "gpt-4o"
            "#,
        )
        .unwrap();

        assert_eq!(config.pipeline.inbox_page_size, 25);
        assert_eq!(config.pipeline.junk_page_size, 30);
        assert_eq!(config.pipeline.analysis_window, 3000);
        assert_eq!(config.openai.model, "gpt-4o");
        assert_eq!(config.openai.base_url, "https://api.openai.com/v1");
        assert_eq!(config.elevenlabs.bitrate_kbps, 128);
    }

    #[test]
    fn test_env_overrides_secrets() {
        let env: HashMap<&str, &str> = [
            ("OPENAI_API_KEY", "sk-test"),
            ("ELEVENLABS_API_KEY", "xi-test"),
            ("GMAIL_CLIENT_ID", "client"),
            ("GMAIL_CLIENT_SECRET", "   "),
            ("DATABASE_URL", "sqlite::memory:"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.openai.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.elevenlabs.api_key.as_deref(), Some("xi-test"));
        assert_eq!(config.gmail.client_id.as_deref(), Some("client"));
        assert_eq!(config.gmail.client_secret, None);
        assert_eq!(config.database.url, "sqlite::memory:");
    }

    #[test]
    fn test_validate_lists_all_missing() {
        let err = Config::default().validate().unwrap_err();
        assert_eq!(err.missing.len(), 4);
        assert!(err.to_string().contains("OPENAI_API_KEY is required"));
        assert!(err.to_string().contains("GMAIL_CLIENT_SECRET is required"));
    }

    #[test]
    fn test_validate_accepts_credentials_file_and_checks_key_length() {
        let mut config = Config::default();
        config.openai.api_key = Some("sk".to_string());
        config.elevenlabs.api_key = Some("xi".to_string());
        config.gmail.credentials_file = Some(PathBuf::from("credentials.json"));
        assert!(config.validate().is_ok());

        config.vault.key = Some("abc".to_string());
        let err = config.validate().unwrap_err();
        assert_eq!(err.missing.len(), 1);
    }
}
