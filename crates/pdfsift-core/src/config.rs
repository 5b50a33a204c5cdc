use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "PDFSIFT_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub api_prefix: String,
    pub app_name: String,
    pub max_upload_mb: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub base_dir: String,
    pub retention_minutes: u32,
    pub cleanup_interval_seconds: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Ollama,
    OpenRouter,
    Disabled,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::Ollama => "ollama",
            LlmProvider::OpenRouter => "openrouter",
            LlmProvider::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Some(LlmProvider::Ollama),
            "openrouter" => Some(LlmProvider::OpenRouter),
            "disabled" | "none" | "off" => Some(LlmProvider::Disabled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    /// Target summary length, in words, given to the model.
    pub summary_words: u32,
    /// Document text beyond this many characters is not sent to the model.
    pub max_input_chars: usize,
    pub temperature: f32,
    pub timeout_seconds: u64,
    pub ollama: OllamaConfig,
    pub openrouter: OpenRouterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub url: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenRouterConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub site_url: String,
    pub site_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            api_prefix: "/api/v1".to_string(),
            app_name: "PDF Extractor API".to_string(),
            max_upload_mb: 50,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: "~/.pdfsift".to_string(),
            retention_minutes: 10,
            cleanup_interval_seconds: 60,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Ollama,
            summary_words: 500,
            max_input_chars: 15_000,
            temperature: 0.3,
            timeout_seconds: 120,
            ollama: OllamaConfig::default(),
            openrouter: OpenRouterConfig::default(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
            model: "llama3.2".to_string(),
        }
    }
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key: String::new(),
            model: "meta-llama/llama-3.1-8b-instruct:free".to_string(),
            site_url: String::new(),
            site_name: "PDF Extractor API".to_string(),
        }
    }
}

impl AppConfig {
    /// Load config from `$PDFSIFT_CONFIG` or `~/.pdfsift/config.toml`, creating defaults if
    /// missing, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::load_from(Path::new(&path))?,
            Err(_) => {
                let config_path = Self::default_base_dir()?.join("config.toml");
                if config_path.exists() {
                    Self::load_from(&config_path)?
                } else {
                    let config = AppConfig::default();
                    config.ensure_dirs()?;
                    let toml_str = toml::to_string_pretty(&config).map_err(|e| {
                        CoreError::Config(format!("failed to serialize config: {e}"))
                    })?;
                    fs::write(&config_path, toml_str)?;
                    config
                }
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load config from a specific path (for testing or custom setups).
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("failed to read config: {e}")))?;
        let config: AppConfig = toml::from_str(&contents)
            .map_err(|e| CoreError::Config(format!("failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Overlay values from the environment. `lookup` is `std::env::var` in production.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("PDFSIFT_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PDFSIFT_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| CoreError::Config(format!("invalid PDFSIFT_PORT: {port}")))?;
        }
        if let Some(dir) = lookup("PDFSIFT_BASE_DIR") {
            self.storage.base_dir = dir;
        }
        if let Some(minutes) = lookup("PDFSIFT_RETENTION_MINUTES") {
            self.storage.retention_minutes = minutes.parse().map_err(|_| {
                CoreError::Config(format!("invalid PDFSIFT_RETENTION_MINUTES: {minutes}"))
            })?;
        }
        if let Some(provider) = lookup("PDFSIFT_LLM_PROVIDER") {
            self.llm.provider = LlmProvider::parse(&provider)
                .ok_or_else(|| CoreError::Config(format!("unknown llm provider: {provider}")))?;
        }
        if let Some(url) = lookup("OLLAMA_HOST") {
            self.llm.ollama.url = url;
        }
        if let Some(model) = lookup("OLLAMA_MODEL") {
            self.llm.ollama.model = model;
        }
        if let Some(key) = lookup("OPENROUTER_API_KEY") {
            self.llm.openrouter.api_key = key;
        }
        if let Some(model) = lookup("OPENROUTER_MODEL") {
            self.llm.openrouter.model = model;
        }
        Ok(())
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.storage.retention_minutes == 0 {
            return Err(CoreError::Config(
                "storage.retention_minutes must be greater than zero".to_string(),
            ));
        }
        if self.storage.cleanup_interval_seconds == 0 {
            return Err(CoreError::Config(
                "storage.cleanup_interval_seconds must be greater than zero".to_string(),
            ));
        }
        if !self.server.api_prefix.starts_with('/') {
            return Err(CoreError::Config(format!(
                "server.api_prefix must start with '/': {}",
                self.server.api_prefix
            )));
        }
        if self.llm.provider == LlmProvider::OpenRouter && self.llm.openrouter.api_key.is_empty() {
            return Err(CoreError::Config(
                "llm.openrouter.api_key is required when using the openrouter provider"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// API prefix without a trailing slash (`/` becomes the empty prefix).
    pub fn api_prefix(&self) -> &str {
        self.server.api_prefix.trim_end_matches('/')
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.storage.retention_minutes) * 60)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.storage.cleanup_interval_seconds.into())
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.server.max_upload_mb as usize * 1024 * 1024
    }

    /// Returns the resolved base directory (expands `~`).
    pub fn base_dir(&self) -> Result<PathBuf> {
        resolve_tilde(&self.storage.base_dir)
    }

    /// Returns the default base directory (`~/.pdfsift`).
    pub fn default_base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Config("could not determine home directory".to_string()))?;
        Ok(home.join(".pdfsift"))
    }

    /// Returns the path to the SQLite database.
    pub fn db_path(&self) -> Result<PathBuf> {
        Ok(self.base_dir()?.join("pdfsift.db"))
    }

    /// Directory holding uploaded PDFs.
    pub fn upload_dir(&self) -> Result<PathBuf> {
        Ok(self.base_dir()?.join("uploads").join("pdfs"))
    }

    /// Directory holding extracted images.
    pub fn image_dir(&self) -> Result<PathBuf> {
        Ok(self.base_dir()?.join("uploads").join("images"))
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.base_dir()?)?;
        fs::create_dir_all(self.upload_dir()?)?;
        fs::create_dir_all(self.image_dir()?)?;
        Ok(())
    }
}

/// Expand `~` to the user's home directory.
fn resolve_tilde(path: &str) -> Result<PathBuf> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Config("could not determine home directory".to_string()))?;
        Ok(home.join(rest))
    } else if path == "~" {
        dirs::home_dir()
            .ok_or_else(|| CoreError::Config("could not determine home directory".to_string()))
    } else {
        Ok(PathBuf::from(path))
    }
}

/// Initialize tracing/logging with env filter.
///
/// Respects `RUST_LOG` env var. Falls back to `default_level`.
pub fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.api_prefix, "/api/v1");
        assert_eq!(config.storage.retention_minutes, 10);
        assert_eq!(config.llm.provider, LlmProvider::Ollama);
        assert_eq!(config.llm.max_input_chars, 15_000);
        assert_eq!(config.retention(), Duration::from_secs(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml() {
        let toml_content = r#"
[server]
port = 9000
api_prefix = "/api/v2/"

[storage]
base_dir = "/tmp/test-pdfsift"
retention_minutes = 30

[llm]
provider = "disabled"

[llm.ollama]
model = "qwen2.5:3b"
"#;
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(toml_content.as_bytes()).unwrap();

        let config = AppConfig::load_from(f.path()).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.api_prefix(), "/api/v2");
        assert_eq!(config.storage.retention_minutes, 30);
        assert_eq!(config.llm.provider, LlmProvider::Disabled);
        assert_eq!(config.llm.ollama.model, "qwen2.5:3b");
        // defaults for fields not specified
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.llm.ollama.url, "http://localhost:11434");
        assert_eq!(config.storage.cleanup_interval_seconds, 60);
        assert_eq!(
            config.image_dir().unwrap(),
            PathBuf::from("/tmp/test-pdfsift/uploads/images")
        );
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PDFSIFT_PORT", "8080"),
            ("PDFSIFT_LLM_PROVIDER", "OpenRouter"),
            ("OPENROUTER_API_KEY", "sk-test"),
            ("PDFSIFT_RETENTION_MINUTES", "5"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.llm.provider, LlmProvider::OpenRouter);
        assert_eq!(config.llm.openrouter.api_key, "sk-test");
        assert_eq!(config.storage.retention_minutes, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_override_rejects_bad_port() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env_overrides(|key| (key == "PDFSIFT_PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = AppConfig::default();
        config.storage.retention_minutes = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.server.api_prefix = "api".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.llm.provider = LlmProvider::OpenRouter;
        assert!(config.validate().is_err());
    }
}
