//! Configuration management
//!
//! This module handles loading, validation, and management of the CRMFlow configuration.
//! Configuration is stored in TOML format at ~/.crmflow/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory, preview size
//! - **store**: Collection allow-list, row limits, optional fixture file
//! - **rbac**: Globally redacted fields and per-user overrides
//! - **reasoning**: Optional reasoning service used by the planner
//! - **bi**: BI embedding service (site URL, expiry, theme)
//! - **crm**: CRM action surface (base URL, action catalog)
//! - **artifacts**: Artifact retention
//!
//! # Secrets
//!
//! Signing keys and credentials are never read from or written to the file.
//! They come from the environment:
//!
//! - `CRMFLOW_BI_EMBED_SECRET`, `CRMFLOW_BI_SESSION_TOKEN`
//! - `CRMFLOW_CRM_AUTH_VALUE`
//! - `OPENAI_API_KEY`
//!
//! # Examples
//!
//! ```no_run
//! use crmflow_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Data dir: {:?}", config.core.data_dir);
//! println!("Reasoning provider: {}", config.reasoning.provider);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    pub core: CoreConfig,

    /// Document store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Access policy
    #[serde(default)]
    pub rbac: RbacConfig,

    /// Reasoning service used by the planner (optional)
    #[serde(default)]
    pub reasoning: ReasoningConfig,

    /// BI embedding service
    #[serde(default)]
    pub bi: BiConfig,

    /// CRM action surface
    #[serde(default)]
    pub crm: CrmConfig,

    /// Artifact retention
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Maximum rows included in a response preview
    #[serde(default = "default_preview_rows")]
    pub preview_rows: usize,
}

/// Document store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Collections the store exposes at all
    #[serde(default = "default_collections")]
    pub allowed_collections: Vec<String>,

    /// Row limit applied when a read does not name one
    #[serde(default = "default_row_limit")]
    pub default_limit: u32,

    /// Upper bound on any requested row limit
    #[serde(default = "default_max_row_limit")]
    pub max_limit: u32,

    /// JSON file of `{collection: [documents]}` used to seed the store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixtures: Option<PathBuf>,
}

/// Access policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RbacConfig {
    /// Field names removed from every record-reading result
    #[serde(default = "default_deny_fields")]
    pub deny_fields: Vec<String>,

    /// Per-user overrides keyed by user id
    #[serde(default)]
    pub users: BTreeMap<String, UserPolicyConfig>,
}

/// Per-user policy override
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPolicyConfig {
    /// Collections this user may read; absent means the store allow-list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collections: Option<Vec<String>>,

    /// Extra fields redacted for this user only
    #[serde(default)]
    pub deny_fields: Vec<String>,
}

/// Reasoning service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    /// Provider: none, ollama, openai
    #[serde(default = "default_reasoning_provider")]
    pub provider: String,

    /// Ollama provider settings
    #[serde(default)]
    pub ollama: OllamaConfig,

    /// OpenAI provider settings
    #[serde(default)]
    pub openai: OpenAIConfig,
}

/// Ollama provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Base URL for Ollama API
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_ollama_model")]
    pub model: String,
}

/// OpenAI provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIConfig {
    /// Base URL for OpenAI API
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_openai_model")]
    pub model: String,

    /// API key, from `OPENAI_API_KEY` only
    #[serde(skip)]
    pub api_key: Option<String>,
}

/// BI embedding service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiConfig {
    /// Public site URL of the BI service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_url: Option<String>,

    /// Lifetime of signed embed URLs
    #[serde(default = "default_embed_expiry_minutes")]
    pub embed_expiry_minutes: u64,

    /// Theme used when a request names none
    #[serde(default = "default_theme")]
    pub default_theme: String,

    /// Embed signing key, from `CRMFLOW_BI_EMBED_SECRET` only
    #[serde(skip)]
    pub embed_secret: Option<String>,

    /// API session token, from `CRMFLOW_BI_SESSION_TOKEN` only
    #[serde(skip)]
    pub session_token: Option<String>,
}

/// CRM action surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmConfig {
    /// Base URL actions are issued against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// URL of the OpenAPI document describing the actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_url: Option<String>,

    /// Header carrying the credential
    #[serde(default = "default_crm_auth_header")]
    pub auth_header: String,

    /// Credential, from `CRMFLOW_CRM_AUTH_VALUE` only
    #[serde(skip)]
    pub auth_value: Option<String>,
}

/// Artifact retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    /// Seconds an artifact stays retrievable; 0 keeps it forever
    #[serde(default = "default_artifact_ttl")]
    pub ttl_secs: u64,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.crmflow/data")
}

fn default_preview_rows() -> usize {
    10
}

fn default_collections() -> Vec<String> {
    ["leads", "tasks", "notes", "call_logs", "activity"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_row_limit() -> u32 {
    1000
}

fn default_max_row_limit() -> u32 {
    20000
}

fn default_deny_fields() -> Vec<String> {
    vec!["ssn".to_string(), "salary".to_string()]
}

fn default_reasoning_provider() -> String {
    "none".to_string()
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embed_expiry_minutes() -> u64 {
    60
}

fn default_theme() -> String {
    "light".to_string()
}

fn default_crm_auth_header() -> String {
    "Authorization".to_string()
}

fn default_artifact_ttl() -> u64 {
    86_400
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            preview_rows: default_preview_rows(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            allowed_collections: default_collections(),
            default_limit: default_row_limit(),
            max_limit: default_max_row_limit(),
            fixtures: None,
        }
    }
}

impl Default for RbacConfig {
    fn default() -> Self {
        Self {
            deny_fields: default_deny_fields(),
            users: BTreeMap::new(),
        }
    }
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            provider: default_reasoning_provider(),
            ollama: OllamaConfig::default(),
            openai: OpenAIConfig::default(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base_url(),
            model: default_ollama_model(),
        }
    }
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            model: default_openai_model(),
            api_key: None,
        }
    }
}

impl Default for BiConfig {
    fn default() -> Self {
        Self {
            site_url: None,
            embed_expiry_minutes: default_embed_expiry_minutes(),
            default_theme: default_theme(),
            embed_secret: None,
            session_token: None,
        }
    }
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            catalog_url: None,
            auth_header: default_crm_auth_header(),
            auth_value: None,
        }
    }
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_artifact_ttl(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            store: StoreConfig::default(),
            rbac: RbacConfig::default(),
            reasoning: ReasoningConfig::default(),
            bi: BiConfig::default(),
            crm: CrmConfig::default(),
            artifacts: ArtifactsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.crmflow/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides();
        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let mut config = Self::default();

        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        config.apply_env_overrides();
        config.validate_and_process()?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.crmflow/config.toml)
    pub fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".crmflow").join("config.toml"))
    }

    /// Path of the SQLite database inside the data directory
    pub fn database_path(&self) -> PathBuf {
        self.core.data_dir.join("crmflow.db")
    }

    /// Read secrets from the environment
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_secret("CRMFLOW_BI_EMBED_SECRET") {
            self.bi.embed_secret = Some(v);
        }
        if let Some(v) = env_secret("CRMFLOW_BI_SESSION_TOKEN") {
            self.bi.session_token = Some(v);
        }
        if let Some(v) = env_secret("CRMFLOW_CRM_AUTH_VALUE") {
            self.crm.auth_value = Some(v);
        }
        if let Some(v) = env_secret("OPENAI_API_KEY") {
            self.reasoning.openai.api_key = Some(v);
        }
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates log level, reasoning provider and row limits
    /// - Expands ~ in paths
    /// - Creates the data directory if it doesn't exist
    pub fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        let valid_providers = ["none", "ollama", "openai"];
        if !valid_providers.contains(&self.reasoning.provider.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid reasoning provider '{}'. Must be one of: {}",
                self.reasoning.provider,
                valid_providers.join(", ")
            )));
        }

        if self.store.default_limit == 0 || self.store.default_limit > self.store.max_limit {
            return Err(EngineError::Config(format!(
                "store.default_limit must be between 1 and max_limit ({})",
                self.store.max_limit
            )));
        }

        if self.core.preview_rows == 0 {
            return Err(EngineError::Config(
                "core.preview_rows must be at least 1".to_string(),
            ));
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        if let Some(fixtures) = &self.store.fixtures {
            self.store.fixtures = Some(expand_path(fixtures)?);
        }

        Ok(())
    }
}

fn env_secret(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
