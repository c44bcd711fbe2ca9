//! Configuration.
//!
//! ## Learning: Serde for Serialization
//!
//! `#[serde(default)]` on every section means a config file only has to
//! mention what it changes; everything else falls back to `Default`.
//!
//! ```toml
//! [connection]
//! base_url = "http://localhost:8888/"
//! reconnect_delay_secs = 1.0
//!
//! [languages.python]
//! file_extension = "py"
//! command = "pylsp"
//!
//! [[extractors]]
//! host_language = "python"
//! language = "sql"
//! pattern = '(?s)\A%%sql[^\n]*\n(.*)'
//! file_extension = "sql"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::extractor::{
    ExtractError, ExtractorRegistry, FencedCodeExtractor, RegExpExtractor,
    RegExpExtractorOptions,
};

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server connection settings
    pub connection: ConnectionConfig,

    /// Virtual document assembly settings
    pub documents: DocumentsConfig,

    /// Language-specific settings
    pub languages: HashMap<String, LanguageConfig>,

    /// Extra regular expression extractors, applied after the built-in ones
    pub extractors: Vec<RegExpExtractorOptions>,

    /// Fenced code extraction
    pub fenced_code: FencedCodeConfig,
}

impl Config {
    /// Loads config from the default location.
    pub fn load() -> Self {
        Self::load_from_default_path().unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Loads config from a file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    fn load_from_default_path() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Returns the default config file path.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join("nblsp").join("config.toml"))
    }

    /// Saves the config to a file, creating parent directories.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns config for a specific language, falling back to the
    /// built-in table.
    pub fn language(&self, language: &str) -> LanguageConfig {
        self.languages
            .get(language)
            .cloned()
            .or_else(|| default_languages().remove(language))
            .unwrap_or_default()
    }

    /// Built-in and configured languages, sorted.
    pub fn known_languages(&self) -> Vec<String> {
        let mut languages: Vec<String> = default_languages()
            .into_keys()
            .chain(self.languages.keys().cloned())
            .collect();
        languages.sort();
        languages.dedup();
        languages
    }

    /// File extension for documents of `language`.
    pub fn file_extension(&self, language: &str) -> String {
        self.language(language)
            .file_extension
            .unwrap_or_else(|| language.to_string())
    }

    /// Language whose documents use `extension`, if any.
    pub fn language_for_extension(&self, extension: &str) -> Option<String> {
        let configured = self
            .languages
            .iter()
            .find(|(_, language)| language.file_extension.as_deref() == Some(extension))
            .map(|(name, _)| name.clone());
        configured.or_else(|| {
            let mut defaults: Vec<_> = default_languages().into_iter().collect();
            defaults.sort_by(|a, b| a.0.cmp(&b.0));
            defaults
                .into_iter()
                .find(|(_, language)| language.file_extension.as_deref() == Some(extension))
                .map(|(name, _)| name)
        })
    }

    /// Builds the extractor registry: fenced code for the configured hosts,
    /// the IPython cell magics, then user extractors.
    pub fn extractor_registry(&self) -> Result<ExtractorRegistry, ExtractError> {
        let mut registry = ExtractorRegistry::new();

        let mut extensions: HashMap<String, String> = default_languages()
            .into_iter()
            .filter_map(|(name, language)| language.file_extension.map(|ext| (name, ext)))
            .collect();
        for (name, language) in &self.languages {
            if let Some(ext) = &language.file_extension {
                extensions.insert(name.clone(), ext.clone());
            }
        }
        for (language, ext) in &extensions {
            registry.set_file_extension(language, ext);
        }

        if self.fenced_code.enabled {
            for host in &self.fenced_code.host_languages {
                let extractor = FencedCodeExtractor::new(extensions.clone())?;
                registry.register(host, Arc::new(extractor));
            }
        }

        for options in default_magic_extractors().into_iter().chain(self.extractors.clone()) {
            let host = options.host_language.clone();
            registry.register(&host, Arc::new(RegExpExtractor::new(options)?));
        }

        Ok(registry)
    }
}

const DEFAULT_RECONNECT_DELAY_SECS: f64 = 2.0;

/// Connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Base URL of the server hosting the LSP proxy
    pub base_url: String,

    /// Root URI for documents the server can open directly
    pub root_uri: String,

    /// Root URI for synthetic documents such as notebooks
    pub virtual_documents_uri: String,

    /// First retry delay in seconds
    pub reconnect_delay_secs: f64,

    /// Retry attempts (None = retry forever)
    pub max_retries: Option<u32>,

    /// First readiness wait in seconds
    pub ready_timeout_secs: u64,

    /// Second, longer readiness wait in seconds
    pub ready_grace_secs: u64,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

impl ConnectionConfig {
    /// Negative delays mean no delay. Delays too large for a `Duration`
    /// fall back to the default.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.reconnect_delay_secs.max(0.0)).unwrap_or_else(|e| {
            tracing::warn!(
                "Invalid reconnect delay {}s ({}), using {}s",
                self.reconnect_delay_secs,
                e,
                DEFAULT_RECONNECT_DELAY_SECS
            );
            Duration::from_secs_f64(DEFAULT_RECONNECT_DELAY_SECS)
        })
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn ready_grace(&self) -> Duration {
        Duration::from_secs(self.ready_grace_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8888/".to_string(),
            root_uri: "file:///".to_string(),
            virtual_documents_uri: "file:///.virtual_documents".to_string(),
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY_SECS,
            max_retries: None,
            ready_timeout_secs: 30,
            ready_grace_secs: 300,
            request_timeout_secs: 10,
        }
    }
}

/// Virtual document assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentsConfig {
    /// Empty lines inserted between consecutive blocks
    pub blank_lines_between_cells: usize,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            blank_lines_between_cells: 2,
        }
    }
}

/// Language-specific configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageConfig {
    /// Extension of virtual documents in this language
    pub file_extension: Option<String>,

    /// LSP server command
    pub command: Option<String>,

    /// LSP server arguments
    pub args: Vec<String>,
}

impl LanguageConfig {
    fn new(extension: &str, command: Option<&str>, args: &[&str]) -> Self {
        Self {
            file_extension: Some(extension.to_string()),
            command: command.map(str::to_string),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }
}

/// Fenced code extraction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FencedCodeConfig {
    pub enabled: bool,

    /// Host languages whose fenced blocks are extracted
    pub host_languages: Vec<String>,
}

impl Default for FencedCodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host_languages: vec!["markdown".to_string()],
        }
    }
}

/// Built-in language table.
fn default_languages() -> HashMap<String, LanguageConfig> {
    HashMap::from([
        (
            "python".to_string(),
            LanguageConfig::new("py", Some("pylsp"), &[]),
        ),
        (
            "r".to_string(),
            LanguageConfig::new("R", Some("R"), &["--slave", "-e", "languageserver::run()"]),
        ),
        (
            "shell".to_string(),
            LanguageConfig::new("sh", Some("bash-language-server"), &["start"]),
        ),
        (
            "javascript".to_string(),
            LanguageConfig::new("js", Some("typescript-language-server"), &["--stdio"]),
        ),
        (
            "typescript".to_string(),
            LanguageConfig::new("ts", Some("typescript-language-server"), &["--stdio"]),
        ),
        (
            "markdown".to_string(),
            LanguageConfig::new("md", None, &[]),
        ),
        ("html".to_string(), LanguageConfig::new("html", None, &[])),
        ("sql".to_string(), LanguageConfig::new("sql", None, &[])),
    ])
}

/// IPython cell magics whose bodies are in another language.
fn default_magic_extractors() -> Vec<RegExpExtractorOptions> {
    let magic = |name: &str, language: &str, extension: &str, standalone: bool| {
        RegExpExtractorOptions {
            host_language: "python".to_string(),
            language: language.to_string(),
            pattern: format!(r"(?s)\A%%{name}(?:[ \t][^\n]*)?\n(.*)"),
            capture_groups: vec![1],
            standalone,
            file_extension: extension.to_string(),
        }
    };
    vec![
        magic("(?:bash|sh)", "shell", "sh", true),
        magic("html", "html", "html", false),
        magic("markdown", "markdown", "md", false),
        magic("sql", "sql", "sql", false),
        magic("R", "r", "R", false),
    ]
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config directory not found")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
