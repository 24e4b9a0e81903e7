//! Configuration parser for loading engine configuration and graph documents.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, Result, TerraceError};
use crate::graph::{GraphDocument, ResourceGraph};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::{EngineConfig, ProviderKind};

/// Configuration parser for loading engine configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Resolves a path from the configuration against the base path.
    #[must_use]
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        match &self.base_path {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<EngineConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(TerraceError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            TerraceError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<EngineConfig> {
        debug!("Parsing YAML configuration");

        let config: EngineConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            TerraceError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!("Successfully parsed configuration for project: {}", config.project.name);
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format:
    /// `TERRACE_<SECTION>_<KEY>` (e.g., `TERRACE_PROJECT_NAME`)
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<EngineConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_overrides(&mut config, |key| std::env::var(key).ok());
        Ok(config)
    }

    /// Applies overrides looked up by `TERRACE_*` key.
    fn apply_overrides(config: &mut EngineConfig, lookup: impl Fn(&str) -> Option<String>) {
        // Project overrides
        if let Some(name) = lookup("TERRACE_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Some(env) = lookup("TERRACE_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        // State overrides
        if let Some(bucket) = lookup("TERRACE_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Some(prefix) = lookup("TERRACE_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Some(region) = lookup("TERRACE_STATE_REGION") {
            debug!("Overriding state.region from environment");
            config.state.region = Some(region);
        }

        // Provider and pipeline overrides
        if let Some(endpoint) = lookup("TERRACE_PROVIDER_ENDPOINT") {
            debug!("Overriding provider.endpoint from environment");
            config.provider.endpoint = Some(endpoint);
        }

        if let Some(graph) = lookup("TERRACE_PIPELINE_DESIRED_GRAPH") {
            debug!("Overriding pipeline.desired_graph from environment");
            config.pipeline.desired_graph = graph;
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                TerraceError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Validates that the environment variables a configuration needs are set.
    ///
    /// # Errors
    ///
    /// Returns an error if the http provider's token variable is missing.
    pub fn validate_required_env(&self, config: &EngineConfig) -> Result<()> {
        if config.provider.kind == ProviderKind::Http && config.provider.token().is_none() {
            return Err(TerraceError::Config(ConfigError::MissingEnvVar {
                name: config.provider.token_env.clone(),
            }));
        }
        Ok(())
    }

    /// Loads the desired graph named by the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be read, parsed, or forms an
    /// invalid graph.
    pub fn load_graph(&self, path: impl AsRef<Path>) -> Result<ResourceGraph> {
        let path = self.resolve(path);
        info!("Loading desired graph from: {}", path.display());

        if !path.exists() {
            return Err(TerraceError::Config(ConfigError::FileNotFound { path }));
        }

        let content = std::fs::read_to_string(&path).map_err(|e| {
            TerraceError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        parse_graph(&content, &path)
    }
}

/// Parses a desired graph document; `.json` files are read as JSON and
/// everything else as YAML.
///
/// # Errors
///
/// Returns a parse error for malformed documents and a graph error for
/// duplicate identities, dangling references or cycles.
pub fn parse_graph(content: &str, path: &Path) -> Result<ResourceGraph> {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    let document: GraphDocument = if is_json {
        serde_json::from_str(content).map_err(|e| parse_error("JSON", &e, path))?
    } else {
        serde_yaml::from_str(content).map_err(|e| parse_error("YAML", &e, path))?
    };

    let graph = ResourceGraph::try_from(document)?;
    debug!("Parsed desired graph with {} resources", graph.len());
    Ok(graph)
}

fn parse_error(format: &str, error: &dyn std::fmt::Display, path: &Path) -> TerraceError {
    TerraceError::Config(ConfigError::ParseError {
        message: format!("{format} parse error: {error}"),
        location: Some(path.display().to_string()),
    })
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["terrace.yaml", "terrace.yml"];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(TerraceError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}
