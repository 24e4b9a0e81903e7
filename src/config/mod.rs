//! Configuration module for the convergence engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `terrace.yaml`
//! - Environment and `.env` overrides
//! - Validation of configuration values
//! - Loading desired graph documents

mod spec;
mod parser;
mod validator;

pub use spec::{
    DEFAULT_TOKEN_ENV, EngineConfig, ExecutorConfig, LockConfig, PipelineConfig, PollConfig,
    ProjectConfig, ProviderConfig, ProviderKind, RetryConfig, SchemaConfig, StateBackend,
    StateConfig,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file, parse_graph};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
