//! Configuration types for the convergence engine.
//!
//! These structs map to `terrace.yaml`. Every section except `project` is
//! optional and falls back to defaults suited to a local, in-memory setup.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use validator::Validate;

use crate::drift::DriftPolicy;
use crate::graph::{ResourceTypeSchema, SchemaRegistry};
use crate::pipeline::PipelineSettings;
use crate::provider::{PollPolicy, RetryPolicy};

/// Environment variable read for the provider token when none is configured.
pub const DEFAULT_TOKEN_ENV: &str = "TERRACE_PROVIDER_TOKEN";

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct EngineConfig {
    /// Project-level configuration.
    #[validate(nested)]
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    #[validate(nested)]
    pub state: StateConfig,
    /// Provider configuration.
    #[serde(default)]
    #[validate(nested)]
    pub provider: ProviderConfig,
    /// Executor configuration.
    #[serde(default)]
    #[validate(nested)]
    pub executor: ExecutorConfig,
    /// Lock configuration.
    #[serde(default)]
    #[validate(nested)]
    pub lock: LockConfig,
    /// Pipeline configuration.
    #[serde(default)]
    #[validate(nested)]
    pub pipeline: PipelineConfig,
    /// Resource schema configuration.
    #[serde(default)]
    pub schema: SchemaConfig,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ProjectConfig {
    /// Unique name for the project.
    #[validate(length(min = 1, max = 63))]
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    #[validate(length(min = 1, max = 32))]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    #[validate(length(min = 3, max = 63))]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Refuse to touch a store whose lineage differs.
    #[serde(default)]
    pub expected_lineage: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ProviderConfig {
    /// Which provider implementation to use.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Base URL of the provider API (http provider).
    #[serde(default)]
    #[validate(url)]
    pub endpoint: Option<String>,
    /// Environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    #[validate(length(min = 1))]
    pub token_env: String,
    /// Request timeout in seconds.
    #[serde(default = "default_provider_timeout")]
    #[validate(range(min = 1, max = 3600))]
    pub timeout_secs: u64,
}

/// Provider implementations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Simulated in-process account.
    #[default]
    Memory,
    /// REST provider API.
    Http,
}

/// Executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ExecutorConfig {
    /// Maximum provider calls in flight.
    #[serde(default = "default_concurrency")]
    #[validate(range(min = 1, max = 256))]
    pub max_concurrency: usize,
    /// Persist the snapshot after every batch.
    #[serde(default)]
    pub checkpoint_each_batch: bool,
    /// Retry policy for provider calls.
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryConfig,
    /// Polling policy for pending operations.
    #[serde(default)]
    #[validate(nested)]
    pub poll: PollConfig,
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct RetryConfig {
    /// Attempts per call, including the first.
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
    /// First backoff delay in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Polling configuration for pending operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct PollConfig {
    /// First poll interval in milliseconds.
    #[serde(default = "default_poll_initial_ms")]
    #[validate(range(min = 1))]
    pub initial_interval_ms: u64,
    /// Poll interval ceiling in milliseconds.
    #[serde(default = "default_poll_max_ms")]
    #[validate(range(min = 1))]
    pub max_interval_ms: u64,
    /// Give up after this many seconds and record the resource as tainted.
    #[serde(default = "default_poll_timeout")]
    #[validate(range(min = 1))]
    pub timeout_secs: u64,
}

/// Lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct LockConfig {
    /// Lock lifetime in seconds, renewed by the heartbeat.
    #[serde(default = "default_lock_ttl")]
    #[validate(range(min = 5))]
    pub ttl_secs: u64,
    /// How long to wait for a held lock.
    #[serde(default = "default_lock_wait")]
    pub wait_timeout_secs: u64,
    /// How often to retry a held lock, in milliseconds.
    #[serde(default = "default_lock_poll_ms")]
    #[validate(range(min = 10))]
    pub poll_interval_ms: u64,
}

/// Pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct PipelineConfig {
    /// Desired graph document, relative to the configuration file.
    #[serde(default = "default_desired_graph")]
    #[validate(length(min = 1))]
    pub desired_graph: String,
    /// What scheduled drift checks do.
    #[serde(default)]
    pub drift_policy: DriftPolicy,
    /// Seconds between drift checks; zero disables them.
    #[serde(default = "default_drift_interval")]
    pub drift_interval_secs: u64,
    /// Seconds between desired graph file checks.
    #[serde(default = "default_watch_interval")]
    #[validate(range(min = 1))]
    pub watch_interval_secs: u64,
    /// JSON-lines run report file.
    #[serde(default)]
    pub report_path: Option<String>,
    /// Number of runs kept in memory.
    #[serde(default = "default_history_limit")]
    #[validate(range(min = 1, max = 10000))]
    pub history_limit: usize,
    /// Refresh from live state before every plan.
    #[serde(default)]
    pub refresh: bool,
}

/// Resource schema configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaConfig {
    /// Reject resource types without a schema.
    #[serde(default)]
    pub strict: bool,
    /// Additional or replacement schemas, keyed by resource type.
    #[serde(default)]
    pub resource_types: BTreeMap<String, ResourceTypeSchema>,
}

// Default value functions

fn default_environment() -> String {
    String::from("dev")
}

fn default_token_env() -> String {
    String::from(DEFAULT_TOKEN_ENV)
}

const fn default_provider_timeout() -> u64 {
    30
}

const fn default_concurrency() -> usize {
    crate::planner::DEFAULT_MAX_CONCURRENCY
}

const fn default_max_attempts() -> u32 {
    4
}

const fn default_initial_delay_ms() -> u64 {
    500
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_poll_initial_ms() -> u64 {
    1_000
}

const fn default_poll_max_ms() -> u64 {
    15_000
}

const fn default_poll_timeout() -> u64 {
    600
}

const fn default_lock_ttl() -> u64 {
    crate::state::DEFAULT_LOCK_TTL_SECS
}

const fn default_lock_wait() -> u64 {
    60
}

const fn default_lock_poll_ms() -> u64 {
    1_000
}

fn default_desired_graph() -> String {
    String::from("graph.yaml")
}

const fn default_drift_interval() -> u64 {
    3_600
}

const fn default_watch_interval() -> u64 {
    5
}

const fn default_history_limit() -> usize {
    crate::pipeline::DEFAULT_HISTORY_LIMIT
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            endpoint: None,
            token_env: default_token_env(),
            timeout_secs: default_provider_timeout(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_concurrency(),
            checkpoint_each_batch: false,
            retry: RetryConfig::default(),
            poll: PollConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_poll_initial_ms(),
            max_interval_ms: default_poll_max_ms(),
            timeout_secs: default_poll_timeout(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lock_ttl(),
            wait_timeout_secs: default_lock_wait(),
            poll_interval_ms: default_lock_poll_ms(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            desired_graph: default_desired_graph(),
            drift_policy: DriftPolicy::default(),
            drift_interval_secs: default_drift_interval(),
            watch_interval_secs: default_watch_interval(),
            report_path: None,
            history_limit: default_history_limit(),
            refresh: false,
        }
    }
}

impl EngineConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Builds the pipeline settings for a lock holder.
    #[must_use]
    pub fn pipeline_settings(&self, holder: String) -> PipelineSettings {
        PipelineSettings {
            holder,
            lock_timeout: self.lock.wait_timeout(),
            drift_policy: self.pipeline.drift_policy,
            desired_graph_ref: self.pipeline.desired_graph.clone(),
            refresh: self.pipeline.refresh,
            history_limit: self.pipeline.history_limit,
        }
    }
}

impl ProviderConfig {
    /// Request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Reads the provider token from the configured environment variable.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env).ok().filter(|t| !t.is_empty())
    }
}

impl RetryConfig {
    /// The retry policy described by this section.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_delays(
                Duration::from_millis(self.initial_delay_ms),
                Duration::from_millis(self.max_delay_ms),
            )
    }
}

impl PollConfig {
    /// The polling policy described by this section.
    #[must_use]
    pub const fn policy(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_millis(self.initial_interval_ms),
            Duration::from_millis(self.max_interval_ms),
            Duration::from_secs(self.timeout_secs),
        )
    }
}

impl LockConfig {
    /// Lock lifetime.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// How long to wait for a held lock.
    #[must_use]
    pub const fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// How often to retry a held lock.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl PipelineConfig {
    /// Interval between drift checks, `None` when disabled.
    #[must_use]
    pub const fn drift_interval(&self) -> Option<Duration> {
        if self.drift_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.drift_interval_secs))
        }
    }

    /// Interval between desired graph file checks.
    #[must_use]
    pub const fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs)
    }
}

impl SchemaConfig {
    /// Built-in schemas with configured overrides applied.
    #[must_use]
    pub fn registry(&self) -> SchemaRegistry {
        let mut registry = SchemaRegistry::builtin().with_strict(self.strict);
        for (resource_type, schema) in &self.resource_types {
            registry.register(resource_type.clone(), schema.clone());
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ReplacementStrategy;

    fn minimal() -> EngineConfig {
        serde_yaml::from_str("project:\n  name: demo\n").expect("parse")
    }

    #[test]
    fn test_defaults_fill_every_section() {
        let config = minimal();
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.provider.kind, ProviderKind::Memory);
        assert_eq!(config.provider.token_env, DEFAULT_TOKEN_ENV);
        assert_eq!(config.executor.max_concurrency, 8);
        assert_eq!(config.lock.ttl(), Duration::from_secs(300));
        assert_eq!(config.pipeline.drift_policy, DriftPolicy::ReportOnly);
        assert_eq!(config.pipeline.drift_interval(), Some(Duration::from_secs(3600)));
        assert_eq!(config.qualified_name(), "demo-dev");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_derive_validation_rejects_out_of_range() {
        let mut config = minimal();
        config.executor.max_concurrency = 0;
        config.provider.endpoint = Some(String::from("not a url"));

        let errors = config.validate().expect_err("invalid");
        let fields = errors.errors();
        assert!(fields.contains_key("executor"));
        assert!(fields.contains_key("provider"));
    }

    #[test]
    fn test_policies_from_config() {
        let config = minimal();
        assert_eq!(config.executor.retry.policy(), RetryPolicy::default());
        assert_eq!(config.executor.poll.policy(), PollPolicy::default());
    }

    #[test]
    fn test_schema_overrides() {
        let yaml = r"
project:
  name: demo
schema:
  strict: true
  resource_types:
    instance:
      required: [ami]
      immutable: [ami]
      computed: [id]
      replacement: create_before_delete
    queue:
      required: [name]
";
        let config: EngineConfig = serde_yaml::from_str(yaml).expect("parse");
        let registry = config.schema.registry();
        assert!(registry.get("queue").is_some());
        assert!(registry.get("vpc").is_some());
        assert_eq!(
            registry.schema_for("instance").replacement_strategy(),
            ReplacementStrategy::CreateBeforeDelete
        );
    }

    #[test]
    fn test_drift_interval_zero_disables() {
        let mut config = minimal();
        config.pipeline.drift_interval_secs = 0;
        assert_eq!(config.pipeline.drift_interval(), None);
    }
}
