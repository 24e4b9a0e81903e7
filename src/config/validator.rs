//! Configuration validation.
//!
//! Structural checks (ranges, lengths, URLs) come from the `validator`
//! derive on the config types; this module adds the cross-field rules and
//! collects both into one [`ValidationResult`].

use std::path::Path;
use tracing::debug;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

use crate::error::{ConfigError, Result};

use super::spec::{
    EngineConfig, ExecutorConfig, LockConfig, PipelineConfig, ProjectConfig, ProviderConfig,
    ProviderKind, SchemaConfig, StateBackend, StateConfig,
};

/// Validator for engine configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates an engine configuration.
    ///
    /// # Errors
    ///
    /// Returns the first error found; warnings never fail validation.
    pub fn validate(&self, config: &EngineConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!(
                "Configuration validation passed with {} warnings",
                result.warning_count()
            );
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }
            .into())
        }
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, config: &EngineConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        if let Err(errors) = config.validate() {
            collect_derive_errors("", &errors, &mut result);
        }

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_provider(&config.provider, &mut result);
        Self::validate_executor(&config.executor, &mut result);
        Self::validate_lock(&config.lock, &mut result);
        Self::validate_pipeline(&config.pipeline, &mut result);
        Self::validate_schema(&config.schema, &mut result);

        result
    }

    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if !project.name.is_empty() && !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
                if state.path.is_some() {
                    result.warn("state.path is ignored by the s3 backend");
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result.warn("state.bucket is ignored by the local backend");
                }
            }
        }

        if state.expected_lineage.as_ref().is_some_and(String::is_empty) {
            result.error("state.expected_lineage", "Expected lineage cannot be empty");
        }
    }

    fn validate_provider(provider: &ProviderConfig, result: &mut ValidationResult) {
        match provider.kind {
            ProviderKind::Http => {
                if provider.endpoint.is_none() {
                    result.error(
                        "provider.endpoint",
                        "An endpoint is required for the http provider",
                    );
                }
                if provider.token().is_none() {
                    result.warn(format!(
                        "{} is not set; provider requests will be unauthenticated",
                        provider.token_env
                    ));
                }
            }
            ProviderKind::Memory => {
                if provider.endpoint.is_some() {
                    result.warn("provider.endpoint is ignored by the memory provider");
                }
            }
        }
    }

    fn validate_executor(executor: &ExecutorConfig, result: &mut ValidationResult) {
        if executor.retry.initial_delay_ms > executor.retry.max_delay_ms {
            result.error(
                "executor.retry.initial_delay_ms",
                "Initial retry delay cannot exceed max_delay_ms",
            );
        }
        if executor.poll.initial_interval_ms > executor.poll.max_interval_ms {
            result.error(
                "executor.poll.initial_interval_ms",
                "Initial poll interval cannot exceed max_interval_ms",
            );
        }
    }

    fn validate_lock(lock: &LockConfig, result: &mut ValidationResult) {
        if lock.poll_interval_ms / 1000 >= lock.ttl_secs {
            result.error(
                "lock.poll_interval_ms",
                "Lock poll interval must be shorter than the lock ttl",
            );
        }
        if lock.wait_timeout_secs == 0 {
            result.warn("lock.wait_timeout_secs is 0; a held lock fails immediately");
        }
    }

    fn validate_pipeline(pipeline: &PipelineConfig, result: &mut ValidationResult) {
        let extension = Path::new(&pipeline.desired_graph)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        if !matches!(extension.as_deref(), Some("yaml" | "yml" | "json")) {
            result.error(
                "pipeline.desired_graph",
                format!(
                    "Desired graph '{}' must be a .yaml, .yml or .json file",
                    pipeline.desired_graph
                ),
            );
        }
        if pipeline.drift_interval().is_none() {
            result.warn("pipeline.drift_interval_secs is 0; scheduled drift checks are disabled");
        }
    }

    fn validate_schema(schema: &SchemaConfig, result: &mut ValidationResult) {
        for (resource_type, type_schema) in &schema.resource_types {
            let prefix = format!("schema.resource_types.{resource_type}");
            if !is_valid_type(resource_type) {
                result.error(
                    &prefix,
                    format!(
                        "Resource type '{resource_type}' is invalid. Must be lowercase alphanumeric with underscores."
                    ),
                );
            }
            for attribute in type_schema.required.intersection(&type_schema.computed) {
                result.error(
                    format!("{prefix}.required"),
                    format!("Attribute '{attribute}' cannot be both required and computed"),
                );
            }
            for attribute in type_schema.immutable.intersection(&type_schema.computed) {
                result.warn(format!(
                    "{prefix}: computed attribute '{attribute}' is also marked immutable"
                ));
            }
        }
    }
}

/// Flattens derive errors into dotted field paths.
fn collect_derive_errors(prefix: &str, errors: &ValidationErrors, result: &mut ValidationResult) {
    let mut fields: Vec<_> = errors.errors().iter().collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));

    for (field, kind) in fields {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            ValidationErrorsKind::Field(field_errors) => {
                for error in field_errors {
                    let message = error.message.as_ref().map_or_else(
                        || describe(error),
                        ToString::to_string,
                    );
                    result.error(&path, message);
                }
            }
            ValidationErrorsKind::Struct(nested) => collect_derive_errors(&path, nested, result),
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    collect_derive_errors(&format!("{path}[{index}]"), nested, result);
                }
            }
        }
    }
}

/// Renders a derive error without a custom message.
fn describe(error: &validator::ValidationError) -> String {
    let bound = |name: &str| error.params.get(name).map(ToString::to_string);
    match &*error.code {
        "range" => match (bound("min"), bound("max")) {
            (Some(min), Some(max)) => format!("Value must be between {min} and {max}"),
            (Some(min), None) => format!("Value must be at least {min}"),
            (None, Some(max)) => format!("Value must be at most {max}"),
            (None, None) => String::from("Value is out of range"),
        },
        "length" => match (bound("min"), bound("max")) {
            (Some(min), Some(max)) => format!("Length must be between {min} and {max}"),
            (Some(min), None) => format!("Length must be at least {min}"),
            (None, Some(max)) => format!("Length must be at most {max}"),
            (None, None) => String::from("Length is invalid"),
        },
        "url" => String::from("Value must be a valid URL"),
        code => format!("Failed '{code}' check"),
    }
}

/// Validates a project name: lowercase letters, digits and single hyphens,
/// starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    // First character must be a letter
    if !chars.next().is_some_and(|c| c.is_ascii_lowercase()) {
        return false;
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Validates a resource type name, e.g. `load_balancer`.
fn is_valid_type(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TerraceError;
    use crate::graph::ResourceTypeSchema;

    fn config(yaml: &str) -> EngineConfig {
        serde_yaml::from_str(yaml).expect("parse")
    }

    fn fields(result: &ValidationResult) -> Vec<&str> {
        result.errors.iter().map(|e| e.field.as_str()).collect()
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("web-stack"));
        assert!(is_valid_name("stack-123"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Web-Stack")); // uppercase
        assert!(!is_valid_name("123-stack")); // starts with number
        assert!(!is_valid_name("web_stack")); // underscore
        assert!(!is_valid_name("stack-")); // ends with hyphen
        assert!(!is_valid_name("web--stack")); // consecutive hyphens
    }

    #[test]
    fn test_minimal_config_is_valid() {
        let result = ConfigValidator::new()
            .validate(&config("project:\n  name: demo\n"))
            .expect("valid");
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_s3_requires_bucket() {
        let result = ConfigValidator::new().check(&config(
            "project:\n  name: demo\nstate:\n  backend: s3\n",
        ));
        assert_eq!(fields(&result), vec!["state.bucket"]);
    }

    #[test]
    fn test_http_requires_endpoint() {
        let yaml = "project:\n  name: demo\nprovider:\n  kind: http\n  token_env: TERRACE_TEST_UNSET_TOKEN\n";
        let err = ConfigValidator::new().validate(&config(yaml)).expect_err("invalid");
        assert!(matches!(
            err,
            TerraceError::Config(ConfigError::ValidationError { field: Some(ref f), .. }) if f == "provider.endpoint"
        ));
    }

    #[test]
    fn test_derive_errors_have_dotted_paths() {
        let yaml = "project:\n  name: demo\nexecutor:\n  max_concurrency: 0\n  retry:\n    max_attempts: 0\n";
        let result = ConfigValidator::new().check(&config(yaml));
        let fields = fields(&result);
        assert!(fields.contains(&"executor.max_concurrency"));
        assert!(fields.contains(&"executor.retry.max_attempts"));
        assert!(result.errors[0].message.contains("between"));
    }

    #[test]
    fn test_cross_field_rules() {
        let yaml = r"
project:
  name: demo
executor:
  retry:
    initial_delay_ms: 5000
    max_delay_ms: 100
pipeline:
  desired_graph: graph.txt
  drift_interval_secs: 0
";
        let result = ConfigValidator::new().check(&config(yaml));
        let fields = fields(&result);
        assert!(fields.contains(&"executor.retry.initial_delay_ms"));
        assert!(fields.contains(&"pipeline.desired_graph"));
        assert_eq!(result.warning_count(), 1);
    }

    #[test]
    fn test_schema_rules() {
        let mut cfg = config("project:\n  name: demo\n");
        cfg.schema.resource_types.insert(
            String::from("Queue"),
            ResourceTypeSchema::new().required(&["arn"]).computed(&["arn"]),
        );
        let result = ConfigValidator::new().check(&cfg);
        assert_eq!(
            fields(&result),
            vec!["schema.resource_types.Queue", "schema.resource_types.Queue.required"]
        );
    }
}
