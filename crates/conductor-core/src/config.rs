//! Orchestrator configuration parsing and validation.
//!
//! A configuration document has exactly two members: `orchestrator` (the
//! router's backend config) and `experts` (one backend config per expert,
//! each carrying a unique `expert_id`). Backend configs are opaque maps;
//! backend-specific fields are only checked when an adapter reads them.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while loading or interpreting configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for '{field}': expected {expected}")]
    InvalidField {
        field: String,
        expected: &'static str,
    },

    #[error("Unknown backend kind: '{kind}'. Available: {available:?}")]
    UnknownBackend {
        kind: String,
        available: Vec<String>,
    },

    #[error("Duplicate expert id: {0}")]
    DuplicateExpertId(ExpertId),

    #[error("Two backends resolve to the same resource '{0}'; derived names must be unique")]
    DuplicateResource(String),

    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

/// Identifier of an expert in the orchestrator's mapping.
///
/// Configs may spell it as an integer or a string; both normalize to the
/// same textual form so that router output (always text) can be matched
/// against it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ExpertId(String);

impl ExpertId {
    /// Create an expert id from any textual form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Interpret router output as an expert id.
    pub fn parse(raw: &str) -> Self {
        Self(raw.trim().to_string())
    }

    /// The textual id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExpertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ExpertId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<&str> for ExpertId {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<u64> for ExpertId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for ExpertId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Int(n) => Self(n.to_string()),
            Raw::Text(s) => Self::parse(&s),
        })
    }
}

/// Configuration for a single backend adapter.
///
/// Carries at least `model_id` and `backend`. Adapters may record observed
/// runtime state (addresses, endpoint names) back into their own copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendConfig(Map<String, JsonValue>);

impl BackendConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config from a JSON value, which must be an object.
    pub fn from_value(value: JsonValue) -> Result<Self, ConfigError> {
        match value {
            JsonValue::Object(map) => Ok(Self(map)),
            _ => Err(ConfigError::InvalidField {
                field: "backend config".to_string(),
                expected: "an object",
            }),
        }
    }

    /// Builder-style setter.
    pub fn with(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.set(key, value);
        self
    }

    /// The model identifier.
    pub fn model_id(&self) -> Result<&str, ConfigError> {
        self.require_str("model_id")
    }

    /// The backend kind selector.
    pub fn backend(&self) -> Result<&str, ConfigError> {
        self.require_str("backend")
    }

    /// The expert id, for expert configs.
    pub fn expert_id(&self) -> Result<ExpertId, ConfigError> {
        let raw = self
            .0
            .get("expert_id")
            .ok_or_else(|| ConfigError::MissingField("expert_id".to_string()))?;
        ExpertId::deserialize(raw).map_err(|_| ConfigError::InvalidField {
            field: "expert_id".to_string(),
            expected: "an integer or a string",
        })
    }

    /// Raw access to a field.
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    /// Whether a field is present.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// A string field, if present and a string.
    pub fn str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(JsonValue::as_str)
    }

    /// A required string field.
    pub fn require_str(&self, key: &str) -> Result<&str, ConfigError> {
        match self.0.get(key) {
            None | Some(JsonValue::Null) => Err(ConfigError::MissingField(key.to_string())),
            Some(JsonValue::String(s)) => Ok(s),
            Some(_) => Err(ConfigError::InvalidField {
                field: key.to_string(),
                expected: "a string",
            }),
        }
    }

    /// A string field with a default.
    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> Result<&'a str, ConfigError> {
        match self.0.get(key) {
            None | Some(JsonValue::Null) => Ok(default),
            Some(_) => self.require_str(key),
        }
    }

    /// An unsigned integer field with a default.
    pub fn u64_or(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        match self.0.get(key) {
            None | Some(JsonValue::Null) => Ok(default),
            Some(v) => v.as_u64().ok_or_else(|| ConfigError::InvalidField {
                field: key.to_string(),
                expected: "a non-negative integer",
            }),
        }
    }

    /// A float field with a default.
    pub fn f64_or(&self, key: &str, default: f64) -> Result<f64, ConfigError> {
        match self.0.get(key) {
            None | Some(JsonValue::Null) => Ok(default),
            Some(v) => v.as_f64().ok_or_else(|| ConfigError::InvalidField {
                field: key.to_string(),
                expected: "a number",
            }),
        }
    }

    /// A boolean field with a default.
    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.0.get(key) {
            None | Some(JsonValue::Null) => Ok(default),
            Some(v) => v.as_bool().ok_or_else(|| ConfigError::InvalidField {
                field: key.to_string(),
                expected: "a boolean",
            }),
        }
    }

    /// A list-of-strings field with a default.
    pub fn str_list_or(&self, key: &str, default: &[&str]) -> Result<Vec<String>, ConfigError> {
        let invalid = || ConfigError::InvalidField {
            field: key.to_string(),
            expected: "a list of strings",
        };
        match self.0.get(key) {
            None | Some(JsonValue::Null) => Ok(default.iter().map(|s| s.to_string()).collect()),
            Some(JsonValue::Array(items)) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string).ok_or_else(invalid))
                .collect(),
            Some(_) => Err(invalid()),
        }
    }

    /// Record a field, replacing any previous value.
    pub fn set(&mut self, key: &str, value: impl Into<JsonValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Remove a field.
    pub fn remove(&mut self, key: &str) -> Option<JsonValue> {
        self.0.remove(key)
    }

    /// The underlying JSON map.
    pub fn as_map(&self) -> &Map<String, JsonValue> {
        &self.0
    }
}

impl From<Map<String, JsonValue>> for BackendConfig {
    fn from(map: Map<String, JsonValue>) -> Self {
        Self(map)
    }
}

/// The full orchestrator configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Router backend
    pub orchestrator: BackendConfig,

    /// Expert backends
    pub experts: Vec<BackendConfig>,
}

impl OrchestratorConfig {
    /// Parse a config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: OrchestratorConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: OrchestratorConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Parse a config file, choosing the format from its extension.
    ///
    /// `.yaml` and `.yml` are read as YAML; everything else as JSON.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_file(path),
            _ => Self::from_json_file(path),
        }
    }

    /// Validate the document structure.
    ///
    /// Only the fields every backend needs are checked here.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.orchestrator.model_id()?;
        self.orchestrator.backend()?;

        if self.experts.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one expert is required".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for expert in &self.experts {
            expert.model_id()?;
            expert.backend()?;
            let id = expert.expert_id()?;
            if !seen.insert(id.clone()) {
                return Err(ConfigError::DuplicateExpertId(id));
            }
        }

        Ok(())
    }
}
