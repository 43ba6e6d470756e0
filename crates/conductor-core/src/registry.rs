//! Backend factory pattern for kind-based adapter construction.
//!
//! Each backend kind registers a factory under its selector string. The
//! orchestrator builds adapters by looking up the `backend` field of each
//! config here; an unknown selector fails construction.
//!
//! ## Usage
//!
//! ```ignore
//! let mut registry = BackendRegistry::with_defaults();
//! registry.register(Arc::new(HostedBackendFactory::default()));
//!
//! let expert = registry.build(config, Role::Expert)?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::{Backend, InstanceName, Role};
use crate::config::{BackendConfig, ConfigError};
use crate::fixed::{FixedExpertFactory, FixedRouterFactory};

/// Factory for creating backend adapters from configuration.
///
/// Implement this trait to add a new backend kind. Each factory is
/// responsible for:
/// 1. Validating the fields its adapter needs
/// 2. Creating adapter instances
/// 3. Naming the external resource its adapter will claim
pub trait BackendFactory: Send + Sync {
    /// Selector value used in the `backend` config field.
    ///
    /// Examples: "ec2_vllm_backend", "sagemaker_backend", "dummy_expert"
    fn backend_kind(&self) -> &'static str;

    /// Create an adapter from its config and derived instance name.
    fn create(
        &self,
        config: BackendConfig,
        instance_name: InstanceName,
    ) -> Result<Box<dyn Backend>, ConfigError>;

    /// Validate configuration without creating an adapter.
    fn validate_config(&self, config: &BackendConfig) -> Result<(), ConfigError> {
        config.model_id().map(|_| ())
    }

    /// Key of the external resource this config would claim, if any.
    ///
    /// Two adapters in one orchestrator must not share a key.
    fn resource_key(&self, _config: &BackendConfig, _instance_name: &InstanceName) -> Option<String> {
        None
    }

    /// Human-readable description of this backend kind.
    fn description(&self) -> &'static str {
        "Backend"
    }
}

/// Registry of available backend factories.
#[derive(Default)]
pub struct BackendRegistry {
    factories: BTreeMap<String, Arc<dyn BackendFactory>>,
}

impl BackendRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the fixed-response kinds registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(FixedRouterFactory));
        registry.register(Arc::new(FixedExpertFactory));
        registry
    }

    /// Register a backend factory.
    ///
    /// If a factory with the same kind already exists, it will be replaced.
    pub fn register(&mut self, factory: Arc<dyn BackendFactory>) {
        self.factories
            .insert(factory.backend_kind().to_string(), factory);
    }

    /// Build an adapter for `role` from its config.
    ///
    /// The derived instance name is written back into the config under
    /// `instance_name` before the factory sees it.
    pub fn build(
        &self,
        mut config: BackendConfig,
        role: Role,
    ) -> Result<Box<dyn Backend>, ConfigError> {
        let factory = self.factory_for(&config)?;
        let instance_name = InstanceName::derive(role, config.model_id()?);
        config.set("instance_name", instance_name.as_str());

        factory.validate_config(&config)?;
        factory.create(config, instance_name)
    }

    /// Validate a config against its kind's factory.
    pub fn validate(&self, config: &BackendConfig) -> Result<(), ConfigError> {
        self.factory_for(config)?.validate_config(config)
    }

    /// The resource key a config would claim under `role`.
    pub fn resource_key(
        &self,
        config: &BackendConfig,
        role: Role,
    ) -> Result<Option<String>, ConfigError> {
        let factory = self.factory_for(config)?;
        let instance_name = InstanceName::derive(role, config.model_id()?);
        Ok(factory.resource_key(config, &instance_name))
    }

    /// List registered backend kinds.
    pub fn available_kinds(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    /// Check if a backend kind is registered.
    pub fn has_backend(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Get the factory for a backend kind.
    pub fn get_factory(&self, kind: &str) -> Option<&Arc<dyn BackendFactory>> {
        self.factories.get(kind)
    }

    fn factory_for(&self, config: &BackendConfig) -> Result<&Arc<dyn BackendFactory>, ConfigError> {
        let kind = config.backend()?;
        self.factories
            .get(kind)
            .ok_or_else(|| ConfigError::UnknownBackend {
                kind: kind.to_string(),
                available: self.available_kinds().into_iter().map(String::from).collect(),
            })
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.available_kinds())
            .finish()
    }
}
