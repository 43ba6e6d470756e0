//! # conductor-runtime
//!
//! Live backends for Conductor.
//!
//! `conductor-core` only knows the lifecycle contract and the fixed-response
//! doubles. This crate adds the adapters that talk to real infrastructure:
//!
//! - `ec2_vllm_backend`: a vLLM server on a self-managed virtual machine
//! - `sagemaker_backend`: a TGI model on a managed inference endpoint
//! - `openai_backend`: a hosted chat completion API
//!
//! The cloud control planes are traits ([`ComputePlane`], [`EndpointPlane`]);
//! the VM and endpoint kinds are registered only when an implementation is
//! supplied.
//!
//! ## Example
//!
//! ```rust,ignore
//! use conductor_runtime::{default_registry, register_endpoints};
//!
//! let mut registry = default_registry();
//! register_endpoints(&mut registry, Arc::new(MyEndpointPlane::new()));
//!
//! let orchestrator = Orchestrator::from_config(&config, &registry)?;
//! ```

pub mod backends;
pub mod clients;
pub mod codec;
pub mod deploy;
pub mod session;

#[cfg(test)]
mod fakes;

use std::sync::Arc;

use conductor_core::{BackendRegistry, ConfigError};

pub use backends::{
    EndpointBackend, EndpointBackendFactory, HostedBackend, HostedBackendFactory, VmBackend,
    VmBackendFactory, VmClients, ENDPOINT_BACKEND, HOSTED_BACKEND, VM_BACKEND,
};
pub use clients::{
    ApiCredential, ChatClient, ClientError, ComputePlane, EndpointPlane,
    HttpProbe, OpenAiChatClient, RemoteShell, ReqwestProbe, ShellConnector, SshConnector,
};

/// Registry with the fixed-response and hosted-API kinds.
pub fn default_registry() -> BackendRegistry {
    let mut registry = BackendRegistry::with_defaults();
    registry.register(Arc::new(HostedBackendFactory));
    registry
}

/// Register the VM kind over a compute control plane.
pub fn register_vms(
    registry: &mut BackendRegistry,
    compute: Arc<dyn ComputePlane>,
) -> Result<(), ConfigError> {
    registry.register(Arc::new(VmBackendFactory::with_compute(compute)?));
    Ok(())
}

/// Register the managed endpoint kind over an endpoint control plane.
pub fn register_endpoints(registry: &mut BackendRegistry, plane: Arc<dyn EndpointPlane>) {
    registry.register(Arc::new(EndpointBackendFactory::new(plane)));
}
