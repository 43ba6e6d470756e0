//! Backend adapters for live deployment targets.
//!
//! - [`vm`]: vLLM on a self-managed virtual machine
//! - [`endpoint`]: TGI on a managed inference endpoint
//! - [`hosted`]: a third-party chat completion API
//!
//! Whatever goes wrong while answering, these adapters answer something:
//! a failed call becomes the fixed apology, in the requested mode.

pub mod endpoint;
pub mod hosted;
pub mod vm;

pub use endpoint::{EndpointBackend, EndpointBackendFactory, ENDPOINT_BACKEND};
pub use hosted::{HostedBackend, HostedBackendFactory, HOSTED_BACKEND};
pub use vm::{VmBackend, VmBackendFactory, VmClients, VM_BACKEND};

use futures::stream::{self, StreamExt};

use conductor_core::{Answer, AnswerMode, AnswerStream, ConfigError, InstanceName, APOLOGY};

use crate::clients::{ChatClient, ChatRequest, ClientError, DeltaStream};

/// Ask a chat client, falling back to the apology on any failure.
pub(crate) async fn chat_answer(
    chat: &dyn ChatClient,
    request: &ChatRequest,
    mode: AnswerMode,
    instance: &InstanceName,
) -> Answer {
    let result = match mode {
        AnswerMode::Buffered => chat.complete(request).await.map(Answer::Complete),
        AnswerMode::Streaming => chat
            .complete_stream(request)
            .await
            .map(|deltas| Answer::Stream(guard_deltas(instance.clone(), deltas))),
    };

    result.unwrap_or_else(|e| {
        tracing::warn!(instance = %instance, error = %e, "Answer failed, apologizing");
        Answer::apology(mode)
    })
}

/// Turn a fallible delta stream into an answer stream.
///
/// An error before the first delta yields the apology as the only
/// fragment; an error after it ends the stream.
pub(crate) fn guard_deltas(instance: InstanceName, deltas: DeltaStream) -> AnswerStream {
    stream::unfold((deltas, false, instance), |(mut deltas, started, instance)| async move {
        match deltas.next().await {
            Some(Ok(text)) => Some((text, (deltas, true, instance))),
            Some(Err(e)) => {
                tracing::warn!(instance = %instance, error = %e, "Answer stream failed");
                if started {
                    None
                } else {
                    let finished = stream::empty().boxed();
                    Some((APOLOGY.to_string(), (finished, true, instance)))
                }
            }
            None => None,
        }
    })
    .boxed()
}

/// Configuration problems found while wiring a client.
pub(crate) fn client_config_error(err: ClientError) -> ConfigError {
    ConfigError::ValidationError(err.to_string())
}
