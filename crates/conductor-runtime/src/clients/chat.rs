//! OpenAI-compatible chat completion client.
//!
//! Talks to any server exposing `POST {base_url}/chat/completions`: the
//! hosted OpenAI API as well as vLLM's OpenAI-compatible server. Each
//! adapter owns its own client; there is no process-wide API state.
//!
//! ## Security
//!
//! The API key and organization are held as [`ApiCredential`]s and only
//! exposed when the request headers are set.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::secrets::ApiCredential;
use super::{ChatClient, ClientError, DeltaStream};
use crate::codec::chat_deltas;

/// Default base URL of the hosted API.
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// One chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A chat completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

impl ChatRequest {
    /// A single-turn request with one user message.
    pub fn single(model: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![ChatMessage::user(query)],
        }
    }
}

/// Wire format of a completion request.
#[derive(Debug, Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

/// Wire format of a buffered completion response.
#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat client over reqwest.
pub struct OpenAiChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<ApiCredential>,
    organization: Option<ApiCredential>,
}

impl std::fmt::Debug for OpenAiChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiChatClient")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key)
            .field("organization", &self.organization)
            .finish()
    }
}

impl OpenAiChatClient {
    /// Create a client for `base_url` with a per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            organization: None,
        })
    }

    /// Authenticate with a bearer key.
    pub fn with_api_key(mut self, key: ApiCredential) -> Self {
        self.api_key = Some(key);
        self
    }

    /// Send an organization header.
    pub fn with_organization(mut self, organization: Option<ApiCredential>) -> Self {
        self.organization = organization;
        self
    }

    /// The configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response, ClientError> {
        let body = CompletionBody {
            model: &request.model,
            messages: &request.messages,
            stream,
        };

        let mut builder = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);

        // SECURITY: credentials are exposed only here, at the point of use
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose());
        }
        if let Some(org) = &self.organization {
            builder = builder.header("OpenAI-Organization", org.expose());
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatClient for OpenAiChatClient {
    async fn complete(&self, request: &ChatRequest) -> Result<String, ClientError> {
        let response: CompletionResponse = self.send(request, false).await?.json().await?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ClientError::Decode("completion had no content".to_string()))
    }

    async fn complete_stream(&self, request: &ChatRequest) -> Result<DeltaStream, ClientError> {
        let bytes = self
            .send(request, true)
            .await?
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(ClientError::from))
            .boxed();
        Ok(chat_deltas(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalized() {
        let client = OpenAiChatClient::new("http://10.0.0.1:8000/v1/", Duration::from_secs(60)).unwrap();
        assert_eq!(client.base_url(), "http://10.0.0.1:8000/v1");
    }

    #[test]
    fn test_debug_redacts_key() {
        let secret = "sk-do-not-print";
        let client = OpenAiChatClient::new(OPENAI_BASE_URL, Duration::from_secs(60))
            .unwrap()
            .with_api_key(ApiCredential::new(secret, "OpenAI API key"));

        let debug = format!("{:?}", client);
        assert!(!debug.contains(secret));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_request_body_shape() {
        let request = ChatRequest::single("gpt-4-1106-preview", "hello");
        let body = CompletionBody {
            model: &request.model,
            messages: &request.messages,
            stream: true,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "model": "gpt-4-1106-preview",
                "messages": [{"role": "user", "content": "hello"}],
                "stream": true
            })
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_is_an_error() {
        let client = OpenAiChatClient::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let result = client.complete(&ChatRequest::single("m", "q")).await;
        assert!(matches!(result, Err(ClientError::Http(_))));
    }
}
