//! Chat completions for the listwise rerank step.
//!
//! The reranker only needs one thing from a language model: a JSON reply to a
//! short system + user exchange. [`ChatModel`] is that seam; [`LlmClient`]
//! speaks the OpenAI-compatible wire format behind it.

use std::time::Duration;

use async_trait::async_trait;
use lodestone_core::{LlmConfig, LodestoneError};
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// One turn of the rerank exchange.
///
/// # Examples
///
/// ```
/// use lodestone_retrieval::llm::{ChatMessage, Role};
///
/// let msg = ChatMessage::user("Rank these passages");
/// assert!(matches!(msg.role, Role::User));
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    /// Instructions framing the ranking task.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// The query and numbered passages.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Speaker of a [`ChatMessage`], serialized lowercase.
///
/// ```
/// use lodestone_retrieval::llm::Role;
///
/// assert_eq!(serde_json::to_string(&Role::System).unwrap(), "\"system\"");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

/// A chat model that answers with a JSON document.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Send `messages` and return the text of the first choice.
    ///
    /// # Errors
    ///
    /// Returns [`LodestoneError::Llm`] on transport or response errors.
    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String, LodestoneError>;
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct Completion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Reply,
}

#[derive(Deserialize)]
struct Reply {
    content: Option<String>,
}

/// Rerank client for `/v1/chat/completions` on OpenAI or any compatible server.
///
/// Requests are deterministic (temperature 0) and ask for a JSON object reply.
///
/// # Examples
///
/// ```
/// use lodestone_core::LlmConfig;
/// use lodestone_retrieval::llm::LlmClient;
///
/// let client = LlmClient::new(&LlmConfig {
///     base_url: Some("http://localhost:8080/".into()),
///     ..LlmConfig::default()
/// })
/// .unwrap();
/// assert_eq!(client.endpoint(), "http://localhost:8080/v1/chat/completions");
/// ```
pub struct LlmClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl LlmClient {
    /// Build a client with the configured request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`LodestoneError::Llm`] if the TLS backend cannot initialize.
    pub fn new(config: &LlmConfig) -> Result<Self, LodestoneError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LodestoneError::Llm(format!("cannot build rerank HTTP client: {e}")))?;
        Ok(Self {
            http,
            config: config.clone(),
        })
    }

    /// Completions URL derived from `llm.base_url`.
    pub fn endpoint(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/v1/chat/completions")
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String, LodestoneError> {
        let request = CompletionRequest {
            model: &self.config.model,
            messages: &messages,
            temperature: 0.0,
            response_format: ResponseFormat { kind: "json_object" },
        };

        let mut builder = self.http.post(self.endpoint()).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| LodestoneError::Llm(format!("{} unreachable: {e}", self.config.model)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LodestoneError::Llm(format!(
                "{} returned {status}: {detail}",
                self.config.model
            )));
        }

        let completion: Completion = response
            .json()
            .await
            .map_err(|e| LodestoneError::Llm(format!("malformed completion: {e}")))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LodestoneError::Llm("completion has no message content".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_defaults_to_openai() {
        let client = LlmClient::new(&LlmConfig::default()).unwrap();
        assert_eq!(client.endpoint(), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn request_body_asks_for_json() {
        let messages = [ChatMessage::system("rank"), ChatMessage::user("q")];
        let body = serde_json::to_value(CompletionRequest {
            model: "m",
            messages: &messages,
            temperature: 0.0,
            response_format: ResponseFormat { kind: "json_object" },
        })
        .unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[test]
    fn empty_choices_parse() {
        let completion: Completion = serde_json::from_str("{}").unwrap();
        assert!(completion.choices.is_empty());
    }
}
