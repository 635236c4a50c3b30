//! LLM-backed conversational replies.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bunsen_core::{DeliveryId, ServiceType, ThreadState, CORRELATION_ID_HEADER};
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::config::{Config, LlmProvider};
use crate::recording::{create_http_client, RecordingLogger};

pub const SYSTEM_PROMPT: &str = "You are Dr. Bunsen Honeydew, the brilliant and friendly lead \
scientist at Muppet Labs. You are methodical and clear. You ask for clarification before \
jumping to conclusions. You never use emojis.";

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_REPLY_TOKENS: u32 = 1024;

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("LLM request failed: {0}")]
    Request(String),
    #[error("LLM API error: {status} - {body}")]
    Api { status: u16, body: String },
    #[error("LLM response contained no text")]
    EmptyResponse,
}

/// Produces the agent's reply to a thread.
#[async_trait]
pub trait ReplyResponder: Send + Sync {
    async fn generate_reply(
        &self,
        state: &ThreadState,
        correlation_id: Option<&str>,
    ) -> Result<String, ReplyError>;
}

/// The user prompt: issue, then the conversation so far.
pub fn build_prompt(agent_name: &str, state: &ThreadState) -> String {
    let history = state
        .context
        .entries
        .iter()
        .map(|entry| format!("**{}** said: {}", entry.author, entry.body))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Based on the following GitHub issue and its comments, provide a concise and helpful \
response. Understand the problem, propose a path forward, and ask clarifying questions if \
needed.\n\n---\nIssue Title: {}\nIssue Body: {}\n---\nConversation History:\n{}\n---\n\n\
Your response (as {}):",
        state.context.title,
        state.context.body.as_deref().unwrap_or(""),
        history,
        agent_name
    )
}

/// Hidden marker tying a posted reply to the delivery that caused it.
pub fn reply_marker(delivery_id: &DeliveryId) -> String {
    format!("<!-- bunsen:reply delivery={} -->", delivery_id)
}

/// The comment body actually posted to the issue.
pub fn format_reply(agent_name: &str, text: &str, delivery_id: &DeliveryId) -> String {
    format!(
        "**{}** said:\n\n{}\n\n{}",
        agent_name,
        text.trim(),
        reply_marker(delivery_id)
    )
}

fn with_correlation(builder: RequestBuilder, correlation_id: Option<&str>) -> RequestBuilder {
    match correlation_id {
        Some(cid) => builder.header(CORRELATION_ID_HEADER, cid),
        None => builder,
    }
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> Result<T, ReplyError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        error!("LLM API error: {} - {}", status, body);
        return Err(ReplyError::Api {
            status: status.as_u16(),
            body,
        });
    }
    response
        .json()
        .await
        .map_err(|e| ReplyError::Request(format!("failed to parse response: {}", e)))
}

fn non_empty(text: Option<String>) -> Result<String, ReplyError> {
    text.filter(|t| !t.trim().is_empty())
        .ok_or(ReplyError::EmptyResponse)
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// OpenAI-compatible `/v1/chat/completions`.
pub struct OpenAiResponder {
    client: ClientWithMiddleware,
    api_url: String,
    api_key: String,
    model: String,
    agent_name: String,
}

impl OpenAiResponder {
    pub fn new(
        client: ClientWithMiddleware,
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        agent_name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            agent_name: agent_name.into(),
        }
    }
}

#[async_trait]
impl ReplyResponder for OpenAiResponder {
    async fn generate_reply(
        &self,
        state: &ThreadState,
        correlation_id: Option<&str>,
    ) -> Result<String, ReplyError> {
        let prompt = build_prompt(&self.agent_name, state);
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
        };

        info!("Requesting reply for {} from {}", state.thread_id, self.model);

        let builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.api_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request);
        let response = with_correlation(builder, correlation_id)
            .send()
            .await
            .map_err(|e| ReplyError::Request(e.to_string()))?;

        let parsed: ChatCompletionResponse = read_json(response).await?;
        non_empty(
            parsed
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content),
        )
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

/// Anthropic `/v1/messages`.
pub struct AnthropicResponder {
    client: ClientWithMiddleware,
    api_url: String,
    api_key: String,
    model: String,
    agent_name: String,
}

impl AnthropicResponder {
    pub fn new(
        client: ClientWithMiddleware,
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        agent_name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            agent_name: agent_name.into(),
        }
    }
}

#[async_trait]
impl ReplyResponder for AnthropicResponder {
    async fn generate_reply(
        &self,
        state: &ThreadState,
        correlation_id: Option<&str>,
    ) -> Result<String, ReplyError> {
        let prompt = build_prompt(&self.agent_name, state);
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: MAX_REPLY_TOKENS,
            system: SYSTEM_PROMPT,
            messages: vec![ChatMessage {
                role: "user",
                content: &prompt,
            }],
        };

        info!("Requesting reply for {} from {}", state.thread_id, self.model);

        let builder = self
            .client
            .post(format!("{}/v1/messages", self.api_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request);
        let response = with_correlation(builder, correlation_id)
            .send()
            .await
            .map_err(|e| ReplyError::Request(e.to_string()))?;

        let parsed: MessagesResponse = read_json(response).await?;
        let text = parsed
            .content
            .into_iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");
        non_empty(Some(text))
    }
}

pub fn create_responder(
    config: &Config,
    recording_logger: Option<RecordingLogger>,
) -> Result<Arc<dyn ReplyResponder>> {
    let client = create_http_client(recording_logger, ServiceType::Llm)?;
    let responder: Arc<dyn ReplyResponder> = match config.llm_provider {
        LlmProvider::OpenAi => Arc::new(OpenAiResponder::new(
            client,
            &config.llm_api_url,
            &config.llm_api_key,
            &config.llm_model,
            &config.agent_name,
        )),
        LlmProvider::Anthropic => Arc::new(AnthropicResponder::new(
            client,
            &config.llm_api_url,
            &config.llm_api_key,
            &config.llm_model,
            &config.agent_name,
        )),
    };
    Ok(responder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bunsen_core::{ConversationEntry, ThreadId};
    use chrono::{TimeZone, Utc};
    use httpmock::prelude::*;
    use serde_json::json;

    fn thread() -> ThreadState {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let mut state = ThreadState::new(ThreadId::new("acme", "widgets", 7), at);
        state.context.title = "Frobnicator jams".to_string();
        state.context.body = Some("It jams on Tuesdays.".to_string());
        state.context.push(
            ConversationEntry {
                author: "kermit".to_string(),
                body: "@bunsen any ideas?".to_string(),
                comment_id: Some(1),
                at,
            },
            50,
        );
        state
    }

    fn client() -> ClientWithMiddleware {
        create_http_client(None, ServiceType::Llm).unwrap()
    }

    #[test]
    fn test_prompt_includes_history() {
        let prompt = build_prompt("bunsen", &thread());
        assert!(prompt.contains("Issue Title: Frobnicator jams"));
        assert!(prompt.contains("Issue Body: It jams on Tuesdays."));
        assert!(prompt.contains("**kermit** said: @bunsen any ideas?"));
        assert!(prompt.ends_with("Your response (as bunsen):"));
    }

    #[test]
    fn test_format_reply() {
        insta::assert_snapshot!(
            format_reply("bunsen", "  Have you tried oiling it?\n", &DeliveryId::new("abc-123")),
            @r"
        **bunsen** said:

        Have you tried oiling it?

        <!-- bunsen:reply delivery=abc-123 -->
        "
        );
    }

    #[tokio::test]
    async fn test_openai_reply() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer sk-test")
                .json_body_includes(r#"{"model": "gpt-4o-mini"}"#);
            then.status(200).json_body(json!({
                "choices": [{"message": {"role": "assistant", "content": "Oil it."}}]
            }));
        });

        let responder =
            OpenAiResponder::new(client(), server.base_url(), "sk-test", "gpt-4o-mini", "bunsen");
        let reply = responder.generate_reply(&thread(), None).await.unwrap();

        mock.assert();
        assert_eq!(reply, "Oil it.");
    }

    #[tokio::test]
    async fn test_anthropic_reply() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/messages")
                .header("x-api-key", "ak-test")
                .header("anthropic-version", ANTHROPIC_VERSION);
            then.status(200).json_body(json!({
                "content": [
                    {"type": "text", "text": "Meep "},
                    {"type": "text", "text": "meep."}
                ]
            }));
        });

        let responder = AnthropicResponder::new(
            client(),
            server.base_url(),
            "ak-test",
            "claude-3-5-haiku-latest",
            "bunsen",
        );
        let reply = responder.generate_reply(&thread(), None).await.unwrap();

        mock.assert();
        assert_eq!(reply, "Meep meep.");
    }

    #[tokio::test]
    async fn test_api_errors_and_empty_replies() {
        let server = MockServer::start();
        let mut mock = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(429).body("slow down");
        });

        let responder =
            OpenAiResponder::new(client(), server.base_url(), "sk-test", "gpt-4o-mini", "bunsen");
        match responder.generate_reply(&thread(), None).await {
            Err(ReplyError::Api { status, body }) => {
                assert_eq!(status, 429);
                assert_eq!(body, "slow down");
            }
            other => panic!("expected API error, got {:?}", other),
        }
        mock.delete();

        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .json_body(json!({"choices": [{"message": {"content": "   "}}]}));
        });
        assert!(matches!(
            responder.generate_reply(&thread(), None).await,
            Err(ReplyError::EmptyResponse)
        ));
    }
}
