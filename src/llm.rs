//! LLM transport: chat-completion wire types and the OpenAI-compatible client.

use crate::config::Settings;
use crate::error::{LlmError, Result};
use serde::{Deserialize, Serialize};

/// One conversation entry, in the canonical chat-completions shape.
///
/// The same struct is used in-memory, on the wire, and in the persisted
/// state file, so a history round-trips through JSON unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    /// Tool-role entry carrying the result of one tool invocation,
    /// correlated to the assistant's call by id.
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_call_id: Some(call_id.into()),
            tool_calls: None,
        }
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }
}

/// A normalised tool invocation attached to an assistant entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object, verbatim from the provider.
    pub arguments: String,
}

/// Assistant output of one completion call, before normalisation.
/// `tool_calls` is an Option because some providers send an explicit null
/// instead of omitting the field.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssistantResponse {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<RawToolCall>>,
}

/// Provider-shaped tool call. Some providers omit the `type` discriminator,
/// which other providers then reject on the way back in; normalisation
/// (in the decider) forces `type: "function"` on every entry.
#[derive(Debug, Clone, Deserialize)]
pub struct RawToolCall {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub function: FunctionCall,
}

/// Completion backend seam. The production implementation is
/// [`OpenAiClient`]; tests substitute a scripted fake.
#[async_trait::async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[serde_json::Value],
    ) -> Result<AssistantResponse>;
}

/// Client for any OpenAI-compatible chat-completions endpoint.
pub struct OpenAiClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(settings: &Settings) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: settings.llm_api_base.trim_end_matches('/').to_string(),
            api_key: settings.llm_api_key.clone(),
            model: settings.llm_model.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: AssistantResponse,
}

#[async_trait::async_trait]
impl CompletionBackend for OpenAiClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[serde_json::Value],
    ) -> Result<AssistantResponse> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "tools": tools,
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(LlmError::Request)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let parsed: CompletionResponse = response.json().await.map_err(LlmError::Request)?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| LlmError::EmptyResponse.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_role_entries_serialize_with_call_id() {
        let entry = ChatMessage::tool("call_1", "file contents");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call_1");
        assert!(json.get("tool_calls").is_none());
    }

    #[test]
    fn plain_entries_omit_tool_fields() {
        let json = serde_json::to_value(ChatMessage::user("hi")).unwrap();
        assert_eq!(
            json.as_object().unwrap().keys().collect::<Vec<_>>(),
            ["content", "role"]
        );
    }

    #[test]
    fn provider_response_tolerates_missing_type() {
        let raw = r#"{"content": null, "tool_calls": [
            {"id": "c1", "function": {"name": "read_file", "arguments": "{}"}}
        ]}"#;
        let parsed: AssistantResponse = serde_json::from_str(raw).unwrap();
        let calls = parsed.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, None);
        assert_eq!(calls[0].function.name, "read_file");
    }

    #[test]
    fn provider_response_tolerates_null_tool_calls() {
        let parsed: AssistantResponse =
            serde_json::from_str(r#"{"content": "hi", "tool_calls": null}"#).unwrap();
        assert!(parsed.tool_calls.is_none());
        assert_eq!(parsed.content.as_deref(), Some("hi"));
    }

    #[test]
    fn history_round_trips_through_json() {
        let history = vec![
            ChatMessage::system("You are helpful."),
            ChatMessage::user("say hi"),
            ChatMessage {
                role: "assistant".into(),
                content: "hi".into(),
                tool_call_id: None,
                tool_calls: None,
            },
        ];
        let encoded = serde_json::to_string(&history).unwrap();
        let decoded: Vec<ChatMessage> = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, history);
    }
}
