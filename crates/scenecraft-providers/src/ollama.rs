//! Ollama chat client
//!
//! One non-streaming `POST /api/chat` per request. Deadlines and retries are
//! applied by the caller's call guard, so this client makes exactly one
//! attempt and classifies the outcome.

use async_trait::async_trait;
use reqwest::Client;
use scenecraft_core::{
    CapabilityDescriptor, ChatMessage, ChatReply, ChatRequest, ModelError, ModelService, Role,
    ToolCall,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const CHAT_ENDPOINT: &str = "/api/chat";

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

impl OllamaClient {
    /// Client for the server at `base_url`, e.g. `http://localhost:11434`
    ///
    /// # Errors
    /// `ModelError::Transport` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ModelError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ModelError::Transport(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    stream: bool,
    options: WireOptions,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
}

#[derive(Debug, Serialize)]
struct WireOptions {
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: Role,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction<'a>,
}

#[derive(Debug, Serialize)]
struct WireFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    message: WireMessage,
}

impl From<&ChatMessage> for WireMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role,
            content: msg.content.clone(),
            images: msg
                .image
                .iter()
                .map(|image| image.data_base64.clone())
                .collect(),
            tool_calls: msg
                .tool_calls
                .iter()
                .map(|call| WireToolCall {
                    function: WireFunctionCall {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                })
                .collect(),
            tool_name: msg.tool_name.clone(),
        }
    }
}

impl<'a> From<&'a CapabilityDescriptor> for WireTool<'a> {
    fn from(tool: &'a CapabilityDescriptor) -> Self {
        Self {
            kind: "function",
            function: WireFunction {
                name: &tool.name,
                description: &tool.description,
                parameters: &tool.input_schema,
            },
        }
    }
}

fn build_payload(request: &ChatRequest) -> WireRequest<'_> {
    WireRequest {
        model: &request.persona.model,
        messages: request.messages.iter().map(WireMessage::from).collect(),
        stream: false,
        options: WireOptions {
            temperature: request.persona.temperature,
        },
        tools: request.tools.iter().map(WireTool::from).collect(),
    }
}

fn parse_reply(response: WireResponse) -> ChatReply {
    ChatReply {
        content: response.message.content,
        tool_calls: response
            .message
            .tool_calls
            .into_iter()
            .map(|call| ToolCall {
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect(),
    }
}

#[async_trait]
impl ModelService for OllamaClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatReply, ModelError> {
        let url = format!("{}{CHAT_ENDPOINT}", self.base_url);
        let payload = build_payload(&request);
        tracing::debug!(
            model = %request.persona.model,
            messages = payload.messages.len(),
            tools = payload.tools.len(),
            "sending chat request to Ollama"
        );

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ModelError::Transport(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%status, "Ollama returned an error status");
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: WireResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Decode(e.to_string()))?;
        let reply = parse_reply(body);
        tracing::debug!(
            chars = reply.content.len(),
            tool_calls = reply.tool_calls.len(),
            "Ollama reply received"
        );
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenecraft_core::{CallPurpose, ImagePayload, Persona};
    use serde_json::json;

    #[test]
    fn payload_carries_persona_images_and_tools() {
        let persona = Persona::new("llama4:maverick", 0.9);
        let mut request = ChatRequest::multimodal(
            &persona,
            CallPurpose::VisionAnalysis,
            "describe",
            ImagePayload::png_base64("aGVsbG8="),
        );
        request.tools = vec![CapabilityDescriptor::new("execute_blender_code")
            .with_description("run code")];

        let value = serde_json::to_value(build_payload(&request)).unwrap();
        assert_eq!(value["model"], "llama4:maverick");
        assert_eq!(value["stream"], false);
        assert!((value["options"]["temperature"].as_f64().unwrap() - 0.9).abs() < 1e-6);
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(value["messages"][0]["images"][0], "aGVsbG8=");
        assert_eq!(value["tools"][0]["type"], "function");
        assert_eq!(value["tools"][0]["function"]["name"], "execute_blender_code");
    }

    #[test]
    fn tool_turns_are_encoded() {
        let persona = Persona::new("qwen3:235b", 0.0);
        let mut request = ChatRequest::text(&persona, CallPurpose::ToolAgent, "go");
        request.messages.push(ChatMessage::assistant(
            "",
            vec![ToolCall {
                name: "get_scene_info".into(),
                arguments: json!({}),
            }],
        ));
        request.messages.push(ChatMessage::tool("get_scene_info", "empty scene"));

        let value = serde_json::to_value(build_payload(&request)).unwrap();
        assert_eq!(value["messages"][1]["tool_calls"][0]["function"]["name"], "get_scene_info");
        assert_eq!(value["messages"][2]["role"], "tool");
        assert_eq!(value["messages"][2]["tool_name"], "get_scene_info");
        assert!(value.get("tools").is_none());
    }

    #[test]
    fn reply_with_tool_calls_is_parsed() {
        let raw = json!({
            "model": "qwen3:235b",
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [
                    { "function": { "name": "execute_blender_code", "arguments": { "code": "x = 1" } } }
                ]
            },
            "done": true
        });
        let reply = parse_reply(serde_json::from_value(raw).unwrap());
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].arguments["code"], "x = 1");
    }
}
