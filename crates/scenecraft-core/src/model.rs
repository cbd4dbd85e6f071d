//! Model service interface
//!
//! Stages talk to language models only through [`ModelService`]. A request
//! names the [`Persona`] (model identifier + temperature) it wants, carries
//! the conversation, an optional image on the user message, and, for the
//! tool agent, the capability schemas the model may call.

use crate::capability::CapabilityDescriptor;
use crate::imaging::ImagePayload;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Model identifier and sampling temperature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub model: String,
    pub temperature: f32,
}

impl Persona {
    #[inline]
    #[must_use]
    pub fn new(model: impl Into<String>, temperature: f32) -> Self {
        Self {
            model: model.into(),
            temperature,
        }
    }
}

/// The personas each stage uses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Personas {
    /// Multimodal analysis of an image
    pub vision: Persona,
    /// Text-only scene description
    pub vision_text: Persona,
    /// Relational planning
    pub planner: Persona,
    /// First-pass code generation
    pub coder: Persona,
    /// Feedback-pass code revision
    pub coder_feedback: Persona,
    /// Tool-calling agent
    pub tool_agent: Persona,
}

impl Default for Personas {
    fn default() -> Self {
        Self {
            vision: Persona::new("llama4:maverick", 0.9),
            vision_text: Persona::new("llama4:maverick", 0.5),
            planner: Persona::new("llama4:maverick", 0.0),
            coder: Persona::new("llama4:maverick", 0.9),
            coder_feedback: Persona::new("qwen3:235b", 0.9),
            tool_agent: Persona::new("qwen3:235b", 0.0),
        }
    }
}

impl Personas {
    /// Iterate `(role, persona)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Persona)> {
        [
            ("vision", &self.vision),
            ("vision_text", &self.vision_text),
            ("planner", &self.planner),
            ("coder", &self.coder),
            ("coder_feedback", &self.coder_feedback),
            ("tool_agent", &self.tool_agent),
        ]
        .into_iter()
    }
}

/// Why a request is made; used for logging and by test doubles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPurpose {
    VisionAnalysis,
    VisionComparison,
    Planning,
    CodeGeneration,
    CodeRevision,
    ToolAgent,
}

impl fmt::Display for CallPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallPurpose::VisionAnalysis => "vision analysis",
            CallPurpose::VisionComparison => "vision comparison",
            CallPurpose::Planning => "planning",
            CallPurpose::CodeGeneration => "code generation",
            CallPurpose::CodeRevision => "code revision",
            CallPurpose::ToolAgent => "tool agent",
        };
        f.write_str(name)
    }
}

/// Conversation roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// One conversation message
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Image attached to a user message
    pub image: Option<ImagePayload>,
    /// Tool calls made by an assistant message
    pub tool_calls: Vec<ToolCall>,
    /// Capability name answered by a tool message
    pub tool_name: Option<String>,
}

impl ChatMessage {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            image: None,
            tool_calls: Vec::new(),
            tool_name: None,
        }
    }

    /// User message with an attached image
    #[must_use]
    pub fn user_with_image(content: impl Into<String>, image: ImagePayload) -> Self {
        Self {
            image: Some(image),
            ..Self::user(content)
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            tool_calls,
            ..Self::user(content)
        }
    }

    /// Result of a tool call, fed back to the model
    #[must_use]
    pub fn tool(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            tool_name: Some(name.into()),
            ..Self::user(content)
        }
    }
}

/// Chat request
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub persona: Persona,
    pub purpose: CallPurpose,
    pub messages: Vec<ChatMessage>,
    /// Capabilities the model may call; empty for plain completions
    pub tools: Vec<CapabilityDescriptor>,
}

impl ChatRequest {
    /// Single text-only prompt
    #[must_use]
    pub fn text(persona: &Persona, purpose: CallPurpose, prompt: impl Into<String>) -> Self {
        Self {
            persona: persona.clone(),
            purpose,
            messages: vec![ChatMessage::user(prompt)],
            tools: Vec::new(),
        }
    }

    /// Single prompt with one image
    #[must_use]
    pub fn multimodal(
        persona: &Persona,
        purpose: CallPurpose,
        prompt: impl Into<String>,
        image: ImagePayload,
    ) -> Self {
        Self {
            persona: persona.clone(),
            purpose,
            messages: vec![ChatMessage::user_with_image(prompt, image)],
            tools: Vec::new(),
        }
    }

    /// Whether any message carries an image
    #[must_use]
    pub fn has_image(&self) -> bool {
        self.messages.iter().any(|m| m.image.is_some())
    }

    /// Text of the first user message
    #[must_use]
    pub fn prompt(&self) -> &str {
        self.messages
            .iter()
            .find(|m| m.role == Role::User)
            .map_or("", |m| m.content.as_str())
    }
}

/// Chat reply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatReply {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ChatReply {
    /// Plain text reply
    #[inline]
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    /// Reply requesting tool calls
    #[inline]
    #[must_use]
    pub fn calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: String::new(),
            tool_calls,
        }
    }
}

/// Errors reported by a model service
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Request never reached the service
    #[error("transport error: {0}")]
    Transport(String),

    /// Service answered with an error status
    #[error("service returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// Reply could not be decoded
    #[error("undecodable reply: {0}")]
    Decode(String),
}

/// Language model inference service
#[async_trait]
pub trait ModelService: Send + Sync {
    /// Run one chat completion
    async fn chat(&self, request: ChatRequest) -> Result<ChatReply, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_personas_follow_stage_roles() {
        let personas = Personas::default();
        assert!((personas.planner.temperature - 0.0).abs() < f32::EPSILON);
        assert!((personas.vision_text.temperature - 0.5).abs() < f32::EPSILON);
        assert_eq!(personas.tool_agent.model, "qwen3:235b");
        assert_eq!(personas.iter().count(), 6);
    }

    #[test]
    fn text_request_has_no_image() {
        let req = ChatRequest::text(&Persona::new("m", 0.1), CallPurpose::Planning, "plan it");
        assert!(!req.has_image());
        assert_eq!(req.prompt(), "plan it");
        assert!(req.tools.is_empty());
    }

    #[test]
    fn multimodal_request_carries_image() {
        let image = ImagePayload::png_base64("aGVsbG8=");
        let req = ChatRequest::multimodal(
            &Persona::new("m", 0.9),
            CallPurpose::VisionAnalysis,
            "describe",
            image,
        );
        assert!(req.has_image());
    }

    #[test]
    fn tool_message_names_capability() {
        let msg = ChatMessage::tool("execute_blender_code", "ok");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_name.as_deref(), Some("execute_blender_code"));
    }
}
