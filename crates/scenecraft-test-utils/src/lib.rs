//! Testing utilities for SceneCraft workspace
//!
//! Scripted model, fake Blender capability provider and image fixtures.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use scenecraft_core::{
    CallPurpose, CapabilityDescriptor, CapabilityOutput, CapabilityProvider, ChatReply,
    ChatRequest, EngineConfig, ModelError, ModelService, ProviderError, Role, ToolCall,
    STANDARD_EXCLUSIONS,
};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub const EXECUTE_CODE: &str = "execute_blender_code";

const CODE_MARKER: &str = "Execute the following Blender Python code:\n";

type Responder = Arc<dyn Fn(&ChatRequest) -> Result<ChatReply, ModelError> + Send + Sync>;

/// Model double answering per call purpose
///
/// Defaults describe a red cube, plan it, emit cube code and drive the tool
/// agent through one `execute_blender_code` call per instruction.
#[derive(Clone)]
pub struct ScriptedModel {
    responders: Arc<Mutex<HashMap<CallPurpose, Responder>>>,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedModel {
    #[must_use]
    pub fn new() -> Self {
        Self {
            responders: Arc::new(Mutex::new(HashMap::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Override the answer for one purpose
    #[must_use]
    pub fn on(
        self,
        purpose: CallPurpose,
        responder: impl Fn(&ChatRequest) -> Result<ChatReply, ModelError> + Send + Sync + 'static,
    ) -> Self {
        self.responders.lock().insert(purpose, Arc::new(responder));
        self
    }

    /// Every request seen so far
    #[must_use]
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    #[must_use]
    pub fn requests_for(&self, purpose: CallPurpose) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.purpose == purpose)
            .cloned()
            .collect()
    }

    fn default_reply(request: &ChatRequest) -> ChatReply {
        match request.purpose {
            CallPurpose::VisionAnalysis => ChatReply::text("A single red cube resting on a wooden table."),
            CallPurpose::VisionComparison => {
                ChatReply::text("The render matches except the cube is slightly too small.")
            }
            CallPurpose::Planning => ChatReply::text(
                "<think>two assets</think>\nA = {cube, table}\n\
                 R = {proximity, overlap}\nE = {proximity: [cube, table], overlap: [cube, table]}",
            ),
            CallPurpose::CodeGeneration | CallPurpose::CodeRevision => ChatReply::text(
                "import bpy\nbpy.ops.mesh.primitive_cube_add(size=2)\n\
                 bpy.context.object.active_material = bpy.data.materials.new(\"Red\")",
            ),
            CallPurpose::ToolAgent => agent_turn(request),
        }
    }
}

/// One `execute_blender_code` call per instruction, then a final answer
fn agent_turn(request: &ChatRequest) -> ChatReply {
    let last = request.messages.last();
    if last.is_some_and(|m| m.role == Role::Tool) {
        return ChatReply::text("Done.");
    }
    let instruction = request.prompt();
    let code = instruction
        .rsplit_once(CODE_MARKER)
        .map_or(instruction, |(_, rest)| rest);
    let code = code
        .split_once("\nIf it does not work")
        .map_or(code, |(code, _)| code);
    ChatReply::calls(vec![ToolCall {
        name: EXECUTE_CODE.to_string(),
        arguments: json!({ "code": code }),
    }])
}

#[async_trait]
impl ModelService for ScriptedModel {
    async fn chat(&self, request: ChatRequest) -> Result<ChatReply, ModelError> {
        self.requests.lock().push(request.clone());
        let responder = self.responders.lock().get(&request.purpose).cloned();
        match responder {
            Some(responder) => responder(&request),
            None => Ok(Self::default_reply(&request)),
        }
    }
}

/// Invocation seen by the fake provider
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Blender capability provider double
///
/// `execute_blender_code` writes a PNG to the path named by
/// `render.filepath` whenever the code calls `bpy.ops.render.render`.
pub struct FakeCapabilityProvider {
    tools: Vec<CapabilityDescriptor>,
    fail_remaining: AtomicU32,
    discovery_fails: bool,
    invocations: Mutex<Vec<Invocation>>,
    filepath: Regex,
}

impl std::fmt::Debug for FakeCapabilityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeCapabilityProvider")
            .field("tools", &self.tools.len())
            .finish_non_exhaustive()
    }
}

impl FakeCapabilityProvider {
    /// Tool list of the Blender MCP server, excluded entries included
    #[must_use]
    pub fn blender() -> Self {
        let mut tools: Vec<CapabilityDescriptor> = [
            "get_scene_info",
            "get_object_info",
            EXECUTE_CODE,
            "get_polyhaven_categories",
            "search_polyhaven_assets",
            "download_polyhaven_asset",
        ]
        .into_iter()
        .map(|name| CapabilityDescriptor::new(name).with_description(format!("{name} tool")))
        .collect();
        tools.extend(STANDARD_EXCLUSIONS.iter().map(|name| CapabilityDescriptor::new(*name)));
        Self::with_tools(tools)
    }

    #[must_use]
    pub fn with_tools(tools: Vec<CapabilityDescriptor>) -> Self {
        Self {
            tools,
            fail_remaining: AtomicU32::new(0),
            discovery_fails: false,
            invocations: Mutex::new(Vec::new()),
            filepath: Regex::new(r#"render\.filepath\s*=\s*"([^"]+)""#)
                .expect("valid filepath pattern"),
        }
    }

    /// Fail the first `n` invocations as if the server had not started
    #[must_use]
    pub fn failing_first(self, n: u32) -> Self {
        self.fail_remaining.store(n, Ordering::SeqCst);
        self
    }

    /// Make discovery fail
    #[must_use]
    pub fn unreachable(mut self) -> Self {
        self.discovery_fails = true;
        self
    }

    #[must_use]
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().clone()
    }

    fn execute(&self, code: &str) -> Result<CapabilityOutput, ProviderError> {
        if !code.contains("bpy.ops.render.render") {
            return Ok(CapabilityOutput::ok("Code executed successfully"));
        }
        let Some(path) = self.filepath.captures(code).map(|c| PathBuf::from(&c[1])) else {
            return Ok(CapabilityOutput::error("render.filepath is not set"));
        };
        write_png(&path).map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(CapabilityOutput::ok(format!("Rendered to {}", path.display())))
    }
}

#[async_trait]
impl CapabilityProvider for FakeCapabilityProvider {
    async fn discover(&self) -> Result<Vec<CapabilityDescriptor>, ProviderError> {
        if self.discovery_fails {
            return Err(ProviderError::Launch("blender-mcp not reachable".into()));
        }
        Ok(self.tools.clone())
    }

    async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<CapabilityOutput, ProviderError> {
        self.invocations.lock().push(Invocation {
            name: name.to_string(),
            arguments: arguments.clone(),
        });
        if self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProviderError::Launch("connection refused".into()));
        }
        if !self.tools.iter().any(|t| t.name == name) {
            return Err(ProviderError::UnknownCapability(name.to_string()));
        }
        match name {
            EXECUTE_CODE => {
                let code = arguments.get("code").and_then(|c| c.as_str()).unwrap_or_default();
                self.execute(code)
            }
            other => Ok(CapabilityOutput::ok(format!("{other}: ok"))),
        }
    }
}

/// Write a small valid PNG
///
/// # Errors
/// Propagates image encoding and I/O errors.
pub fn write_png(path: &Path) -> Result<(), image::ImageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    image::RgbaImage::from_pixel(8, 8, image::Rgba([180, 20, 20, 255])).save(path)
}

/// Write a file with a PNG signature and garbage after it
pub fn write_corrupt_image(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, b"\x89PNG\r\n\x1a\nthis is not image data")
}

/// Config with fast call guards rendering into `dir`
#[must_use]
pub fn scenario_config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.render_path = dir.join("render.png");
    config.calls.timeout_secs = 5;
    config.calls.initial_backoff_ms = 1;
    config.calls.max_backoff_ms = 2;
    config
}
