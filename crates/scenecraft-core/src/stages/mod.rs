//! Pipeline stages
//!
//! A stage reads the [`Context`] immutably, may call the model service or the
//! capability provider through its [`StageEnv`], and returns one
//! [`StageOutput`]. The output variant decides which field the stage writes;
//! the graph applies it.

mod code;
mod plan;
mod tool_exec;
mod vision;

pub use code::CodeStage;
pub use plan::PlanStage;
pub use tool_exec::{ScreenshotStage, ToolExecutionStage, ToolPlanStage};
pub use vision::VisionStage;

use crate::agent::ToolAgent;
use crate::capability::{CapabilityDescriptor, CapabilityRegistry};
use crate::context::{Context, Field, FieldSet};
use crate::error::PipelineError;
use crate::guard::CallGuard;
use crate::imaging::{ImageLoader, PngImageLoader};
use crate::model::{ChatReply, ChatRequest, ModelService, Personas};
use crate::plan::ScenePlan;
use crate::prompts::PromptSet;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Stage identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Vision,
    Plan,
    Code,
    ToolExecution,
    ToolPlan,
    Screenshot,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Vision => "vision",
            StageKind::Plan => "plan",
            StageKind::Code => "code",
            StageKind::ToolExecution => "tool execution",
            StageKind::ToolPlan => "tool plan",
            StageKind::Screenshot => "screenshot",
        };
        f.write_str(name)
    }
}

/// First pass or a refinement pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageMode {
    #[default]
    Initial,
    Feedback,
}

/// What a stage hands back; each variant maps to one context field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutput {
    VisionSummary(String),
    Plan(ScenePlan),
    GeneratedCode(String),
    /// Side effect outside the context (engine state, render file)
    External { rendered: bool },
}

impl StageOutput {
    /// Field this output writes
    #[must_use]
    pub fn field(&self) -> Option<Field> {
        match self {
            StageOutput::VisionSummary(_) => Some(Field::VisionSummary),
            StageOutput::Plan(_) => Some(Field::Plan),
            StageOutput::GeneratedCode(_) => Some(Field::GeneratedCode),
            StageOutput::External { .. } => None,
        }
    }
}

/// Agreed render location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTarget {
    path: PathBuf,
    require_artifact: bool,
}

impl RenderTarget {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            require_artifact: true,
        }
    }

    /// Whether a missing render file fails the stage
    #[must_use]
    pub fn with_required_artifact(mut self, required: bool) -> Self {
        self.require_artifact = required;
        self
    }

    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    #[must_use]
    pub fn require_artifact(&self) -> bool {
        self.require_artifact
    }

    /// Sibling path holding the previous render while a new one is requested
    #[must_use]
    pub fn previous_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".previous");
        self.path.with_file_name(name)
    }

    /// Move an existing render out of the way before a render request
    ///
    /// A render left at the agreed path by an earlier pass must not satisfy
    /// the check of a later one.
    ///
    /// # Errors
    /// `PipelineError::MalformedOutput` for `stage` when the file cannot be
    /// moved.
    pub async fn set_aside(&self, stage: StageKind) -> Result<Option<PathBuf>, PipelineError> {
        let previous = self.previous_path();
        match tokio::fs::rename(&self.path, &previous).await {
            Ok(()) => Ok(Some(previous)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PipelineError::MalformedOutput {
                stage,
                reason: format!("cannot move previous render {}: {e}", self.path.display()),
            }),
        }
    }

    /// Put a set-aside render back, replacing whatever the request left
    pub async fn restore(&self, previous: Option<PathBuf>) {
        let Some(previous) = previous else { return };
        if let Err(e) = tokio::fs::rename(&previous, &self.path).await {
            tracing::warn!(path = %previous.display(), error = %e, "could not restore previous render");
        }
    }

    /// Drop a set-aside render once a fresh one exists
    pub async fn discard(&self, previous: Option<PathBuf>) {
        let Some(previous) = previous else { return };
        if let Err(e) = tokio::fs::remove_file(&previous).await {
            tracing::debug!(path = %previous.display(), error = %e, "previous render not removed");
        }
    }

    /// Check the render file after a render request
    ///
    /// # Errors
    /// `PipelineError::MalformedOutput` for `stage` when the file is required
    /// and missing or empty.
    pub async fn verify(&self, stage: StageKind) -> Result<bool, PipelineError> {
        let present = tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false);

        if !present && self.require_artifact {
            return Err(PipelineError::MalformedOutput {
                stage,
                reason: format!("no render written to {}", self.path.display()),
            });
        }
        if !present {
            tracing::warn!(path = %self.path.display(), "render file missing");
        }
        Ok(present)
    }
}

/// Services and settings shared by every stage of a run
#[derive(Clone)]
pub struct StageEnv {
    pub model: Arc<dyn ModelService>,
    pub registry: Arc<CapabilityRegistry>,
    pub images: Arc<dyn ImageLoader>,
    pub personas: Personas,
    pub prompts: PromptSet,
    pub guard: CallGuard,
    pub render: RenderTarget,
    /// Upper bound of model turns of one agent invocation
    pub max_agent_steps: usize,
    pub cancel: CancellationToken,
}

impl fmt::Debug for StageEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageEnv")
            .field("registry", &self.registry)
            .field("personas", &self.personas)
            .field("guard", &self.guard)
            .field("render", &self.render)
            .field("max_agent_steps", &self.max_agent_steps)
            .finish_non_exhaustive()
    }
}

impl StageEnv {
    /// Environment with default personas, code-first prompts and guard
    #[must_use]
    pub fn new(model: Arc<dyn ModelService>, registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            model,
            registry,
            images: Arc::new(PngImageLoader),
            personas: Personas::default(),
            prompts: PromptSet::code_first(),
            guard: CallGuard::default(),
            render: RenderTarget::new("render.png"),
            max_agent_steps: 25,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_images(mut self, images: Arc<dyn ImageLoader>) -> Self {
        self.images = images;
        self
    }

    #[must_use]
    pub fn with_render(mut self, render: RenderTarget) -> Self {
        self.render = render;
        self
    }

    #[must_use]
    pub fn with_guard(mut self, guard: CallGuard) -> Self {
        self.guard = guard;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Guarded chat completion
    ///
    /// # Errors
    /// `PipelineError::ExternalCall`/`Timeout` once the guard gives up, or
    /// `PipelineError::Cancelled`.
    pub async fn ask(&self, request: ChatRequest) -> Result<ChatReply, PipelineError> {
        let target = format!("{} model", request.purpose);
        tracing::debug!(
            model = %request.persona.model,
            purpose = %request.purpose,
            image = request.has_image(),
            "model request"
        );
        let reply = self
            .guard
            .call(&target, &self.cancel, |_| {
                let model = self.model.clone();
                let request = request.clone();
                let target = target.clone();
                async move {
                    model
                        .chat(request)
                        .await
                        .map_err(|e| PipelineError::external(target, e.to_string()))
                }
            })
            .await?;
        tracing::debug!(chars = reply.content.len(), "model reply");
        Ok(reply)
    }

    /// Tool agent over an already filtered capability set
    #[must_use]
    pub fn tool_agent(&self, tools: Vec<CapabilityDescriptor>) -> ToolAgent {
        ToolAgent::new(
            self.model.clone(),
            self.registry.provider().clone(),
            self.personas.tool_agent.clone(),
            tools,
        )
        .with_max_steps(self.max_agent_steps)
    }

    /// Discover the allowed capabilities under the run's guard and build a
    /// tool agent over them
    ///
    /// # Errors
    /// Discovery, timeout or cancellation errors from the registry.
    pub async fn discover_agent(&self) -> Result<ToolAgent, PipelineError> {
        let tools = self.registry.capabilities(&self.guard, &self.cancel).await?;
        Ok(self.tool_agent(tools))
    }
}

/// One unit of pipeline work
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage identity
    fn kind(&self) -> StageKind;

    /// Initial or feedback behaviour
    fn mode(&self) -> StageMode {
        StageMode::Initial
    }

    /// Fields that must be available before the stage runs
    fn reads(&self) -> FieldSet;

    /// Fields the stage may write
    fn writes(&self) -> FieldSet;

    /// Execute against the current context
    async fn run(&self, ctx: &Context, env: &StageEnv) -> Result<StageOutput, PipelineError>;
}
