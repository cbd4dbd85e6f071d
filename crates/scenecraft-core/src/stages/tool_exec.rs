use super::{Stage, StageEnv, StageKind, StageMode, StageOutput};
use crate::agent::{AgentOutcome, ToolAgent};
use crate::context::{Context, Field, FieldSet};
use crate::error::PipelineError;
use crate::plan::ScenePlan;
use crate::prompts::{execute_code_instruction, render_instruction, render_snippet};
use async_trait::async_trait;

/// Fixed render request
///
/// Places the camera, points the engine's still output at the agreed render
/// path and renders. Usable on its own or as the tail of the agent stages.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScreenshotStage;

impl ScreenshotStage {
    /// Issue the render request through an existing agent
    ///
    /// # Errors
    /// Agent failures, or `PipelineError::MalformedOutput` when a required
    /// render file is missing afterwards.
    pub async fn capture(agent: &ToolAgent, env: &StageEnv) -> Result<bool, PipelineError> {
        let previous = env.render.set_aside(StageKind::Screenshot).await?;
        let instruction = render_instruction(&render_snippet(env.render.path()));
        let checked = match agent.run(&instruction, &env.guard, &env.cancel).await {
            Ok(_) => env.render.verify(StageKind::Screenshot).await,
            Err(e) => Err(e),
        };

        match checked {
            Ok(true) => {
                env.render.discard(previous).await;
                tracing::info!(path = %env.render.path().display(), "render captured");
                Ok(true)
            }
            Ok(false) => {
                // Not required: keep the last good render as the comparison image
                env.render.restore(previous).await;
                Ok(false)
            }
            Err(e) => {
                env.render.restore(previous).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Stage for ScreenshotStage {
    fn kind(&self) -> StageKind {
        StageKind::Screenshot
    }

    fn reads(&self) -> FieldSet {
        FieldSet::new()
    }

    fn writes(&self) -> FieldSet {
        FieldSet::new()
    }

    #[tracing::instrument(name = "screenshot", skip_all, fields(pass = ctx.pass()))]
    async fn run(&self, ctx: &Context, env: &StageEnv) -> Result<StageOutput, PipelineError> {
        let agent = env.discover_agent().await?;
        let rendered = Self::capture(&agent, env).await?;
        Ok(StageOutput::External { rendered })
    }
}

/// Runs the generated code in the engine, then captures a render
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolExecutionStage;

#[async_trait]
impl Stage for ToolExecutionStage {
    fn kind(&self) -> StageKind {
        StageKind::ToolExecution
    }

    fn reads(&self) -> FieldSet {
        [Field::GeneratedCode].into_iter().collect()
    }

    fn writes(&self) -> FieldSet {
        FieldSet::new()
    }

    #[tracing::instrument(name = "tool_execution", skip_all, fields(pass = ctx.pass()))]
    async fn run(&self, ctx: &Context, env: &StageEnv) -> Result<StageOutput, PipelineError> {
        let code = ctx.require(Field::GeneratedCode, StageKind::ToolExecution)?;
        let agent = env.discover_agent().await?;

        let outcome: AgentOutcome = agent
            .run(&execute_code_instruction(code), &env.guard, &env.cancel)
            .await?;
        tracing::info!(
            steps = outcome.steps,
            invocations = outcome.invoked.len(),
            failed = outcome.failed_calls,
            "code executed"
        );
        tracing::debug!(report = %outcome.text, "agent report");

        let rendered = ScreenshotStage::capture(&agent, env).await?;
        Ok(StageOutput::External { rendered })
    }
}

/// Planning fused with execution through the tool agent
///
/// The agent receives the user's request, the scene description, the prior
/// plan and the plan prompt. Its final answer becomes the new plan; a render
/// is captured afterwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolPlanStage {
    mode: StageMode,
}

impl ToolPlanStage {
    #[must_use]
    pub fn initial() -> Self {
        Self {
            mode: StageMode::Initial,
        }
    }

    #[must_use]
    pub fn feedback() -> Self {
        Self {
            mode: StageMode::Feedback,
        }
    }

    fn agent_input(ctx: &Context, env: &StageEnv, mode: StageMode) -> String {
        let fallback = match mode {
            StageMode::Initial => &env.prompts.tool_plan,
            StageMode::Feedback => &env.prompts.tool_plan_feedback,
        };
        [
            ctx.user_input(),
            ctx.vision_summary().unwrap_or_default(),
            ctx.plan().unwrap_or_default(),
            ctx.plan_prompt().unwrap_or(fallback),
        ]
        .join("\n")
    }
}

#[async_trait]
impl Stage for ToolPlanStage {
    fn kind(&self) -> StageKind {
        StageKind::ToolPlan
    }

    fn mode(&self) -> StageMode {
        self.mode
    }

    fn reads(&self) -> FieldSet {
        match self.mode {
            StageMode::Initial => [Field::UserInput, Field::VisionSummary].into_iter().collect(),
            StageMode::Feedback => [Field::UserInput, Field::VisionSummary, Field::Plan, Field::PlanPrompt]
                .into_iter()
                .collect(),
        }
    }

    fn writes(&self) -> FieldSet {
        [Field::Plan].into_iter().collect()
    }

    #[tracing::instrument(name = "tool_plan", skip_all, fields(pass = ctx.pass(), mode = ?self.mode))]
    async fn run(&self, ctx: &Context, env: &StageEnv) -> Result<StageOutput, PipelineError> {
        let agent = env.discover_agent().await?;
        let outcome = agent
            .run(&Self::agent_input(ctx, env, self.mode), &env.guard, &env.cancel)
            .await?;
        let plan = ScenePlan::new(outcome.text);
        tracing::info!(
            steps = outcome.steps,
            invocations = outcome.invoked.len(),
            chars = plan.text().len(),
            "plan executed"
        );

        ScreenshotStage::capture(&agent, env).await?;
        Ok(StageOutput::Plan(plan))
    }
}
