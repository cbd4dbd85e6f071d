use super::{Stage, StageEnv, StageKind, StageMode, StageOutput};
use crate::context::{Context, Field, FieldSet};
use crate::error::PipelineError;
use crate::model::{CallPurpose, ChatRequest};
use async_trait::async_trait;

/// Procedural code generation from the plan
///
/// The reply is stored verbatim; no syntax check is made. In feedback mode
/// the latest vision summary is appended as the differences to minimise.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodeStage {
    mode: StageMode,
}

impl CodeStage {
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
}

#[async_trait]
impl Stage for CodeStage {
    fn kind(&self) -> StageKind {
        StageKind::Code
    }

    fn mode(&self) -> StageMode {
        self.mode
    }

    fn reads(&self) -> FieldSet {
        match self.mode {
            StageMode::Initial => [Field::Plan].into_iter().collect(),
            StageMode::Feedback => [Field::Plan, Field::VisionSummary].into_iter().collect(),
        }
    }

    fn writes(&self) -> FieldSet {
        [Field::GeneratedCode].into_iter().collect()
    }

    #[tracing::instrument(name = "code", skip_all, fields(pass = ctx.pass(), mode = ?self.mode))]
    async fn run(&self, ctx: &Context, env: &StageEnv) -> Result<StageOutput, PipelineError> {
        let plan = ctx.require(Field::Plan, StageKind::Code)?;
        let request = match self.mode {
            StageMode::Initial => ChatRequest::text(
                &env.personas.coder,
                CallPurpose::CodeGeneration,
                format!("{plan}\n{}", env.prompts.code),
            ),
            StageMode::Feedback => {
                let differences = ctx.require(Field::VisionSummary, StageKind::Code)?;
                ChatRequest::text(
                    &env.personas.coder_feedback,
                    CallPurpose::CodeRevision,
                    format!("{plan}\n{}{differences}", env.prompts.code_feedback),
                )
            }
        };

        let code = env.ask(request).await?.content;
        if code.trim().is_empty() {
            return Err(PipelineError::MalformedOutput {
                stage: StageKind::Code,
                reason: "no code generated".to_string(),
            });
        }

        tracing::info!(chars = code.len(), "code generated");
        Ok(StageOutput::GeneratedCode(code))
    }
}
