use super::{Stage, StageEnv, StageKind, StageMode, StageOutput};
use crate::context::{Context, Field, FieldSet};
use crate::error::PipelineError;
use crate::model::{CallPurpose, ChatRequest};
use crate::plan::strip_reasoning;
use async_trait::async_trait;

/// Scene analysis
///
/// Without an image source the stage describes the scene from the user's
/// text alone and never touches the image loader. With one, the image is
/// loaded and sent alongside the analysis prompt (initial mode) or the
/// comparison prompt (feedback mode).
#[derive(Debug, Clone, Copy, Default)]
pub struct VisionStage {
    mode: StageMode,
}

impl VisionStage {
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

    fn comparison_prompt(ctx: &Context, env: &StageEnv) -> String {
        ctx.comparison_prompt().map_or_else(
            || {
                env.prompts
                    .compose_comparison(ctx.user_input(), ctx.vision_summary().unwrap_or_default())
            },
            str::to_string,
        )
    }
}

#[async_trait]
impl Stage for VisionStage {
    fn kind(&self) -> StageKind {
        StageKind::Vision
    }

    fn mode(&self) -> StageMode {
        self.mode
    }

    fn reads(&self) -> FieldSet {
        match self.mode {
            StageMode::Initial => [Field::UserInput, Field::ImageSource].into_iter().collect(),
            StageMode::Feedback => [Field::UserInput, Field::ImageSource, Field::VisionSummary]
                .into_iter()
                .collect(),
        }
    }

    fn writes(&self) -> FieldSet {
        [Field::VisionSummary].into_iter().collect()
    }

    #[tracing::instrument(name = "vision", skip_all, fields(pass = ctx.pass(), mode = ?self.mode))]
    async fn run(&self, ctx: &Context, env: &StageEnv) -> Result<StageOutput, PipelineError> {
        let request = match ctx.image_source() {
            None => {
                tracing::info!("no image source, describing from text");
                ChatRequest::text(
                    &env.personas.vision_text,
                    CallPurpose::VisionAnalysis,
                    format!("{}\n{}", env.prompts.analysis_text, ctx.user_input()),
                )
            }
            Some(path) => {
                let image = env.images.load(path).await?;
                let (prompt, purpose) = match self.mode {
                    StageMode::Initial => {
                        (env.prompts.analysis_image.clone(), CallPurpose::VisionAnalysis)
                    }
                    StageMode::Feedback => {
                        (Self::comparison_prompt(ctx, env), CallPurpose::VisionComparison)
                    }
                };
                ChatRequest::multimodal(&env.personas.vision, purpose, prompt, image)
            }
        };

        let reply = env.ask(request).await?;
        let summary = strip_reasoning(&reply.content);
        if summary.is_empty() {
            return Err(PipelineError::MalformedOutput {
                stage: StageKind::Vision,
                reason: "empty scene description".to_string(),
            });
        }

        tracing::info!(chars = summary.len(), "scene described");
        Ok(StageOutput::VisionSummary(summary))
    }
}
