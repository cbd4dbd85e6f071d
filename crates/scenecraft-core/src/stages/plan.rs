use super::{Stage, StageEnv, StageKind, StageOutput};
use crate::context::{Context, Field, FieldSet};
use crate::error::PipelineError;
use crate::model::{CallPurpose, ChatRequest};
use crate::plan::ScenePlan;
use async_trait::async_trait;

/// Relational planning over the scene description
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanStage;

#[async_trait]
impl Stage for PlanStage {
    fn kind(&self) -> StageKind {
        StageKind::Plan
    }

    fn reads(&self) -> FieldSet {
        [Field::VisionSummary].into_iter().collect()
    }

    fn writes(&self) -> FieldSet {
        [Field::Plan].into_iter().collect()
    }

    #[tracing::instrument(name = "plan", skip_all, fields(pass = ctx.pass()))]
    async fn run(&self, ctx: &Context, env: &StageEnv) -> Result<StageOutput, PipelineError> {
        let summary = ctx.require(Field::VisionSummary, StageKind::Plan)?;
        let request = ChatRequest::text(
            &env.personas.planner,
            CallPurpose::Planning,
            format!("{}{summary}", env.prompts.planning),
        );

        let plan = ScenePlan::from_reply(&env.ask(request).await?.content);
        if plan.is_empty() {
            tracing::warn!("planner returned an empty plan");
        } else {
            tracing::info!(
                chars = plan.text().len(),
                relations = plan.relations().len(),
                "plan constructed"
            );
        }
        Ok(StageOutput::Plan(plan))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChatReply;
    use crate::stages::testing::{env_with_model, MockModel};

    fn described(summary: &str) -> Context {
        let mut ctx = Context::new("a red cube on a table", "").unwrap();
        ctx.apply(StageOutput::VisionSummary(summary.into()));
        ctx
    }

    #[tokio::test]
    async fn plan_strips_reasoning() {
        let mut model = MockModel::new();
        model
            .expect_chat()
            .withf(|req| req.purpose == CallPurpose::Planning && req.prompt().ends_with("cube, table"))
            .times(1)
            .returning(|_| {
                Ok(ChatReply::text(
                    "<think>which relations?</think>\nR1: proximity(cube, table)",
                ))
            });

        let output = PlanStage
            .run(&described("cube, table"), &env_with_model(model))
            .await
            .unwrap();
        assert_eq!(
            output,
            StageOutput::Plan(ScenePlan::new("R1: proximity(cube, table)"))
        );
    }

    #[tokio::test]
    async fn empty_plan_passes_through() {
        let mut model = MockModel::new();
        model.expect_chat().returning(|_| Ok(ChatReply::text("")));

        let output = PlanStage
            .run(&described("cube"), &env_with_model(model))
            .await
            .unwrap();
        assert_eq!(output, StageOutput::Plan(ScenePlan::default()));
    }

    #[tokio::test]
    async fn missing_summary_is_reported() {
        let ctx = Context::new("cube", "").unwrap();
        let err = PlanStage
            .run(&ctx, &env_with_model(MockModel::new()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("vision_summary"));
    }
}
