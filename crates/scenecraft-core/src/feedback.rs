//! Feedback loop
//!
//! The [`FeedbackController`] runs the initial graph once, then keeps
//! rewriting the context and re-running the feedback graph for as long as its
//! [`IterationPolicy`] says so. Between passes the image source becomes the
//! render path, and variants with explicit prompts get a freshly composed
//! comparison prompt and the plan-revision prompt.
//!
//! A failed pass is retried with the same input context up to
//! `pass_retries` times before the run is aborted.

use crate::config::PipelineVariant;
use crate::context::{Context, Field, FieldSet};
use crate::error::{PipelineError, RunError};
use crate::graph::{GraphBuilder, GraphError, GraphMode, WorkflowGraph};
use crate::journal::{PassOutcome, PassRecord, RunJournal};
use crate::stages::{
    CodeStage, PlanStage, Stage, StageEnv, ToolExecutionStage, ToolPlanStage, VisionStage,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

/// Whether to run another pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationDecision {
    Continue,
    Stop,
}

/// Decides after each completed pass whether the loop goes on
pub trait IterationPolicy: Send + Sync {
    fn decide(&self, completed_pass: u32, ctx: &Context) -> IterationDecision;
}

/// Fixed number of passes after the first, no convergence check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedIterations {
    additional: u32,
}

impl FixedIterations {
    #[must_use]
    pub fn new(additional: u32) -> Self {
        Self { additional }
    }

    /// Passes including the first
    #[must_use]
    pub fn total_passes(&self) -> u32 {
        self.additional.saturating_add(1)
    }
}

impl Default for FixedIterations {
    fn default() -> Self {
        Self::new(4)
    }
}

impl IterationPolicy for FixedIterations {
    fn decide(&self, completed_pass: u32, _ctx: &Context) -> IterationDecision {
        if completed_pass < self.total_passes() {
            IterationDecision::Continue
        } else {
            IterationDecision::Stop
        }
    }
}

/// Terminal context and pass records of a completed loop
#[derive(Debug, Clone)]
pub struct FeedbackOutcome {
    pub context: Context,
    pub records: Vec<PassRecord>,
}

/// Outer iteration driver
pub struct FeedbackController {
    initial: WorkflowGraph,
    feedback: WorkflowGraph,
    policy: Arc<dyn IterationPolicy>,
    explicit_prompts: bool,
    pass_retries: u32,
}

impl std::fmt::Debug for FeedbackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackController")
            .field("initial", &self.initial)
            .field("feedback", &self.feedback)
            .field("explicit_prompts", &self.explicit_prompts)
            .field("pass_retries", &self.pass_retries)
            .finish_non_exhaustive()
    }
}

impl FeedbackController {
    #[must_use]
    pub fn new(
        initial: WorkflowGraph,
        feedback: WorkflowGraph,
        policy: Arc<dyn IterationPolicy>,
    ) -> Self {
        Self {
            initial,
            feedback,
            policy,
            explicit_prompts: false,
            pass_retries: 1,
        }
    }

    /// Build both graphs of a pipeline variant
    ///
    /// # Errors
    /// [`GraphError`] if either graph fails validation.
    pub fn for_variant(
        variant: PipelineVariant,
        policy: Arc<dyn IterationPolicy>,
    ) -> Result<Self, GraphError> {
        let explicit = variant.uses_explicit_prompts();
        let mut entry_fields = GraphBuilder::input_fields();
        if explicit {
            entry_fields.insert(Field::PlanPrompt);
        }

        let (initial, feedback): (Vec<Arc<dyn Stage>>, Vec<Arc<dyn Stage>>) = match variant {
            PipelineVariant::CodeFirst => (
                vec![
                    Arc::new(VisionStage::initial()),
                    Arc::new(PlanStage),
                    Arc::new(CodeStage::initial()),
                    Arc::new(ToolExecutionStage),
                ],
                vec![
                    Arc::new(VisionStage::feedback()),
                    Arc::new(CodeStage::feedback()),
                    Arc::new(ToolExecutionStage),
                ],
            ),
            PipelineVariant::ToolPlanned => (
                vec![
                    Arc::new(VisionStage::initial()),
                    Arc::new(ToolPlanStage::initial()),
                ],
                vec![
                    Arc::new(VisionStage::feedback()),
                    Arc::new(ToolPlanStage::feedback()),
                ],
            ),
        };

        let initial = GraphBuilder::new(GraphMode::Initial)
            .with_available(entry_fields)
            .chain(initial)
            .build()?;

        let mut rewritten: FieldSet = [Field::ImageSource].into_iter().collect();
        if explicit {
            rewritten.insert(Field::ComparisonPrompt);
            rewritten.insert(Field::PlanPrompt);
        }
        let feedback = GraphBuilder::new(GraphMode::Feedback)
            .with_available(initial.fields_after().union(&rewritten))
            .chain(feedback)
            .build()?;

        Ok(Self::new(initial, feedback, policy).with_explicit_prompts(explicit))
    }

    #[must_use]
    pub fn with_explicit_prompts(mut self, explicit: bool) -> Self {
        self.explicit_prompts = explicit;
        self
    }

    #[must_use]
    pub fn with_pass_retries(mut self, retries: u32) -> Self {
        self.pass_retries = retries;
        self
    }

    #[must_use]
    pub fn initial_graph(&self) -> &WorkflowGraph {
        &self.initial
    }

    #[must_use]
    pub fn feedback_graph(&self) -> &WorkflowGraph {
        &self.feedback
    }

    /// Context for the pass after `ctx`'s
    #[must_use]
    pub fn rewrite(&self, ctx: Context, env: &StageEnv) -> Context {
        let (comparison, plan_prompt) = if self.explicit_prompts {
            (
                Some(
                    env.prompts
                        .compose_comparison(ctx.user_input(), ctx.vision_summary().unwrap_or_default()),
                ),
                Some(env.prompts.tool_plan_feedback.clone()),
            )
        } else {
            (None, None)
        };
        ctx.rewrite_for_next_pass(env.render.path(), comparison, plan_prompt)
    }

    /// Run the initial pass and every feedback pass the policy allows
    ///
    /// # Errors
    /// `RunError::Aborted` once a pass exhausts its retries,
    /// `RunError::Cancelled` on cancellation, `RunError::Journal` if the
    /// journal cannot be written.
    pub async fn run(
        &self,
        ctx: Context,
        env: &StageEnv,
        journal: Option<&RunJournal>,
    ) -> Result<FeedbackOutcome, RunError> {
        let mut ctx = ctx;
        let mut records = Vec::new();

        loop {
            let pass = ctx.pass();
            if env.cancel.is_cancelled() {
                return Err(RunError::Cancelled {
                    pass,
                    partial: Box::new(ctx),
                });
            }

            let graph = if pass == 1 {
                &self.initial
            } else {
                tracing::info!(iteration = pass, "feedback loop iteration {pass}");
                &self.feedback
            };

            ctx = self.run_attempts(graph, ctx, env, journal, &mut records).await?;
            metrics::counter!("scenecraft_passes_total", "outcome" => "completed").increment(1);

            match self.policy.decide(pass, &ctx) {
                IterationDecision::Stop => break,
                IterationDecision::Continue => ctx = self.rewrite(ctx, env),
            }
        }

        tracing::info!(passes = ctx.pass(), "feedback loop finished");
        Ok(FeedbackOutcome {
            context: ctx,
            records,
        })
    }

    async fn run_attempts(
        &self,
        graph: &WorkflowGraph,
        input: Context,
        env: &StageEnv,
        journal: Option<&RunJournal>,
        records: &mut Vec<PassRecord>,
    ) -> Result<Context, RunError> {
        let pass = input.pass();
        let max_attempts = self.pass_retries.saturating_add(1);
        let mut attempt = 1;

        loop {
            let started_at = Utc::now();
            let clock = Instant::now();
            let result = graph.run_pass(input.clone(), env).await;
            let elapsed = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);

            let failure = match result {
                Ok(done) => {
                    let record =
                        PassRecord::new(pass, attempt, graph.mode(), PassOutcome::Completed, &done)
                            .timed(started_at, elapsed);
                    Self::journal(journal, record, &done, attempt, records).await?;
                    tracing::info!(pass, attempt, elapsed_ms = elapsed, "pass completed");
                    return Ok(done);
                }
                Err(failure) => failure,
            };

            let cancelled = matches!(failure.error, PipelineError::Cancelled);
            let outcome = if cancelled {
                PassOutcome::Cancelled
            } else {
                PassOutcome::Failed
            };
            let record = PassRecord::new(pass, attempt, graph.mode(), outcome, &failure.partial)
                .failed_in(failure.stage, &failure.error)
                .timed(started_at, elapsed);
            Self::journal(journal, record, &failure.partial, attempt, records).await?;

            if cancelled {
                metrics::counter!("scenecraft_passes_total", "outcome" => "cancelled").increment(1);
                return Err(RunError::Cancelled {
                    pass,
                    partial: Box::new(failure.partial),
                });
            }

            if attempt >= max_attempts {
                tracing::error!(
                    pass,
                    attempts = attempt,
                    stage = ?failure.stage,
                    error = %failure.error,
                    "pass failed, aborting run"
                );
                metrics::counter!("scenecraft_passes_total", "outcome" => "aborted").increment(1);
                return Err(RunError::Aborted {
                    pass,
                    stage: failure.stage,
                    attempts: attempt,
                    source: failure.error,
                    partial: Box::new(failure.partial),
                });
            }

            tracing::warn!(
                pass,
                attempt,
                stage = ?failure.stage,
                error = %failure.error,
                "pass failed, retrying with unchanged inputs"
            );
            metrics::counter!("scenecraft_passes_total", "outcome" => "retried").increment(1);
            attempt += 1;
        }
    }

    async fn journal(
        journal: Option<&RunJournal>,
        record: PassRecord,
        ctx: &Context,
        attempt: u32,
        records: &mut Vec<PassRecord>,
    ) -> Result<(), RunError> {
        if let Some(journal) = journal {
            journal.append(record.clone()).await.map_err(RunError::Journal)?;
            journal
                .save_artifacts(ctx, attempt)
                .await
                .map_err(RunError::Journal)?;
        }
        records.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::{env_with_model, MockModel};
    use crate::stages::{RenderTarget, StageKind, StageOutput};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Records the image source of every pass; fails the first `failures` runs
    struct Probe {
        seen: Mutex<Vec<(u32, Option<PathBuf>)>>,
        failures: AtomicU32,
    }

    impl Probe {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                failures: AtomicU32::new(failures),
            })
        }
    }

    #[async_trait]
    impl Stage for Probe {
        fn kind(&self) -> StageKind {
            StageKind::Vision
        }

        fn reads(&self) -> FieldSet {
            FieldSet::new()
        }

        fn writes(&self) -> FieldSet {
            [Field::VisionSummary].into_iter().collect()
        }

        async fn run(&self, ctx: &Context, _env: &StageEnv) -> Result<StageOutput, PipelineError> {
            self.seen
                .lock()
                .unwrap()
                .push((ctx.pass(), ctx.image_source().map(Path::to_path_buf)));
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(PipelineError::external("vision model", "503"));
            }
            Ok(StageOutput::VisionSummary(format!("summary {}", ctx.pass())))
        }
    }

    fn controller(probe: &Arc<Probe>, passes: u32) -> FeedbackController {
        let graph = |mode| {
            GraphBuilder::new(mode)
                .chain([probe.clone() as Arc<dyn Stage>])
                .build()
                .unwrap()
        };
        FeedbackController::new(
            graph(GraphMode::Initial),
            graph(GraphMode::Feedback),
            Arc::new(FixedIterations::new(passes)),
        )
    }

    fn env() -> StageEnv {
        env_with_model(MockModel::new()).with_render(RenderTarget::new("/tmp/scenecraft/render.png"))
    }

    #[test]
    fn fixed_policy_counts_additional_passes() {
        let policy = FixedIterations::new(4);
        let ctx = Context::new("cube", "").unwrap();
        assert_eq!(policy.total_passes(), 5);
        assert_eq!(policy.decide(4, &ctx), IterationDecision::Continue);
        assert_eq!(policy.decide(5, &ctx), IterationDecision::Stop);
    }

    #[tokio::test]
    async fn runs_configured_passes_and_rewrites_image() {
        let probe = Probe::new(0);
        let outcome = controller(&probe, 4)
            .run(Context::new("cube", "").unwrap(), &env(), None)
            .await
            .unwrap();

        let seen = probe.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[0], (1, None));
        for (i, (pass, image)) in seen.iter().enumerate().skip(1) {
            assert_eq!(*pass, i as u32 + 1);
            assert_eq!(image.as_deref(), Some(Path::new("/tmp/scenecraft/render.png")));
        }
        assert_eq!(outcome.context.pass(), 5);
        assert_eq!(outcome.context.vision_summary(), Some("summary 5"));
        assert_eq!(outcome.records.len(), 5);
    }

    #[tokio::test]
    async fn failed_pass_is_retried_with_same_input() {
        let probe = Probe::new(1);
        let outcome = controller(&probe, 1)
            .run(Context::new("cube", "").unwrap(), &env(), None)
            .await
            .unwrap();

        let seen = probe.seen.lock().unwrap().clone();
        assert_eq!(seen[0], seen[1]);
        assert_eq!(outcome.records[0].outcome, PassOutcome::Failed);
        assert_eq!(outcome.records[1].outcome, PassOutcome::Completed);
        assert_eq!(outcome.records[1].attempt, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_abort_with_pass_and_stage() {
        let probe = Probe::new(10);
        let err = controller(&probe, 4)
            .with_pass_retries(2)
            .run(Context::new("cube", "").unwrap(), &env(), None)
            .await
            .unwrap_err();

        match err {
            RunError::Aborted {
                pass,
                stage,
                attempts,
                ..
            } => {
                assert_eq!(pass, 1);
                assert_eq!(stage, Some(StageKind::Vision));
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(probe.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_between_passes() {
        let probe = Probe::new(0);
        let env = env();
        env.cancel.cancel();
        let err = controller(&probe, 4)
            .run(Context::new("cube", "").unwrap(), &env, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Cancelled { pass: 1, .. }));
        assert!(probe.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn explicit_prompts_are_composed_on_rewrite() {
        let probe = Probe::new(0);
        let controller = controller(&probe, 1).with_explicit_prompts(true);
        let env = env();
        let mut ctx = Context::new("a red cube", "").unwrap();
        ctx.apply(StageOutput::VisionSummary("a cube on wood".into()));

        let next = controller.rewrite(ctx, &env);
        let comparison = next.comparison_prompt().unwrap();
        assert!(comparison.contains("a red cube"));
        assert!(comparison.contains("a cube on wood"));
        assert_eq!(next.plan_prompt(), Some(env.prompts.tool_plan_feedback.as_str()));
    }

    #[tokio::test]
    async fn journal_records_every_attempt() {
        let probe = Probe::new(1);
        let journal = RunJournal::in_memory();
        controller(&probe, 1)
            .run(Context::new("cube", "").unwrap(), &env(), Some(&journal))
            .await
            .unwrap();
        assert_eq!(journal.verify_integrity().unwrap(), 3);
    }

    #[test]
    fn both_variants_build_valid_graphs() {
        let policy: Arc<dyn IterationPolicy> = Arc::new(FixedIterations::default());
        let code_first = FeedbackController::for_variant(PipelineVariant::CodeFirst, policy.clone()).unwrap();
        assert_eq!(
            code_first.initial_graph().sequence(),
            &[StageKind::Vision, StageKind::Plan, StageKind::Code, StageKind::ToolExecution]
        );
        assert_eq!(
            code_first.feedback_graph().sequence(),
            &[StageKind::Vision, StageKind::Code, StageKind::ToolExecution]
        );

        let tool_planned = FeedbackController::for_variant(PipelineVariant::ToolPlanned, policy).unwrap();
        assert_eq!(
            tool_planned.feedback_graph().sequence(),
            &[StageKind::Vision, StageKind::ToolPlan]
        );
    }
}
