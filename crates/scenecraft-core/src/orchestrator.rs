//! Run orchestration
//!
//! [`SceneOrchestrator`] wires a validated [`EngineConfig`] to the external
//! services, collects the initial input, drives the [`FeedbackController`]
//! and writes the run journal.

use crate::capability::{CapabilityProvider, CapabilityRegistry};
use crate::config::{CapabilityConfig, EngineConfig};
use crate::context::Context;
use crate::error::{PipelineError, RunError};
use crate::feedback::{FeedbackController, FixedIterations};
use crate::imaging::{ImageLoader, PngImageLoader};
use crate::input::{collect_initial_context, InputCollector};
use crate::journal::{PassRecord, RunJournal};
use crate::model::ModelService;
use crate::stages::{RenderTarget, StageEnv};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// External collaborators of a run
#[derive(Clone)]
pub struct Services {
    pub model: Arc<dyn ModelService>,
    pub registry: Arc<CapabilityRegistry>,
    pub images: Arc<dyn ImageLoader>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Services {
    /// Registry configured from `capabilities`, PNG image loading
    #[must_use]
    pub fn new(
        model: Arc<dyn ModelService>,
        provider: Arc<dyn CapabilityProvider>,
        capabilities: &CapabilityConfig,
    ) -> Self {
        let registry = CapabilityRegistry::new(provider, capabilities.excluded.clone())
            .with_session_cache(capabilities.cache_per_session);
        Self {
            model,
            registry: Arc::new(registry),
            images: Arc::new(PngImageLoader),
        }
    }

    #[must_use]
    pub fn with_images(mut self, images: Arc<dyn ImageLoader>) -> Self {
        self.images = images;
        self
    }
}

/// Result of a completed run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub final_context: Context,
    /// Every pass attempt in order, failed attempts included
    pub passes: Vec<PassRecord>,
    pub render_path: PathBuf,
    /// Journal directory, when journaling to disk
    pub journal_dir: Option<PathBuf>,
}

impl RunReport {
    /// Number of passes that completed
    #[must_use]
    pub fn completed_passes(&self) -> u32 {
        self.final_context.pass()
    }
}

/// Top-level driver of one scene construction run
pub struct SceneOrchestrator {
    config: EngineConfig,
    services: Services,
    controller: FeedbackController,
}

impl std::fmt::Debug for SceneOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneOrchestrator")
            .field("variant", &self.config.variant)
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}

impl SceneOrchestrator {
    /// Validate the configuration and build both workflow graphs
    ///
    /// # Errors
    /// `PipelineError::Config` for invalid settings, `PipelineError::Graph`
    /// if a graph fails validation.
    pub fn new(config: EngineConfig, services: Services) -> Result<Self, PipelineError> {
        config
            .validate()
            .map_err(|e| PipelineError::Config(e.to_string()))?;

        let policy = Arc::new(FixedIterations::new(config.feedback.iterations));
        let controller = FeedbackController::for_variant(config.variant, policy)?
            .with_pass_retries(config.feedback.pass_retries);

        tracing::info!(
            variant = ?config.variant,
            iterations = config.feedback.iterations,
            render = %config.render_path.display(),
            "orchestrator ready"
        );
        Ok(Self {
            config,
            services,
            controller,
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn controller(&self) -> &FeedbackController {
        &self.controller
    }

    /// Collect the initial input, then run
    ///
    /// # Errors
    /// `RunError::Input` if no usable input was given, otherwise as
    /// [`SceneOrchestrator::run_with_context`].
    pub async fn run(
        &self,
        collector: &dyn InputCollector,
        cancel: &CancellationToken,
    ) -> Result<RunReport, RunError> {
        let ctx = collect_initial_context(collector, self.config.input.max_prompts)
            .await
            .map_err(RunError::Input)?;
        self.run_with_context(ctx, cancel).await
    }

    /// Run every pass starting from a pass-1 context
    ///
    /// # Errors
    /// `RunError::Setup` if the render directory or journal cannot be
    /// prepared, `RunError::Aborted`, `RunError::Cancelled` or
    /// `RunError::Journal` from the loop itself.
    pub async fn run_with_context(
        &self,
        ctx: Context,
        cancel: &CancellationToken,
    ) -> Result<RunReport, RunError> {
        let render_path = prepare_render_path(&self.config.render_path)
            .await
            .map_err(RunError::Setup)?;
        let journal = match &self.config.journal_dir {
            Some(root) => RunJournal::create(root).await.map_err(RunError::Setup)?,
            None => RunJournal::in_memory(),
        };
        let env = self.stage_env(&render_path, cancel.clone());

        let ctx = if self.config.variant.uses_explicit_prompts() && ctx.plan_prompt().is_none() {
            ctx.with_plan_prompt(env.prompts.tool_plan.clone())
        } else {
            ctx
        };

        tracing::info!(
            run_id = %journal.run_id(),
            text_only = ctx.image_source().is_none(),
            "starting scene run"
        );

        let outcome = self.controller.run(ctx, &env, Some(&journal)).await?;
        journal
            .save_final(&outcome.context)
            .await
            .map_err(RunError::Journal)?;

        tracing::info!(
            run_id = %journal.run_id(),
            passes = outcome.context.pass(),
            render = %render_path.display(),
            "scene run finished"
        );
        Ok(RunReport {
            final_context: outcome.context,
            passes: outcome.records,
            render_path,
            journal_dir: journal.dir().map(Path::to_path_buf),
        })
    }

    fn stage_env(&self, render_path: &Path, cancel: CancellationToken) -> StageEnv {
        let mut env = StageEnv::new(self.services.model.clone(), self.services.registry.clone())
            .with_images(self.services.images.clone())
            .with_guard(self.config.calls.guard())
            .with_render(
                RenderTarget::new(render_path)
                    .with_required_artifact(self.config.require_render_artifact),
            )
            .with_cancel(cancel);
        env.personas = self.config.models.personas.clone();
        env.prompts = self.config.variant.prompts();
        env.max_agent_steps = self.config.agent.max_steps;
        env
    }
}

/// Absolute render path with its directory created and any stale render removed
async fn prepare_render_path(path: &Path) -> Result<PathBuf, PipelineError> {
    let setup = |e: std::io::Error| {
        PipelineError::Config(format!("render path {}: {e}", path.display()))
    };
    let path = std::path::absolute(path).map_err(setup)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(setup)?;
    }
    let previous = RenderTarget::new(&path).previous_path();
    for stale in [&path, &previous] {
        match tokio::fs::remove_file(stale).await {
            Ok(()) => tracing::debug!(path = %stale.display(), "removed stale render"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(setup(e)),
        }
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineVariant;
    use crate::stages::testing::{MockModel, MockProvider};

    fn services() -> Services {
        Services::new(
            Arc::new(MockModel::new()),
            Arc::new(MockProvider::new()),
            &CapabilityConfig::default(),
        )
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.calls.max_attempts = 0;
        let err = SceneOrchestrator::new(config, services()).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn services_apply_standard_exclusions() {
        let services = services();
        assert!(services.registry.excluded().contains("download_sketchfab_models"));
    }

    #[test]
    fn env_follows_config() {
        let mut config = EngineConfig::default();
        config.variant = PipelineVariant::ToolPlanned;
        config.agent.max_steps = 7;
        let orchestrator = SceneOrchestrator::new(config, services()).unwrap();
        let env = orchestrator.stage_env(Path::new("/tmp/r.png"), CancellationToken::new());
        assert_eq!(env.max_agent_steps, 7);
        assert_eq!(env.render.path(), Path::new("/tmp/r.png"));
        assert_eq!(env.prompts, PipelineVariant::ToolPlanned.prompts());
    }

    #[tokio::test]
    async fn stale_render_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let render = dir.path().join("out").join("render.png");
        std::fs::create_dir_all(render.parent().unwrap()).unwrap();
        std::fs::write(&render, b"old").unwrap();
        let previous = RenderTarget::new(&render).previous_path();
        std::fs::write(&previous, b"older").unwrap();

        let prepared = prepare_render_path(&render).await.unwrap();
        assert_eq!(prepared, render);
        assert!(!render.exists());
        assert!(!previous.exists());
    }

    #[tokio::test]
    async fn cancelled_run_reports_first_pass() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.render_path = dir.path().join("render.png");
        let orchestrator = SceneOrchestrator::new(config, services()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orchestrator
            .run_with_context(Context::new("a cube", "").unwrap(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.pass(), Some(1));
    }
}
