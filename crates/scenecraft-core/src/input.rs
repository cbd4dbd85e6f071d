//! Initial input collection

use crate::context::Context;
use crate::error::PipelineError;
use async_trait::async_trait;

/// One answer from the user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectedInput {
    pub user_input: String,
    /// Empty for a text-only start
    pub image_source: String,
}

impl CollectedInput {
    #[must_use]
    pub fn new(user_input: impl Into<String>, image_source: impl Into<String>) -> Self {
        Self {
            user_input: user_input.into(),
            image_source: image_source.into(),
        }
    }

    fn is_blank(&self) -> bool {
        self.user_input.trim().is_empty() && self.image_source.trim().is_empty()
    }
}

/// Source of the scene description and optional reference image
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InputCollector: Send + Sync {
    /// Ask once. `Ok(None)` means the source is exhausted.
    async fn collect(&self) -> Result<Option<CollectedInput>, PipelineError>;
}

/// Ask until a non-blank answer arrives, at most `max_prompts` times
///
/// # Errors
/// `PipelineError::Input` when the source is exhausted or only blank
/// answers were given.
pub async fn collect_initial_context(
    collector: &dyn InputCollector,
    max_prompts: u32,
) -> Result<Context, PipelineError> {
    for attempt in 1..=max_prompts.max(1) {
        let Some(input) = collector.collect().await? else {
            return Err(PipelineError::Input("input closed before a prompt was given".into()));
        };
        if input.is_blank() {
            tracing::warn!(attempt, "blank input, asking again");
            continue;
        }
        tracing::info!(
            text_only = input.image_source.trim().is_empty(),
            "collected initial input"
        );
        return Context::new(input.user_input, input.image_source);
    }
    Err(PipelineError::Input(format!(
        "no prompt or image after {} attempt(s)",
        max_prompts.max(1)
    )))
}
