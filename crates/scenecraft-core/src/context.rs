//! Shared pass state
//!
//! The [`Context`] is the one record threaded through every stage of a pass.
//! Fields are private: stages read through accessors and hand back a
//! [`StageOutput`], and [`Context::apply`] is the only writer. Each output
//! variant maps to exactly one field, so a stage cannot touch another
//! stage's output.

use crate::error::PipelineError;
use crate::stages::{StageKind, StageOutput};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Current schema version of serialized contexts
pub const CONTEXT_VERSION: u32 = 1;

/// Named context fields, used for read/write declarations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// Free text supplied by the user
    UserInput,
    /// Reference image or last render
    ImageSource,
    /// VisionStage output
    VisionSummary,
    /// PlanStage output
    Plan,
    /// CodeStage output
    GeneratedCode,
    /// Feedback comparison instructions
    ComparisonPrompt,
    /// Feedback plan-revision instructions
    PlanPrompt,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::UserInput => "user_input",
            Field::ImageSource => "image_source",
            Field::VisionSummary => "vision_summary",
            Field::Plan => "plan",
            Field::GeneratedCode => "generated_code",
            Field::ComparisonPrompt => "comparison_prompt",
            Field::PlanPrompt => "plan_prompt",
        };
        f.write_str(name)
    }
}

/// Ordered set of fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSet(BTreeSet<Field>);

impl FieldSet {
    /// Create empty set
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a field
    #[inline]
    pub fn insert(&mut self, field: Field) -> bool {
        self.0.insert(field)
    }

    /// Check membership
    #[inline]
    #[must_use]
    pub fn contains(&self, field: Field) -> bool {
        self.0.contains(&field)
    }

    /// Union with another set
    #[must_use]
    pub fn union(&self, other: &FieldSet) -> FieldSet {
        FieldSet(self.0.union(&other.0).copied().collect())
    }

    /// Iterate in order
    pub fn iter(&self) -> impl Iterator<Item = Field> + '_ {
        self.0.iter().copied()
    }

    /// Number of fields
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Field> for FieldSet {
    fn from_iter<I: IntoIterator<Item = Field>>(iter: I) -> Self {
        FieldSet(iter.into_iter().collect())
    }
}

/// Shared state of one pass
///
/// Deserialisation applies the same checks as [`Context::new`] plus the
/// schema version and a 1-based pass number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ContextRecord")]
pub struct Context {
    version: u32,
    pass: u32,
    user_input: String,
    image_source: Option<PathBuf>,
    vision_summary: Option<String>,
    plan: Option<String>,
    generated_code: Option<String>,
    comparison_prompt: Option<String>,
    plan_prompt: Option<String>,
}

/// Unchecked wire form of [`Context`]
#[derive(Deserialize)]
struct ContextRecord {
    version: u32,
    pass: u32,
    user_input: String,
    image_source: Option<PathBuf>,
    vision_summary: Option<String>,
    plan: Option<String>,
    generated_code: Option<String>,
    comparison_prompt: Option<String>,
    plan_prompt: Option<String>,
}

impl TryFrom<ContextRecord> for Context {
    type Error = PipelineError;

    fn try_from(record: ContextRecord) -> Result<Self, Self::Error> {
        if record.version != CONTEXT_VERSION {
            return Err(PipelineError::Input(format!(
                "unsupported context version {} (expected {CONTEXT_VERSION})",
                record.version
            )));
        }
        if record.pass == 0 {
            return Err(PipelineError::Input("pass numbers start at 1".to_string()));
        }
        let image_blank = record
            .image_source
            .as_ref()
            .map_or(true, |p| p.as_os_str().is_empty());
        if record.user_input.trim().is_empty() && image_blank {
            return Err(PipelineError::Input(
                "either a prompt or an image path is required".to_string(),
            ));
        }

        Ok(Self {
            version: record.version,
            pass: record.pass,
            user_input: record.user_input,
            image_source: record.image_source.filter(|p| !p.as_os_str().is_empty()),
            vision_summary: record.vision_summary,
            plan: record.plan,
            generated_code: record.generated_code,
            comparison_prompt: record.comparison_prompt,
            plan_prompt: record.plan_prompt,
        })
    }
}

impl Context {
    /// Create the pass-1 context from collected input
    ///
    /// An empty image source means a text-only start. At least one of the
    /// two inputs must be non-blank.
    ///
    /// # Errors
    /// `PipelineError::Input` if both inputs are blank.
    pub fn new(
        user_input: impl Into<String>,
        image_source: impl Into<String>,
    ) -> Result<Self, PipelineError> {
        let user_input = user_input.into().trim().to_string();
        let image_source = image_source.into().trim().to_string();

        if user_input.is_empty() && image_source.is_empty() {
            return Err(PipelineError::Input(
                "either a prompt or an image path is required".to_string(),
            ));
        }

        Ok(Self {
            version: CONTEXT_VERSION,
            pass: 1,
            user_input,
            image_source: (!image_source.is_empty()).then(|| PathBuf::from(image_source)),
            vision_summary: None,
            plan: None,
            generated_code: None,
            comparison_prompt: None,
            plan_prompt: None,
        })
    }

    /// With an initial plan-revision prompt
    #[inline]
    #[must_use]
    pub fn with_plan_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.plan_prompt = Some(prompt.into());
        self
    }

    /// Schema version
    #[inline]
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Pass number (1-based)
    #[inline]
    #[must_use]
    pub fn pass(&self) -> u32 {
        self.pass
    }

    #[inline]
    #[must_use]
    pub fn user_input(&self) -> &str {
        &self.user_input
    }

    /// Image to analyse, `None` for a text-only start
    #[inline]
    #[must_use]
    pub fn image_source(&self) -> Option<&Path> {
        self.image_source.as_deref()
    }

    #[inline]
    #[must_use]
    pub fn vision_summary(&self) -> Option<&str> {
        self.vision_summary.as_deref()
    }

    #[inline]
    #[must_use]
    pub fn plan(&self) -> Option<&str> {
        self.plan.as_deref()
    }

    #[inline]
    #[must_use]
    pub fn generated_code(&self) -> Option<&str> {
        self.generated_code.as_deref()
    }

    #[inline]
    #[must_use]
    pub fn comparison_prompt(&self) -> Option<&str> {
        self.comparison_prompt.as_deref()
    }

    #[inline]
    #[must_use]
    pub fn plan_prompt(&self) -> Option<&str> {
        self.plan_prompt.as_deref()
    }

    /// Whether a field currently holds a value
    #[must_use]
    pub fn has(&self, field: Field) -> bool {
        match field {
            Field::UserInput => !self.user_input.is_empty(),
            Field::ImageSource => self.image_source.is_some(),
            Field::VisionSummary => self.vision_summary.is_some(),
            Field::Plan => self.plan.is_some(),
            Field::GeneratedCode => self.generated_code.is_some(),
            Field::ComparisonPrompt => self.comparison_prompt.is_some(),
            Field::PlanPrompt => self.plan_prompt.is_some(),
        }
    }

    /// Set of populated fields
    #[must_use]
    pub fn populated(&self) -> FieldSet {
        [
            Field::UserInput,
            Field::ImageSource,
            Field::VisionSummary,
            Field::Plan,
            Field::GeneratedCode,
            Field::ComparisonPrompt,
            Field::PlanPrompt,
        ]
        .into_iter()
        .filter(|f| self.has(*f))
        .collect()
    }

    /// Read a required text field on behalf of a stage
    ///
    /// # Errors
    /// `PipelineError::MalformedOutput` naming the field when it is unset.
    pub fn require(&self, field: Field, stage: StageKind) -> Result<&str, PipelineError> {
        let value = match field {
            Field::UserInput => Some(self.user_input.as_str()),
            Field::ImageSource => self.image_source.as_deref().and_then(Path::to_str),
            Field::VisionSummary => self.vision_summary(),
            Field::Plan => self.plan(),
            Field::GeneratedCode => self.generated_code(),
            Field::ComparisonPrompt => self.comparison_prompt(),
            Field::PlanPrompt => self.plan_prompt(),
        };
        value.ok_or_else(|| PipelineError::MalformedOutput {
            stage,
            reason: format!("required field `{field}` is not populated"),
        })
    }

    /// Write a stage's output into its field
    ///
    /// Returns the field that was written, or `None` for outputs whose
    /// effect is external.
    pub fn apply(&mut self, output: StageOutput) -> Option<Field> {
        match output {
            StageOutput::VisionSummary(text) => {
                self.vision_summary = Some(text);
                Some(Field::VisionSummary)
            }
            StageOutput::Plan(plan) => {
                self.plan = Some(plan.into_text());
                Some(Field::Plan)
            }
            StageOutput::GeneratedCode(code) => {
                self.generated_code = Some(code);
                Some(Field::GeneratedCode)
            }
            StageOutput::External { .. } => None,
        }
    }

    /// Produce the next pass's context
    ///
    /// The image source always becomes the render path. Prompts are only
    /// replaced when supplied.
    #[must_use]
    pub fn rewrite_for_next_pass(
        mut self,
        render_path: &Path,
        comparison_prompt: Option<String>,
        plan_prompt: Option<String>,
    ) -> Self {
        self.pass += 1;
        self.image_source = Some(render_path.to_path_buf());
        if comparison_prompt.is_some() {
            self.comparison_prompt = comparison_prompt;
        }
        if plan_prompt.is_some() {
            self.plan_prompt = plan_prompt;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ScenePlan;
    use pretty_assertions::assert_eq;

    #[test]
    fn context_requires_some_input() {
        assert!(matches!(Context::new("", ""), Err(PipelineError::Input(_))));
        assert!(matches!(Context::new("   ", "\t"), Err(PipelineError::Input(_))));
        assert!(Context::new("a cube", "").is_ok());
        assert!(Context::new("", "/tmp/ref.png").is_ok());
    }

    #[test]
    fn empty_image_means_text_only() {
        let ctx = Context::new("a red cube", "").unwrap();
        assert!(ctx.image_source().is_none());
        assert_eq!(ctx.pass(), 1);
        assert_eq!(ctx.version(), CONTEXT_VERSION);
    }

    #[test]
    fn apply_writes_only_its_own_field() {
        let mut ctx = Context::new("a red cube", "").unwrap();

        let written = ctx.apply(StageOutput::VisionSummary("a cube".into()));
        assert_eq!(written, Some(Field::VisionSummary));
        assert_eq!(ctx.plan(), None);
        assert_eq!(ctx.generated_code(), None);

        ctx.apply(StageOutput::Plan(ScenePlan::new("A: cube")));
        assert_eq!(ctx.vision_summary(), Some("a cube"));
        assert_eq!(ctx.plan(), Some("A: cube"));

        let before = ctx.clone();
        assert_eq!(ctx.apply(StageOutput::External { rendered: true }), None);
        assert_eq!(ctx, before);
    }

    #[test]
    fn require_reports_missing_field() {
        let ctx = Context::new("a red cube", "").unwrap();
        let err = ctx.require(Field::Plan, StageKind::Code).unwrap_err();
        assert!(err.to_string().contains("plan"));
    }

    #[test]
    fn rewrite_sets_render_path_and_bumps_pass() {
        let mut ctx = Context::new("a red cube", "").unwrap();
        ctx.apply(StageOutput::VisionSummary("a cube".into()));

        let next = ctx.rewrite_for_next_pass(Path::new("/tmp/render.png"), None, None);
        assert_eq!(next.pass(), 2);
        assert_eq!(next.image_source(), Some(Path::new("/tmp/render.png")));
        assert_eq!(next.vision_summary(), Some("a cube"));
        assert_eq!(next.comparison_prompt(), None);
    }

    #[test]
    fn snapshot_round_trips() {
        let mut ctx = Context::new("a red cube", "ref.png").unwrap();
        ctx.apply(StageOutput::GeneratedCode("import bpy".into()));
        let back: Context = serde_json::from_str(&serde_json::to_string(&ctx).unwrap()).unwrap();
        assert_eq!(back, ctx);
    }

    #[test]
    fn snapshot_without_input_is_rejected() {
        let json = serde_json::json!({
            "version": CONTEXT_VERSION,
            "pass": 1,
            "user_input": "  ",
            "image_source": null,
            "vision_summary": null,
            "plan": null,
            "generated_code": null,
            "comparison_prompt": null,
            "plan_prompt": null,
        });
        let err = serde_json::from_value::<Context>(json).unwrap_err();
        assert!(err.to_string().contains("prompt or an image"));
    }

    #[test]
    fn snapshot_with_bad_header_is_rejected() {
        let base = serde_json::to_value(Context::new("a cube", "").unwrap()).unwrap();

        let mut zero_pass = base.clone();
        zero_pass["pass"] = 0.into();
        assert!(serde_json::from_value::<Context>(zero_pass).is_err());

        let mut future = base;
        future["version"] = (CONTEXT_VERSION + 1).into();
        assert!(serde_json::from_value::<Context>(future).is_err());
    }

    #[test]
    fn populated_tracks_fields() {
        let ctx = Context::new("a red cube", "ref.png").unwrap().with_plan_prompt("improve");
        let fields = ctx.populated();
        assert!(fields.contains(Field::UserInput));
        assert!(fields.contains(Field::ImageSource));
        assert!(fields.contains(Field::PlanPrompt));
        assert!(!fields.contains(Field::VisionSummary));
        assert_eq!(fields.len(), 3);
    }
}
