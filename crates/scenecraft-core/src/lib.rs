//! SceneCraft Core - feedback-driven scene construction
//!
//! The orchestration engine that:
//! - Threads a typed [`Context`] through a fixed sequence of stages
//! - Discovers and filters the external tool capabilities
//! - Drives vision, planning, code generation and tool execution stages
//! - Re-renders and re-submits the context for a bounded number of passes
//! - Contains every external call behind timeouts, retries and cancellation
//!
//! # Example
//!
//! ```rust,ignore
//! use scenecraft_core::{EngineConfig, SceneOrchestrator, Services};
//!
//! # async fn example(services: Services) -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = SceneOrchestrator::new(EngineConfig::default(), services)?;
//! let cancel = tokio_util::sync::CancellationToken::new();
//!
//! let ctx = scenecraft_core::Context::new("a red cube on a table", "")?;
//! let report = orchestrator.run_with_context(ctx, &cancel).await?;
//!
//! println!("Completed {} passes", report.passes.len());
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
pub mod agent;
pub mod capability;
pub mod config;
pub mod context;
pub mod error;
pub mod feedback;
pub mod graph;
pub mod guard;
pub mod imaging;
pub mod input;
pub mod journal;
pub mod model;
pub mod orchestrator;
pub mod plan;
pub mod prompts;
pub mod stages;
pub mod state;

// Re-exports for convenience
pub use agent::{AgentOutcome, ToolAgent};
pub use capability::{
    filter, CapabilityDescriptor, CapabilityOutput, CapabilityProvider, CapabilityRegistry,
    ExclusionSet, ProviderError, STANDARD_EXCLUSIONS,
};
pub use config::{
    AgentConfig, CallConfig, CapabilityConfig, ConfigError, EngineConfig, FeedbackConfig,
    InputConfig, ModelConfig, PipelineVariant, SandboxConfig,
};
pub use context::{Context, Field, FieldSet};
pub use error::{PipelineError, RunError};
pub use feedback::{
    FeedbackController, FeedbackOutcome, FixedIterations, IterationDecision, IterationPolicy,
};
pub use graph::{GraphBuilder, GraphError, GraphMode, PassFailure, StageId, WorkflowGraph};
pub use guard::{CallGuard, RetryPolicy};
pub use imaging::{ImageLoader, ImagePayload, PngImageLoader};
pub use input::{collect_initial_context, CollectedInput, InputCollector};
pub use journal::{context_digest, JournalEntry, PassOutcome, PassRecord, RunJournal};
pub use model::{
    CallPurpose, ChatMessage, ChatReply, ChatRequest, ModelError, ModelService, Persona,
    Personas, Role, ToolCall,
};
pub use orchestrator::{RunReport, SceneOrchestrator, Services};
pub use plan::{RelationType, ScenePlan};
pub use prompts::PromptSet;
pub use stages::{
    CodeStage, PlanStage, RenderTarget, ScreenshotStage, Stage, StageEnv, StageKind, StageMode,
    StageOutput, ToolExecutionStage, ToolPlanStage, VisionStage,
};
pub use state::{allowed_transitions, validate_transition, PassPhase, TransitionError};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with SceneCraft Core
    pub use crate::{
        CapabilityProvider, CapabilityRegistry, Context, EngineConfig, FeedbackController,
        ModelService, PipelineError, PipelineVariant, RunError, SceneOrchestrator, Services,
        Stage, StageKind, WorkflowGraph,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
