//! Error types for SceneCraft Core
//!
//! Provides error handling for:
//! - Missing user input
//! - Unreadable reference images and renders
//! - Capability discovery failures
//! - Model service and tool agent call failures
//! - Empty or unusable stage output
//! - Run aborts after the pass retry budget is spent

use crate::context::Context;
use crate::graph::GraphError;
use crate::stages::StageKind;
use std::path::PathBuf;

/// Error raised inside a stage or around an external call
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// No usable user input
    #[error("input error: {0}")]
    Input(String),

    /// Reference image or render could not be loaded
    #[error("image load error for {}: {reason}", .path.display())]
    ImageLoad { path: PathBuf, reason: String },

    /// Capability provider unreachable or returned an unusable set
    #[error("capability discovery failed: {0}")]
    Discovery(String),

    /// Model service or tool agent invocation failed
    #[error("external call to {target} failed: {message}")]
    ExternalCall { target: String, message: String },

    /// External call exceeded its deadline
    #[error("external call to {target} timed out after {timeout_ms}ms")]
    Timeout { target: String, timeout_ms: u64 },

    /// Stage output is empty or unusable downstream
    #[error("malformed output from {stage} stage: {reason}")]
    MalformedOutput { stage: StageKind, reason: String },

    /// Workflow graph failed validation
    #[error("graph construction failed: {0}")]
    Graph(#[from] GraphError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Run journal could not be written
    #[error("journal error: {0}")]
    Journal(String),

    /// Cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Check if error is retryable
    ///
    /// Only transient failures of external calls are retried; everything
    /// else would fail again with the same inputs.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExternalCall { .. } | Self::Timeout { .. })
    }

    /// Create an external call error
    #[inline]
    pub fn external(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalCall {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Short classification used in logs and metrics labels
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Input(_) => "input",
            Self::ImageLoad { .. } => "image_load",
            Self::Discovery(_) => "discovery",
            Self::ExternalCall { .. } => "external_call",
            Self::Timeout { .. } => "timeout",
            Self::MalformedOutput { .. } => "malformed_output",
            Self::Graph(_) => "graph",
            Self::Config(_) => "config",
            Self::Journal(_) => "journal",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Terminal error of a whole run
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// No usable input was collected
    #[error("no usable input: {0}")]
    Input(#[source] PipelineError),

    /// A pass kept failing after its retry budget
    #[error("pass {pass} failed in {} after {attempts} attempt(s): {source}", stage_label(.stage))]
    Aborted {
        /// Pass number (1-based)
        pass: u32,
        /// Failing stage, if the failure happened inside one
        stage: Option<StageKind>,
        /// Attempts made for this pass
        attempts: u32,
        /// Underlying error of the last attempt
        #[source]
        source: PipelineError,
        /// Context at the failure point
        partial: Box<Context>,
    },

    /// Cancelled between or during passes
    #[error("run cancelled during pass {pass}")]
    Cancelled {
        pass: u32,
        partial: Box<Context>,
    },

    /// Setup failed before the first pass
    #[error("setup failed: {0}")]
    Setup(#[source] PipelineError),

    /// The run journal could not be written
    #[error("journal write failed: {0}")]
    Journal(#[source] PipelineError),
}

impl RunError {
    /// Context preserved at the failure point, if any
    #[must_use]
    pub fn partial_context(&self) -> Option<&Context> {
        match self {
            Self::Aborted { partial, .. } | Self::Cancelled { partial, .. } => Some(partial),
            Self::Input(_) | Self::Setup(_) | Self::Journal(_) => None,
        }
    }

    /// Pass during which the run stopped
    #[must_use]
    pub fn pass(&self) -> Option<u32> {
        match self {
            Self::Aborted { pass, .. } | Self::Cancelled { pass, .. } => Some(*pass),
            Self::Input(_) | Self::Setup(_) | Self::Journal(_) => None,
        }
    }
}

fn stage_label(stage: &Option<StageKind>) -> String {
    stage.map_or_else(|| "pass setup".to_string(), |s| format!("{s} stage"))
}
