//! Engine configuration
//!
//! Loaded from TOML; every field has a default, so an empty file is a valid
//! configuration. The CLI overrides individual values from its flags.

use crate::capability::ExclusionSet;
use crate::guard::{CallGuard, RetryPolicy};
use crate::model::Personas;
use crate::prompts::PromptSet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which stage sequence drives the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineVariant {
    /// Vision → plan → code → tool execution, then vision → code → tool
    /// execution on feedback passes
    #[default]
    CodeFirst,
    /// Vision → tool-integrated plan on every pass, with explicit prompts
    ToolPlanned,
}

impl PipelineVariant {
    /// Whether the controller composes comparison and plan prompts
    #[must_use]
    pub fn uses_explicit_prompts(self) -> bool {
        matches!(self, PipelineVariant::ToolPlanned)
    }

    /// Prompt set of the variant
    #[must_use]
    pub fn prompts(self) -> PromptSet {
        match self {
            PipelineVariant::CodeFirst => PromptSet::code_first(),
            PipelineVariant::ToolPlanned => PromptSet::tool_planned(),
        }
    }
}

impl std::str::FromStr for PipelineVariant {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code-first" => Ok(PipelineVariant::CodeFirst),
            "tool-planned" => Ok(PipelineVariant::ToolPlanned),
            other => Err(ConfigError::Invalid(format!("unknown pipeline variant `{other}`"))),
        }
    }
}

/// Model service endpoint and personas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    #[serde(flatten)]
    pub personas: Personas,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            personas: Personas::default(),
        }
    }
}

/// Sandbox launcher wrapped around the capability provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub enabled: bool,
    pub program: String,
    pub args: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: "firejail".to_string(),
            args: [
                "--private",
                "--net=none",
                "--caps.drop=all",
                "--seccomp",
                "--private-dev",
                "--hostname=sandbox",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// Capability provider subprocess
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    pub command: String,
    pub args: Vec<String>,
    pub sandbox: SandboxConfig,
    pub excluded: ExclusionSet,
    /// Discover once per session instead of once per stage entry
    pub cache_per_session: bool,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            command: "uvx".to_string(),
            args: vec!["blender-mcp".to_string()],
            sandbox: SandboxConfig::default(),
            excluded: ExclusionSet::standard(),
            cache_per_session: false,
        }
    }
}

impl CapabilityConfig {
    /// Program and arguments to spawn, sandbox launcher first when enabled
    #[must_use]
    pub fn launch(&self) -> (String, Vec<String>) {
        if !self.sandbox.enabled {
            return (self.command.clone(), self.args.clone());
        }
        let mut args = self.sandbox.args.clone();
        args.push(self.command.clone());
        args.extend(self.args.iter().cloned());
        (self.sandbox.program.clone(), args)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Passes after the first
    pub iterations: u32,
    /// Re-runs of a failed pass with unchanged inputs
    pub pass_retries: u32,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            iterations: 4,
            pass_retries: 1,
        }
    }
}

/// Timeout and retry of every external call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
        }
    }
}

impl CallConfig {
    #[must_use]
    pub fn guard(&self) -> CallGuard {
        CallGuard::new(
            Duration::from_secs(self.timeout_secs),
            RetryPolicy::new(
                self.max_attempts,
                Duration::from_millis(self.initial_backoff_ms),
                Duration::from_millis(self.max_backoff_ms),
            ),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_steps: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { max_steps: 25 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Collector invocations before giving up
    pub max_prompts: u32,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self { max_prompts: 5 }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub models: ModelConfig,
    pub capabilities: CapabilityConfig,
    pub feedback: FeedbackConfig,
    pub calls: CallConfig,
    pub agent: AgentConfig,
    pub input: InputConfig,
    pub variant: PipelineVariant,
    /// Where the render snippet writes the still
    pub render_path: PathBuf,
    pub require_render_artifact: bool,
    /// Run journal location; no journal when unset
    pub journal_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            models: ModelConfig::default(),
            capabilities: CapabilityConfig::default(),
            feedback: FeedbackConfig::default(),
            calls: CallConfig::default(),
            agent: AgentConfig::default(),
            input: InputConfig::default(),
            variant: PipelineVariant::default(),
            render_path: PathBuf::from("render.png"),
            require_render_artifact: true,
            journal_dir: None,
        }
    }
}

impl EngineConfig {
    /// Parse from TOML text
    ///
    /// # Errors
    /// `ConfigError::Parse` on malformed TOML or mistyped values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// `ConfigError::Io` if the file cannot be read, `ConfigError::Parse`
    /// if it does not parse.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// `ConfigError::Invalid` describing the first offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.calls.max_attempts == 0 {
            return invalid("calls.max_attempts must be at least 1".into());
        }
        if self.calls.timeout_secs == 0 {
            return invalid("calls.timeout_secs must be positive".into());
        }
        if self.calls.initial_backoff_ms > self.calls.max_backoff_ms {
            return invalid("calls.initial_backoff_ms exceeds calls.max_backoff_ms".into());
        }
        for (role, persona) in self.models.personas.iter() {
            if persona.model.trim().is_empty() {
                return invalid(format!("models.{role}.model is empty"));
            }
            if !(0.0..=2.0).contains(&persona.temperature) {
                return invalid(format!(
                    "models.{role}.temperature {} is outside [0, 2]",
                    persona.temperature
                ));
            }
        }
        if self.models.base_url.trim().is_empty() {
            return invalid("models.base_url is empty".into());
        }
        if self.capabilities.command.trim().is_empty() {
            return invalid("capabilities.command is empty".into());
        }
        if self.agent.max_steps == 0 {
            return invalid("agent.max_steps must be at least 1".into());
        }
        if self.input.max_prompts == 0 {
            return invalid("input.max_prompts must be at least 1".into());
        }
        if self.render_path.as_os_str().is_empty() {
            return invalid("render_path is empty".into());
        }
        Ok(())
    }
}
