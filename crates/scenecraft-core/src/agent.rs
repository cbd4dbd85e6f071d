//! Tool-calling agent
//!
//! A reason-and-act loop over the filtered capability set: the model sees the
//! conversation plus the capability schemas, requests tool calls, and gets
//! each result back as a tool message. Capability failures are reported to
//! the model as text so it can correct its code and try again. The loop ends
//! on the first reply that requests no tool calls.

use crate::capability::{
    CapabilityDescriptor, CapabilityOutput, CapabilityProvider, ProviderError,
};
use crate::error::PipelineError;
use crate::guard::CallGuard;
use crate::model::{CallPurpose, ChatMessage, ChatRequest, ModelService, Persona, ToolCall};
use crate::plan::strip_reasoning;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const AGENT_TARGET: &str = "tool agent";

/// Result of one agent invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentOutcome {
    /// Assistant text of the whole exchange, reasoning removed
    pub text: String,
    /// Model turns used
    pub steps: usize,
    /// Capability names requested by the model, in order
    pub invoked: Vec<String>,
    /// Invocations reported back to the model as failed
    pub failed_calls: usize,
}

/// What one guarded invocation produced
enum Invocation {
    Output(CapabilityOutput),
    /// Refused by the provider, reported to the model
    Refused(String),
    /// Session failed after the request was sent
    Broken(String),
}

/// Agent bound to one capability set
pub struct ToolAgent {
    model: Arc<dyn ModelService>,
    provider: Arc<dyn CapabilityProvider>,
    persona: Persona,
    tools: Vec<CapabilityDescriptor>,
    max_steps: usize,
}

impl std::fmt::Debug for ToolAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolAgent")
            .field("persona", &self.persona)
            .field("tools", &self.tools.len())
            .field("max_steps", &self.max_steps)
            .finish_non_exhaustive()
    }
}

impl ToolAgent {
    #[must_use]
    pub fn new(
        model: Arc<dyn ModelService>,
        provider: Arc<dyn CapabilityProvider>,
        persona: Persona,
        tools: Vec<CapabilityDescriptor>,
    ) -> Self {
        Self {
            model,
            provider,
            persona,
            tools,
            max_steps: 25,
        }
    }

    #[must_use]
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// Capabilities offered to the model
    #[must_use]
    pub fn tools(&self) -> &[CapabilityDescriptor] {
        &self.tools
    }

    fn offers(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }

    /// Run the loop for one user instruction
    ///
    /// Every model turn and every capability invocation is guarded
    /// individually.
    ///
    /// # Errors
    /// The guard's error when a model turn or an invocation's transport keeps
    /// failing, or `PipelineError::ExternalCall` when the step budget runs
    /// out before a final answer.
    #[tracing::instrument(name = "agent", skip_all, fields(tools = self.tools.len()))]
    pub async fn run(
        &self,
        instruction: &str,
        guard: &CallGuard,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome, PipelineError> {
        let mut messages = vec![ChatMessage::user(instruction)];
        let mut transcript = Vec::new();
        let mut outcome = AgentOutcome::default();

        for step in 1..=self.max_steps {
            let request = ChatRequest {
                persona: self.persona.clone(),
                purpose: CallPurpose::ToolAgent,
                messages: messages.clone(),
                tools: self.tools.clone(),
            };
            let reply = guard
                .call(AGENT_TARGET, cancel, |_| {
                    let model = self.model.clone();
                    let request = request.clone();
                    async move {
                        model
                            .chat(request)
                            .await
                            .map_err(|e| PipelineError::external(AGENT_TARGET, e.to_string()))
                    }
                })
                .await?;
            outcome.steps = step;

            if !reply.content.trim().is_empty() {
                transcript.push(reply.content.clone());
            }
            if reply.tool_calls.is_empty() {
                outcome.text = strip_reasoning(&transcript.join("\n\n"));
                tracing::info!(
                    steps = outcome.steps,
                    invoked = outcome.invoked.len(),
                    failed = outcome.failed_calls,
                    "agent finished"
                );
                return Ok(outcome);
            }

            messages.push(ChatMessage::assistant(
                reply.content,
                reply.tool_calls.clone(),
            ));
            for call in reply.tool_calls {
                let (text, failed) = self.invoke(&call, guard, cancel).await?;
                outcome.invoked.push(call.name.clone());
                if failed {
                    outcome.failed_calls += 1;
                }
                messages.push(ChatMessage::tool(call.name, text));
            }
        }

        Err(PipelineError::external(
            AGENT_TARGET,
            format!("no final answer after {} steps", self.max_steps),
        ))
    }

    /// Invoke one requested capability, returning the text fed back and
    /// whether it failed
    async fn invoke(
        &self,
        call: &ToolCall,
        guard: &CallGuard,
        cancel: &CancellationToken,
    ) -> Result<(String, bool), PipelineError> {
        if !self.offers(&call.name) {
            tracing::warn!(capability = %call.name, "model requested an unavailable capability");
            return Ok((format!("Error: capability `{}` is not available", call.name), true));
        }

        // Invocations mutate the scene; only launch failures are retried
        let target = format!("capability {}", call.name);
        let result = guard
            .call_when(
                &target,
                cancel,
                |e| matches!(e, PipelineError::ExternalCall { .. }),
                |_| {
                    let provider = self.provider.clone();
                    let name = call.name.clone();
                    let arguments = call.arguments.clone();
                    let target = target.clone();
                    async move {
                        match provider.invoke(&name, arguments).await {
                            Ok(output) => Ok(Invocation::Output(output)),
                            Err(ProviderError::UnknownCapability(n)) => {
                                Ok(Invocation::Refused(format!("Error: unknown capability `{n}`")))
                            }
                            Err(e @ ProviderError::Launch(_)) => {
                                Err(PipelineError::external(target, e.to_string()))
                            }
                            Err(e) => Ok(Invocation::Broken(e.to_string())),
                        }
                    }
                },
            )
            .await?;

        metrics::counter!("scenecraft_capability_invocations_total", "capability" => call.name.clone())
            .increment(1);

        match result {
            Invocation::Output(output) if output.is_error => {
                tracing::debug!(capability = %call.name, "capability reported an error");
                Ok((format!("Error: {}", output.text), true))
            }
            Invocation::Output(output) => Ok((output.text, false)),
            Invocation::Refused(text) => Ok((text, true)),
            Invocation::Broken(message) => Err(PipelineError::external(target, message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::RetryPolicy;
    use crate::model::{ChatReply, Role};
    use crate::stages::testing::{fast_guard, MockModel, MockProvider};
    use mockall::Sequence;
    use serde_json::json;

    fn tools() -> Vec<CapabilityDescriptor> {
        vec![CapabilityDescriptor::new("execute_blender_code")]
    }

    fn call(name: &str) -> ToolCall {
        ToolCall {
            name: name.to_string(),
            arguments: json!({ "code": "import bpy" }),
        }
    }

    #[tokio::test]
    async fn executes_calls_until_final_answer() {
        let mut seq = Sequence::new();
        let mut model = MockModel::new();
        model
            .expect_chat()
            .withf(|req| req.tools.len() == 1 && req.messages.len() == 1)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ChatReply::calls(vec![call("execute_blender_code")])));
        model
            .expect_chat()
            .withf(|req| {
                req.messages.last().is_some_and(|m| m.role == Role::Tool && m.content == "done")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ChatReply::text("<think>ok</think>Scene built.")));

        let mut provider = MockProvider::new();
        provider
            .expect_invoke()
            .times(1)
            .returning(|_, _| Ok(CapabilityOutput::ok("done")));

        let agent = ToolAgent::new(
            Arc::new(model),
            Arc::new(provider),
            Persona::new("qwen3:235b", 0.0),
            tools(),
        );
        let outcome = agent
            .run("build it", &fast_guard(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.text, "Scene built.");
        assert_eq!(outcome.steps, 2);
        assert_eq!(outcome.invoked, vec!["execute_blender_code"]);
        assert_eq!(outcome.failed_calls, 0);
    }

    #[tokio::test]
    async fn capability_errors_are_fed_back() {
        let mut seq = Sequence::new();
        let mut model = MockModel::new();
        model
            .expect_chat()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ChatReply::calls(vec![call("execute_blender_code")])));
        model
            .expect_chat()
            .withf(|req| {
                req.messages
                    .last()
                    .is_some_and(|m| m.content.starts_with("Error: NameError"))
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ChatReply::text("fixed")));

        let mut provider = MockProvider::new();
        provider
            .expect_invoke()
            .returning(|_, _| Ok(CapabilityOutput::error("NameError: cube")));

        let agent = ToolAgent::new(
            Arc::new(model),
            Arc::new(provider),
            Persona::new("m", 0.0),
            tools(),
        );
        let outcome = agent
            .run("build it", &fast_guard(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.failed_calls, 1);
    }

    #[tokio::test]
    async fn excluded_capability_is_never_invoked() {
        let mut seq = Sequence::new();
        let mut model = MockModel::new();
        model
            .expect_chat()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ChatReply::calls(vec![call("search_sketchfab_models")])));
        model
            .expect_chat()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ChatReply::text("ok")));

        let mut provider = MockProvider::new();
        provider.expect_invoke().never();

        let agent = ToolAgent::new(
            Arc::new(model),
            Arc::new(provider),
            Persona::new("m", 0.0),
            tools(),
        );
        let outcome = agent
            .run("find a chair", &fast_guard(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.failed_calls, 1);
        assert_eq!(outcome.invoked, vec!["search_sketchfab_models"]);
    }

    fn calls_once_then_finishes() -> MockModel {
        let mut model = MockModel::new();
        let mut seq = Sequence::new();
        model
            .expect_chat()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ChatReply::calls(vec![call("execute_blender_code")])));
        model
            .expect_chat()
            .times(0..=1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ChatReply::text("done")));
        model
    }

    #[tokio::test]
    async fn launch_failures_are_retried() {
        let mut provider = MockProvider::new();
        let mut calls = Sequence::new();
        provider
            .expect_invoke()
            .times(2)
            .in_sequence(&mut calls)
            .returning(|_, _| Err(ProviderError::Launch("connection refused".into())));
        provider
            .expect_invoke()
            .times(1)
            .in_sequence(&mut calls)
            .returning(|_, _| Ok(CapabilityOutput::ok("ok")));

        let agent = ToolAgent::new(
            Arc::new(calls_once_then_finishes()),
            Arc::new(provider),
            Persona::new("m", 0.0),
            tools(),
        );
        let outcome = agent
            .run("build", &fast_guard(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.failed_calls, 0);
    }

    #[tokio::test]
    async fn broken_session_is_not_reinvoked() {
        let mut provider = MockProvider::new();
        provider
            .expect_invoke()
            .times(1)
            .returning(|_, _| Err(ProviderError::Transport("broken pipe".into())));

        let agent = ToolAgent::new(
            Arc::new(calls_once_then_finishes()),
            Arc::new(provider),
            Persona::new("m", 0.0),
            tools(),
        );
        let err = agent
            .run("build", &fast_guard(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ExternalCall { .. }));
    }

    struct SlowExecution(std::sync::atomic::AtomicU32);

    #[async_trait::async_trait]
    impl CapabilityProvider for SlowExecution {
        async fn discover(&self) -> Result<Vec<CapabilityDescriptor>, ProviderError> {
            Ok(tools())
        }

        async fn invoke(
            &self,
            _name: &str,
            _arguments: serde_json::Value,
        ) -> Result<CapabilityOutput, ProviderError> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(CapabilityOutput::ok("late"))
        }
    }

    #[tokio::test]
    async fn timed_out_execution_is_not_repeated() {
        let provider = Arc::new(SlowExecution(std::sync::atomic::AtomicU32::new(0)));
        let guard = CallGuard::new(
            std::time::Duration::from_millis(50),
            RetryPolicy::new(3, std::time::Duration::from_millis(1), std::time::Duration::from_millis(2)),
        );
        let agent = ToolAgent::new(
            Arc::new(calls_once_then_finishes()),
            provider.clone(),
            Persona::new("m", 0.0),
            tools(),
        );

        let err = agent
            .run("build", &guard, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Timeout { .. }));
        assert_eq!(provider.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn step_budget_is_enforced() {
        let mut model = MockModel::new();
        model
            .expect_chat()
            .times(2)
            .returning(|_| Ok(ChatReply::calls(vec![call("execute_blender_code")])));
        let mut provider = MockProvider::new();
        provider
            .expect_invoke()
            .returning(|_, _| Ok(CapabilityOutput::ok("ok")));

        let agent = ToolAgent::new(
            Arc::new(model),
            Arc::new(provider),
            Persona::new("m", 0.0),
            tools(),
        )
        .with_max_steps(2);
        let err = agent
            .run("loop", &fast_guard(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no final answer"));
    }
}
