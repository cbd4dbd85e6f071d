//! MCP capability provider
//!
//! Launches the Blender MCP server as a child process speaking MCP over
//! stdio, optionally wrapped in a sandbox program. The session is started on
//! first use and dropped after a transport failure so the next call
//! relaunches it.

use async_trait::async_trait;
use rmcp::model::{CallToolRequestParam, CallToolResult, RawContent, Tool};
use rmcp::service::{RunningService, ServiceError};
use rmcp::transport::{ConfigureCommandExt, TokioChildProcess};
use rmcp::{RoleClient, ServiceExt};
use scenecraft_core::{
    CapabilityConfig, CapabilityDescriptor, CapabilityOutput, CapabilityProvider, ProviderError,
};
use tokio::process::Command;
use tokio::sync::Mutex;

type Session = RunningService<RoleClient, ()>;

pub struct McpCapabilityProvider {
    program: String,
    args: Vec<String>,
    session: Mutex<Option<Session>>,
}

impl std::fmt::Debug for McpCapabilityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpCapabilityProvider")
            .field("program", &self.program)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

impl McpCapabilityProvider {
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            session: Mutex::new(None),
        }
    }

    /// Launch command from configuration, sandbox wrapper applied
    #[must_use]
    pub fn from_config(config: &CapabilityConfig) -> Self {
        let (program, args) = config.launch();
        Self::new(program, args)
    }

    /// Program and arguments used to launch the server
    #[must_use]
    pub fn command_line(&self) -> (&str, &[String]) {
        (&self.program, &self.args)
    }

    /// Stop the server process if it is running
    pub async fn shutdown(&self) {
        if let Some(session) = self.session.lock().await.take() {
            if let Err(e) = session.cancel().await {
                tracing::warn!(error = %e, "MCP session did not shut down cleanly");
            }
        }
    }

    async fn launch(&self) -> Result<Session, ProviderError> {
        tracing::info!(program = %self.program, args = ?self.args, "launching MCP server");
        let command = Command::new(&self.program).configure(|cmd| {
            cmd.args(&self.args);
        });
        let transport = TokioChildProcess::new(command)
            .map_err(|e| ProviderError::Launch(format!("{}: {e}", self.program)))?;
        ().serve(transport)
            .await
            .map_err(|e| ProviderError::Launch(format!("MCP handshake failed: {e}")))
    }

    async fn ensure<'s>(&self, slot: &'s mut Option<Session>) -> Result<&'s Session, ProviderError> {
        if slot.is_none() {
            *slot = Some(self.launch().await?);
        }
        slot.as_ref()
            .ok_or_else(|| ProviderError::Launch("MCP session unavailable".into()))
    }
}

/// Map a call result, dropping the session on transport failure
fn settle<T>(slot: &mut Option<Session>, result: Result<T, ServiceError>) -> Result<T, ProviderError> {
    result.map_err(|e| {
        tracing::warn!(error = %e, "MCP transport failure, dropping session");
        *slot = None;
        ProviderError::Transport(e.to_string())
    })
}

fn descriptor(tool: Tool) -> CapabilityDescriptor {
    CapabilityDescriptor::new(tool.name.into_owned())
        .with_description(tool.description.map(|d| d.into_owned()).unwrap_or_default())
        .with_schema(serde_json::Value::Object((*tool.input_schema).clone()))
}

fn output(result: CallToolResult) -> CapabilityOutput {
    let text = result
        .content
        .iter()
        .filter_map(|content| match &content.raw {
            RawContent::Text(text) => Some(text.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    if result.is_error.unwrap_or(false) {
        CapabilityOutput::error(text)
    } else {
        CapabilityOutput::ok(text)
    }
}

fn arguments(
    name: &str,
    value: serde_json::Value,
) -> Result<Option<serde_json::Map<String, serde_json::Value>>, ProviderError> {
    match value {
        serde_json::Value::Object(map) => Ok(Some(map)),
        serde_json::Value::Null => Ok(None),
        other => Err(ProviderError::Transport(format!(
            "arguments for `{name}` must be a JSON object, got {other}"
        ))),
    }
}

#[async_trait]
impl CapabilityProvider for McpCapabilityProvider {
    async fn discover(&self) -> Result<Vec<CapabilityDescriptor>, ProviderError> {
        let mut slot = self.session.lock().await;
        let result = self.ensure(&mut slot).await?.list_all_tools().await;
        let tools = settle(&mut slot, result)?;
        tracing::debug!(count = tools.len(), "MCP tools listed");
        Ok(tools.into_iter().map(descriptor).collect())
    }

    async fn invoke(
        &self,
        name: &str,
        arguments_value: serde_json::Value,
    ) -> Result<CapabilityOutput, ProviderError> {
        let params = CallToolRequestParam {
            name: name.to_string().into(),
            arguments: arguments(name, arguments_value)?,
        };
        let mut slot = self.session.lock().await;
        let result = self.ensure(&mut slot).await?.call_tool(params).await;
        Ok(output(settle(&mut slot, result)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenecraft_core::SandboxConfig;
    use serde_json::json;

    #[test]
    fn sandboxed_launch_wraps_server_command() {
        let mut config = CapabilityConfig::default();
        config.sandbox = SandboxConfig {
            enabled: true,
            ..SandboxConfig::default()
        };
        let provider = McpCapabilityProvider::from_config(&config);
        let (program, args) = provider.command_line();
        assert_eq!(program, "firejail");
        assert_eq!(args.last().map(String::as_str), Some("blender-mcp"));
        assert!(args.iter().any(|a| a == "uvx"));
    }

    #[test]
    fn non_object_arguments_are_rejected() {
        assert!(arguments("execute_blender_code", json!("code")).is_err());
        assert!(arguments("get_scene_info", json!(null)).unwrap().is_none());
        assert_eq!(
            arguments("execute_blender_code", json!({ "code": "x" }))
                .unwrap()
                .unwrap()["code"],
            "x"
        );
    }

    #[tokio::test]
    async fn missing_server_binary_is_a_launch_error() {
        let provider = McpCapabilityProvider::new("/nonexistent/scenecraft-mcp-server", vec![]);
        let err = provider.discover().await.unwrap_err();
        assert!(matches!(err, ProviderError::Launch(_)));
    }
}
