//! Command execution inside a mirror.

use std::sync::Arc;

use async_trait::async_trait;
use mcp_core::{tool_result, McpResult, McpTool, ToolAnnotations};
use mirrorkit_engine::{CommandExecution, CommandRequest, EnvMode, MirrorError, Sandbox};
use serde_json::{json, Value};
use tracing::warn;

use crate::context::{
    acquire, optional_bool, optional_str, optional_u64, required_str, target_schema,
    MirrorContext, Target,
};
use crate::errors::{internal_error, mirror_error};

pub struct RunCommandTool {
    context: Arc<MirrorContext>,
}

impl RunCommandTool {
    pub fn new(context: Arc<MirrorContext>) -> Self {
        Self { context }
    }
}

fn request_from_params(params: &Value) -> McpResult<CommandRequest> {
    Ok(CommandRequest {
        command: required_str(params, "command")?.to_string(),
        workdir: optional_str(params, "workdir")?.map(str::to_string),
        timeout_secs: optional_u64(params, "timeout")?,
        env_mode: EnvMode::from_flags(
            optional_bool(params, "use_ephemeral_env", false)?,
            optional_bool(params, "install_dependencies", false)?,
        ),
        max_stdout_bytes: optional_u64(params, "max_stdout_bytes")?,
        max_stderr_bytes: optional_u64(params, "max_stderr_bytes")?,
    })
}

fn summarize(execution: &CommandExecution) -> String {
    let status = if execution.timed_out {
        format!("timed out after {}s", execution.timeout_secs)
    } else {
        match execution.exit_code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    };
    let mut text = format!(
        "$ {}  (in {}, {}, {} ms)",
        execution.command, execution.workdir, status, execution.elapsed_ms
    );
    for (label, body, truncated) in [
        ("stdout", &execution.stdout, execution.stdout_truncated),
        ("stderr", &execution.stderr, execution.stderr_truncated),
    ] {
        if body.is_empty() {
            continue;
        }
        text.push_str(&format!("\n\n[{}]\n{}", label, body.trim_end()));
        if truncated {
            text.push_str("\n[truncated]");
        }
    }
    text
}

#[async_trait]
impl McpTool for RunCommandTool {
    fn name(&self) -> &str {
        "run_workspace_command"
    }

    fn description(&self) -> &str {
        "Run a shell command inside a mirror under a timeout and output caps. Non-zero exit \
         codes are results, not errors. Set use_ephemeral_env to activate the per-mirror \
         environment, install_dependencies to install into it first."
    }

    async fn execute(&self, params: Value) -> McpResult<Value> {
        let target = Target::from_params(&params)?;
        let request = request_from_params(&params)?;
        let sandbox = Sandbox::new(self.context.manager().config().exec.clone());

        let execution = self
            .context
            .blocking(move |manager| {
                let handle = acquire(manager, &target)?;
                sandbox.run(&handle, &request)
            })
            .await?;

        let mut structured =
            serde_json::to_value(&execution).map_err(|e| internal_error(e.to_string()))?;
        if execution.timed_out {
            warn!(
                target: "mirrorkit_tools",
                command = %execution.command,
                timeout_secs = execution.timeout_secs,
                "command timed out"
            );
            let err = MirrorError::Timeout {
                timeout_secs: execution.timeout_secs,
                command: execution.command.clone(),
            };
            structured["error"] = mirror_error(err).data().unwrap_or(Value::Null);
        }
        Ok(tool_result(summarize(&execution), structured))
    }

    fn input_schema(&self) -> Value {
        target_schema(
            json!({
                "command": {"type": "string", "description": "Shell command line"},
                "workdir": {"type": "string", "description": "Mirror-relative working directory"},
                "timeout": {"type": "integer", "minimum": 1, "description": "Seconds"},
                "use_ephemeral_env": {"type": "boolean", "default": false},
                "install_dependencies": {"type": "boolean", "default": false},
                "max_stdout_bytes": {"type": "integer", "minimum": 1},
                "max_stderr_bytes": {"type": "integer", "minimum": 1}
            }),
            &["command"],
        )
    }

    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations {
            destructive_hint: true,
            open_world_hint: true,
            ..ToolAnnotations::default()
        }
    }
}
