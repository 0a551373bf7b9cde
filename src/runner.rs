use std::process::Stdio;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use weft_core::traits::{TaskError, TaskInvocation, TaskOutput, TaskRunner};

/// Runs every node through one shell command.
///
/// The command gets the node's coordinates as `WEFT_*` variables and the
/// execution context as JSON on stdin. Stdout is parsed as JSON when it can
/// be, otherwise kept as a string. A non-zero exit fails the attempt with
/// the command's stderr as the error text.
pub struct CommandRunner {
    command: String,
}

impl CommandRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    async fn execute(&self, invocation: TaskInvocation) -> Result<TaskOutput, TaskError> {
        let node = &invocation.node;
        let mut command = tokio::process::Command::new("sh");
        command
            .args(["-c", &self.command])
            .current_dir(&invocation.work_dir)
            .env("WEFT_RUN_ID", invocation.run_id.as_str())
            .env("WEFT_NODE_ID", &node.id)
            .env("WEFT_NODE_TYPE", node.node_type.as_str())
            .env("WEFT_NODE_LABEL", &node.label)
            .env("WEFT_STEP", node.step_number.to_string())
            .env("WEFT_ATTEMPT", invocation.attempt.to_string())
            .env("WEFT_RUN_DIR", &invocation.run_dir)
            .env("WEFT_TASK", &invocation.context.task)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(guidance) = &invocation.retry_guidance {
            command.env("WEFT_RETRY_GUIDANCE", guidance);
        }

        let mut child = command
            .spawn()
            .map_err(|e| TaskError::new(format!("failed to spawn task command: {}", e)))?;

        let input = serde_json::to_vec(invocation.context.as_ref())
            .map_err(|e| TaskError::new(e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            // The command may exit without reading its input.
            if let Err(e) = stdin.write_all(&input).await {
                debug!(node_id = %node.id, error = %e, "Task command closed stdin early");
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| TaskError::new(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(node_id = %node.id, code = output.status.code(), "Task command failed");
            let message = match stderr.trim() {
                "" => format!("task command exited with {}", output.status),
                text => text.to_string(),
            };
            return Err(TaskError::new(message));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        let value = serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()));
        Ok(TaskOutput::new(value))
    }
}

impl TaskRunner for CommandRunner {
    fn run(&self, invocation: TaskInvocation) -> BoxFuture<'_, Result<TaskOutput, TaskError>> {
        Box::pin(self.execute(invocation))
    }
}
