//! Per-type action backends
//!
//! Each accepted request runs through exactly one of these. Subprocess
//! children are spawned with `kill_on_drop` so the executor's timeout
//! wrapper terminates them when the deadline passes.

use outpost_proto::{AgentError, ExecutionRequest, TaskType};
use serde::Deserialize;
use std::sync::Arc;
use tokio::process::Command;

use super::policy::PYTHON_INTERPRETER;
use crate::hardware::{PinAction, PinControl};

/// Shared resources actions draw on
pub struct ActionContext {
    pub pins: Arc<dyn PinControl>,
    pub max_file_bytes: u64,
}

#[derive(Deserialize)]
struct ShellParams {
    command: String,
}

#[derive(Deserialize)]
struct ScriptParams {
    path: String,
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Deserialize)]
struct PythonParams {
    code: String,
}

#[derive(Deserialize)]
struct FileReadParams {
    path: String,
}

#[derive(Deserialize)]
struct FileWriteParams {
    path: String,
    contents: String,
    #[serde(default)]
    append: bool,
}

#[derive(Deserialize)]
struct ServiceParams {
    unit: String,
    action: ServiceAction,
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "snake_case")]
enum ServiceAction {
    Start,
    Stop,
    Restart,
    Status,
    Enable,
    Disable,
}

impl ServiceAction {
    fn verb(self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
            ServiceAction::Status => "status",
            ServiceAction::Enable => "enable",
            ServiceAction::Disable => "disable",
        }
    }
}

#[derive(Deserialize)]
struct GpioParams {
    pin: u32,
    action: PinAction,
}

/// Run the action for an accepted request, returning its output
pub async fn run(request: &ExecutionRequest, ctx: &ActionContext) -> Result<String, AgentError> {
    match request.task_type {
        TaskType::Shell => {
            let params: ShellParams = parse(request)?;
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&params.command);
            run_command(cmd).await
        }
        TaskType::Script => {
            let params: ScriptParams = parse(request)?;
            let mut cmd = Command::new(&params.path);
            cmd.args(&params.args);
            run_command(cmd).await
        }
        TaskType::Python => {
            let params: PythonParams = parse(request)?;
            let mut cmd = Command::new(PYTHON_INTERPRETER);
            cmd.arg("-c").arg(&params.code);
            run_command(cmd).await
        }
        TaskType::FileRead => {
            let params: FileReadParams = parse(request)?;
            file_read(&params, ctx.max_file_bytes).await
        }
        TaskType::FileWrite => {
            let params: FileWriteParams = parse(request)?;
            file_write(&params, ctx.max_file_bytes).await
        }
        TaskType::Service => {
            let params: ServiceParams = parse(request)?;
            let mut cmd = Command::new("systemctl");
            cmd.arg(params.action.verb()).arg(&params.unit);
            run_command(cmd).await
        }
        TaskType::Gpio => {
            let params: GpioParams = parse(request)?;
            let report = ctx
                .pins
                .apply(params.pin, params.action)
                .await
                .map_err(|e| AgentError::Execution(e.to_string()))?;
            serde_json::to_string(&report).map_err(|e| AgentError::Execution(e.to_string()))
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(request: &ExecutionRequest) -> Result<T, AgentError> {
    serde_json::from_value(request.parameters.clone())
        .map_err(|e| AgentError::Execution(format!("invalid parameters: {e}")))
}

async fn run_command(mut cmd: Command) -> Result<String, AgentError> {
    cmd.kill_on_drop(true);

    let output = cmd
        .output()
        .await
        .map_err(|e| AgentError::Execution(format!("spawn failed: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if output.status.success() {
        Ok(stdout.into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(AgentError::Execution(format!(
            "{}: {}",
            output.status,
            stderr.trim()
        )))
    }
}

async fn file_read(params: &FileReadParams, max_bytes: u64) -> Result<String, AgentError> {
    let meta = tokio::fs::metadata(&params.path)
        .await
        .map_err(|e| AgentError::Execution(format!("{}: {e}", params.path)))?;
    if meta.len() > max_bytes {
        return Err(AgentError::Execution(format!(
            "{} is {} bytes, over the {} byte read limit",
            params.path,
            meta.len(),
            max_bytes
        )));
    }

    let bytes = tokio::fs::read(&params.path)
        .await
        .map_err(|e| AgentError::Execution(format!("{}: {e}", params.path)))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

async fn file_write(params: &FileWriteParams, max_bytes: u64) -> Result<String, AgentError> {
    if params.contents.len() as u64 > max_bytes {
        return Err(AgentError::Execution(format!(
            "write of {} bytes exceeds the {} byte limit",
            params.contents.len(),
            max_bytes
        )));
    }

    if params.append {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&params.path)
            .await
            .map_err(|e| AgentError::Execution(format!("{}: {e}", params.path)))?;
        file.write_all(params.contents.as_bytes())
            .await
            .map_err(|e| AgentError::Execution(e.to_string()))?;
    } else {
        tokio::fs::write(&params.path, &params.contents)
            .await
            .map_err(|e| AgentError::Execution(format!("{}: {e}", params.path)))?;
    }

    Ok(format!("wrote {} bytes", params.contents.len()))
}
