//! Action policy enforcement
//!
//! Every request resolves to a single action token which is checked
//! against the blocklist (deny always) and then the allowlist (absence
//! from a non-empty list denies). The check precedes execution for every
//! task type; there is no bypass.

use outpost_proto::{AgentError, ExecutionRequest, TaskType};
use std::path::Path;

/// The interpreter token the `python` task type resolves to
pub const PYTHON_INTERPRETER: &str = "python3";

/// Allowlist/blocklist pair governing what the executor may run
pub struct ExecutionPolicy {
    allowlist: Vec<String>,
    blocklist: Vec<String>,
}

impl ExecutionPolicy {
    pub fn new(allowlist: Vec<String>, blocklist: Vec<String>) -> Self {
        Self { allowlist, blocklist }
    }

    /// Check a resolved action token against both lists
    pub fn check(&self, action: &str) -> Result<(), AgentError> {
        if self.blocklist.iter().any(|entry| entry == action) {
            return Err(AgentError::PolicyViolation(action.to_string()));
        }
        if !self.allowlist.is_empty() && !self.allowlist.iter().any(|entry| entry == action) {
            return Err(AgentError::PolicyViolation(action.to_string()));
        }
        Ok(())
    }

    /// Gate a whole request. Shell commands run under `sh -c`, so every
    /// word of the command line is held against the blocklist; a blocked
    /// program cannot hide behind `&&`, `;` or command substitution.
    /// Returns the resolved action token for the accepted request.
    pub fn check_request(&self, request: &ExecutionRequest) -> Result<String, AgentError> {
        let action = resolve_action(request)?;

        if request.task_type == TaskType::Shell {
            let command = str_param(request, "command")?;
            for token in command_tokens(&command) {
                if self.blocklist.iter().any(|entry| *entry == token) {
                    return Err(AgentError::PolicyViolation(token));
                }
            }
        }

        self.check(&action)?;
        Ok(action)
    }
}

/// Every word of a shell command line, stripped of surrounding shell
/// punctuation and reduced to its basename: `true && /bin/rm x` yields
/// `["true", "rm", "x"]`, `echo $(rm x)` yields `["echo", "rm", "x"]`.
fn command_tokens(command: &str) -> Vec<String> {
    command
        .split_whitespace()
        .map(|word| basename(word.trim_matches(|c: char| "\"'`$();|&<>".contains(c))))
        .filter(|token| !token.is_empty())
        .collect()
}

/// Resolve the request to the action token the policy lists speak about:
/// the program name for shell/script/python, the unit name for service,
/// the literal path for file tasks.
pub fn resolve_action(request: &ExecutionRequest) -> Result<String, AgentError> {
    let action = match request.task_type {
        TaskType::Shell => {
            let command = str_param(request, "command")?;
            let program = command
                .split_whitespace()
                .next()
                .ok_or_else(|| AgentError::Execution("empty command".into()))?;
            basename(program)
        }
        TaskType::Script => basename(&str_param(request, "path")?),
        TaskType::Python => PYTHON_INTERPRETER.to_string(),
        TaskType::FileRead | TaskType::FileWrite => str_param(request, "path")?,
        TaskType::Service => str_param(request, "unit")?,
        TaskType::Gpio => "gpio".to_string(),
    };
    Ok(action)
}

fn str_param(request: &ExecutionRequest, key: &str) -> Result<String, AgentError> {
    request
        .parameters
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| AgentError::Execution(format!("missing parameter '{key}'")))
}

/// "/bin/rm" and "rm" refer to the same program as far as policy goes
fn basename(program: &str) -> String {
    Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(program)
        .to_string()
}
