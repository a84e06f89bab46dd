//! Task executor
//!
//! Consumes dispatch requests, enforces the action policy, and runs
//! accepted work under a bounded-concurrency ceiling. Every request
//! yields exactly one result sent back through the connection manager;
//! a failing or slow task never blocks the others.

mod actions;
mod policy;

pub use actions::ActionContext;
pub use policy::ExecutionPolicy;

use outpost_proto::{AgentError, ExecutionRequest, ExecutionResult, MessageType};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::ExecutorConfig;
use crate::connection::Outbound;
use crate::hardware::PinControl;

/// Executes operator-dispatched tasks with bounded concurrency
pub struct TaskExecutor {
    semaphore: Arc<Semaphore>,
    policy: Arc<ExecutionPolicy>,
    outbound: Outbound,
    ctx: Arc<ActionContext>,
    default_timeout: Duration,
    in_flight: Arc<AtomicU32>,
}

impl TaskExecutor {
    pub fn new(
        config: &ExecutorConfig,
        outbound: Outbound,
        pins: Arc<dyn PinControl>,
        in_flight: Arc<AtomicU32>,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            policy: Arc::new(ExecutionPolicy::new(
                config.allowlist.clone(),
                config.blocklist.clone(),
            )),
            outbound,
            ctx: Arc::new(ActionContext {
                pins,
                max_file_bytes: config.max_file_bytes,
            }),
            default_timeout: Duration::from_millis(config.default_timeout_ms),
            in_flight,
        }
    }

    /// Number of tasks currently executing (not counting those waiting
    /// for a slot)
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Accept a request. Returns immediately; the task runs on its own
    /// spawned task and its result is sent out when it finishes.
    pub fn dispatch(&self, request: ExecutionRequest) {
        info!("Dispatching task {} ({:?})", request.task_id, request.task_type);

        let semaphore = self.semaphore.clone();
        let policy = self.policy.clone();
        let ctx = self.ctx.clone();
        let outbound = self.outbound.clone();
        let default_timeout = self.default_timeout;
        let in_flight = self.in_flight.clone();

        tokio::spawn(async move {
            let task_id = request.task_id.clone();
            let result = execute(request, policy, semaphore, ctx, default_timeout, in_flight).await;

            // The one terminal notification for this task
            if let Err(e) = outbound.send_json(MessageType::TaskResult, &result).await {
                error!("Failed to send result for task {}: {}", task_id, e);
            }
        });
    }
}

async fn execute(
    request: ExecutionRequest,
    policy: Arc<ExecutionPolicy>,
    semaphore: Arc<Semaphore>,
    ctx: Arc<ActionContext>,
    default_timeout: Duration,
    in_flight: Arc<AtomicU32>,
) -> ExecutionResult {
    // Policy gate comes before everything else, including admission:
    // a denied task consumes no slot and has no side effects.
    match policy.check_request(&request) {
        Ok(_) => {}
        Err(AgentError::PolicyViolation(token)) => {
            warn!("Task {} blocked: action '{}'", request.task_id, token);
            return ExecutionResult::blocked(&request.task_id, &token);
        }
        Err(e) => return ExecutionResult::failure(&request.task_id, e.to_string(), 0),
    }

    // Admission control: wait here when all N slots are taken
    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return ExecutionResult::failure(&request.task_id, "executor shut down", 0),
    };

    let timeout = if request.timeout_ms == 0 {
        default_timeout
    } else {
        Duration::from_millis(request.timeout_ms)
    };

    in_flight.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, actions::run(&request, &ctx)).await;
    let duration_ms = started.elapsed().as_millis() as u64;
    in_flight.fetch_sub(1, Ordering::Relaxed);

    match outcome {
        Ok(Ok(output)) => ExecutionResult::success(&request.task_id, output, duration_ms),
        Ok(Err(e)) => ExecutionResult::failure(&request.task_id, e.to_string(), duration_ms),
        // The action future is dropped on timeout; spawned children are
        // killed via kill_on_drop
        Err(_) => ExecutionResult::timeout(&request.task_id, duration_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedPins;
    use outpost_proto::{Envelope, TaskStatus, TaskType};
    use tokio::sync::mpsc;

    fn test_executor(config: ExecutorConfig) -> (TaskExecutor, mpsc::Receiver<Envelope>, Arc<AtomicU32>) {
        let (tx, rx) = mpsc::channel(32);
        let in_flight = Arc::new(AtomicU32::new(0));
        let executor = TaskExecutor::new(
            &config,
            Outbound::new("test", tx),
            Arc::new(SimulatedPins::default()),
            in_flight.clone(),
        );
        (executor, rx, in_flight)
    }

    fn shell_request(task_id: &str, command: &str, timeout_ms: u64) -> ExecutionRequest {
        ExecutionRequest {
            task_id: task_id.into(),
            task_type: TaskType::Shell,
            parameters: serde_json::json!({ "command": command }),
            timeout_ms,
        }
    }

    async fn next_result(rx: &mut mpsc::Receiver<Envelope>) -> ExecutionResult {
        let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no result arrived")
            .expect("channel closed");
        assert_eq!(envelope.msg_type, MessageType::TaskResult);
        serde_json::from_value(envelope.payload).expect("malformed result payload")
    }

    #[tokio::test]
    async fn test_blocklisted_command_is_blocked() {
        let config = ExecutorConfig {
            blocklist: vec!["rm".into()],
            ..Default::default()
        };
        let (executor, mut rx, _) = test_executor(config);

        executor.dispatch(shell_request("t1", "/bin/rm -rf /tmp/scratch", 0));

        let result = next_result(&mut rx).await;
        assert_eq!(result.status, TaskStatus::Blocked);
        assert!(result.error.contains("rm"));
        assert_eq!(result.duration_ms, 0);
    }

    #[tokio::test]
    async fn test_blocked_program_in_compound_command_never_runs() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("victim");
        tokio::fs::write(&victim, b"keep me").await.unwrap();

        let config = ExecutorConfig {
            blocklist: vec!["rm".into()],
            ..Default::default()
        };
        let (executor, mut rx, _) = test_executor(config);

        let command = format!("true && rm {}", victim.display());
        executor.dispatch(shell_request("t1", &command, 0));

        let result = next_result(&mut rx).await;
        assert_eq!(result.status, TaskStatus::Blocked);
        assert!(
            tokio::fs::try_exists(&victim).await.unwrap(),
            "blocked command ran anyway"
        );
    }

    #[tokio::test]
    async fn test_nonempty_allowlist_denies_unlisted() {
        let config = ExecutorConfig {
            allowlist: vec!["echo".into()],
            blocklist: Vec::new(),
            ..Default::default()
        };
        let (executor, mut rx, _) = test_executor(config);

        executor.dispatch(shell_request("t1", "uptime", 0));
        let result = next_result(&mut rx).await;
        assert_eq!(result.status, TaskStatus::Blocked);

        executor.dispatch(shell_request("t2", "echo hello", 0));
        let result = next_result(&mut rx).await;
        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.output.trim(), "hello");
    }

    #[tokio::test]
    async fn test_shell_success_carries_output_and_duration() {
        let (executor, mut rx, _) = test_executor(ExecutorConfig {
            blocklist: Vec::new(),
            ..Default::default()
        });

        executor.dispatch(shell_request("t1", "echo 42", 0));

        let result = next_result(&mut rx).await;
        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.output.trim(), "42");
        assert!(result.error.is_empty());
    }

    #[tokio::test]
    async fn test_failing_command_reports_failure_detail() {
        let (executor, mut rx, _) = test_executor(ExecutorConfig {
            blocklist: Vec::new(),
            ..Default::default()
        });

        executor.dispatch(shell_request("t1", "ls /definitely/not/a/path", 0));

        let result = next_result(&mut rx).await;
        assert_eq!(result.status, TaskStatus::Failure);
        assert!(!result.error.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports() {
        let (executor, mut rx, _) = test_executor(ExecutorConfig {
            blocklist: Vec::new(),
            ..Default::default()
        });

        executor.dispatch(shell_request("t1", "sleep 5", 100));

        let result = next_result(&mut rx).await;
        assert_eq!(result.status, TaskStatus::Timeout);
        assert!(result.duration_ms >= 100);
        assert!(result.duration_ms < 5_000);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrency_ceiling_holds() {
        let (executor, mut rx, in_flight) = test_executor(ExecutorConfig {
            max_concurrent: 2,
            blocklist: Vec::new(),
            ..Default::default()
        });

        for n in 0..4 {
            executor.dispatch(shell_request(&format!("t{n}"), "sleep 0.3", 5_000));
        }

        let sampler = tokio::spawn(async move {
            let mut peak = 0;
            for _ in 0..50 {
                peak = peak.max(in_flight.load(Ordering::Relaxed));
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            peak
        });

        for _ in 0..4 {
            let result = next_result(&mut rx).await;
            assert_eq!(result.status, TaskStatus::Success);
        }

        let peak = sampler.await.unwrap();
        assert!(peak <= 2, "observed {peak} concurrent tasks with ceiling 2");
        assert!(peak >= 1);
    }

    #[tokio::test]
    async fn test_file_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        let (executor, mut rx, _) = test_executor(ExecutorConfig {
            blocklist: Vec::new(),
            ..Default::default()
        });

        executor.dispatch(ExecutionRequest {
            task_id: "w1".into(),
            task_type: TaskType::FileWrite,
            parameters: serde_json::json!({ "path": path, "contents": "state=ok\n" }),
            timeout_ms: 0,
        });
        assert_eq!(next_result(&mut rx).await.status, TaskStatus::Success);

        executor.dispatch(ExecutionRequest {
            task_id: "r1".into(),
            task_type: TaskType::FileRead,
            parameters: serde_json::json!({ "path": path }),
            timeout_ms: 0,
        });
        let result = next_result(&mut rx).await;
        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.output, "state=ok\n");
    }

    #[tokio::test]
    async fn test_gpio_task_uses_pin_backend() {
        let (executor, mut rx, _) = test_executor(ExecutorConfig {
            blocklist: Vec::new(),
            ..Default::default()
        });

        executor.dispatch(ExecutionRequest {
            task_id: "g1".into(),
            task_type: TaskType::Gpio,
            parameters: serde_json::json!({ "pin": 17, "action": "high" }),
            timeout_ms: 0,
        });

        let result = next_result(&mut rx).await;
        assert_eq!(result.status, TaskStatus::Success);
        assert!(result.output.contains("true"));
    }

    #[tokio::test]
    async fn test_malformed_parameters_fail_cleanly() {
        let (executor, mut rx, _) = test_executor(ExecutorConfig {
            blocklist: Vec::new(),
            ..Default::default()
        });

        executor.dispatch(ExecutionRequest {
            task_id: "bad".into(),
            task_type: TaskType::Shell,
            parameters: serde_json::json!({}),
            timeout_ms: 0,
        });

        let result = next_result(&mut rx).await;
        assert_eq!(result.status, TaskStatus::Failure);
    }
}
