//! Outpost Shared Protocol Types
//!
//! This crate provides the wire envelope, message payloads and codec for
//! communication between edge agents and the operator service.

pub mod codec;
pub mod error;

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub use error::AgentError;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Message types carried in the envelope `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Register,
    Heartbeat,
    TaskDispatch,
    TaskResult,
    OtaManifestRequest,
    OtaManifest,
    OtaResult,
    Error,
    /// Anything this agent version does not know about. Dropped on receipt.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageType::Register => "register",
            MessageType::Heartbeat => "heartbeat",
            MessageType::TaskDispatch => "task_dispatch",
            MessageType::TaskResult => "task_result",
            MessageType::OtaManifestRequest => "ota_manifest_request",
            MessageType::OtaManifest => "ota_manifest",
            MessageType::OtaResult => "ota_result",
            MessageType::Error => "error",
            MessageType::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Wire message envelope: `{type, id, payload, timestamp}`
///
/// Immutable once constructed. The `id` is a per-agent correlation token
/// (`<agent_id>-<sequence>`); `timestamp` is Unix milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub id: String,
    pub payload: serde_json::Value,
    pub timestamp: u64,
}

impl Envelope {
    /// Create a new envelope with the current timestamp
    pub fn new(msg_type: MessageType, id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            msg_type,
            id: id.into(),
            payload,
            timestamp: now_ms(),
        }
    }
}

/// Sent immediately after a successful handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Register {
    pub agent_id: String,
    pub hostname: String,
    pub capabilities: Vec<String>,
}

/// Periodic keep-alive with a telemetry snapshot attached
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub uptime_ms: u64,
    pub in_flight_tasks: u32,
    pub telemetry: serde_json::Value,
}

/// Operator request to run a task on the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub task_id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Per-task timeout in milliseconds; 0 means use the agent default
    #[serde(default)]
    pub timeout_ms: u64,
}

/// The fixed set of work the executor knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Shell,
    Script,
    Python,
    FileRead,
    FileWrite,
    Service,
    Gpio,
}

/// Terminal status of a dispatched task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Failure,
    Timeout,
    Blocked,
}

/// Result sent back for every dispatched task, exactly once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn success(task_id: impl Into<String>, output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Success,
            output: output.into(),
            error: String::new(),
            duration_ms,
        }
    }

    pub fn failure(task_id: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Failure,
            output: String::new(),
            error: error.into(),
            duration_ms,
        }
    }

    pub fn timeout(task_id: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Timeout,
            output: String::new(),
            error: "task deadline exceeded".into(),
            duration_ms,
        }
    }

    pub fn blocked(task_id: impl Into<String>, action: &str) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Blocked,
            output: String::new(),
            error: format!("action '{action}' denied by policy"),
            duration_ms: 0,
        }
    }
}

/// Agent request for the latest firmware manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestRequest {
    pub agent_id: String,
    pub current_version: String,
}

/// Firmware manifest describing a target image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    /// SHA-256 of the image, lowercase hex
    pub checksum: String,
    pub image_url: String,
    #[serde(default)]
    pub component: String,
}

/// Terminal outcome of an update job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtaReport {
    pub job_id: String,
    pub success: bool,
    pub from_version: String,
    pub to_version: String,
    #[serde(default)]
    pub error: String,
}

/// Generic failure notice, either direction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub code: String,
    pub detail: String,
}
