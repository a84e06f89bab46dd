//! Flashing backends

use async_trait::async_trait;
use outpost_proto::AgentError;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tracing::info;

/// Applies a verified image to the target component
#[async_trait]
pub trait ImageFlasher: Send + Sync {
    async fn flash(&self, image: &Path, component: &str) -> Result<(), AgentError>;
}

/// Runs the configured flash command with the image path appended
pub struct CommandFlasher {
    command: Vec<String>,
}

impl CommandFlasher {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl ImageFlasher for CommandFlasher {
    async fn flash(&self, image: &Path, component: &str) -> Result<(), AgentError> {
        info!("Flashing {} with {:?}", component, self.command);

        let status = Command::new(&self.command[0])
            .args(&self.command[1..])
            .arg(image)
            .status()
            .await
            .map_err(|e| AgentError::Flash(format!("spawn failed: {e}")))?;

        if !status.success() {
            return Err(AgentError::Flash(format!("flash command exited with {status}")));
        }
        Ok(())
    }
}

/// Logs the would-be flash and succeeds; used when no flash command is
/// configured (development hosts)
pub struct SimulatedFlasher;

#[async_trait]
impl ImageFlasher for SimulatedFlasher {
    async fn flash(&self, image: &Path, component: &str) -> Result<(), AgentError> {
        info!("[simulated] flashed {} onto {}", image.display(), component);
        Ok(())
    }
}

/// Pick a flasher from config; empty command means simulation
pub fn from_config(flash_command: &[String]) -> Arc<dyn ImageFlasher> {
    if flash_command.is_empty() {
        Arc::new(SimulatedFlasher)
    } else {
        Arc::new(CommandFlasher::new(flash_command.to_vec()))
    }
}
