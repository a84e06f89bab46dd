//! Pin-control abstraction
//!
//! Capability interface with two variants: sysfs-backed GPIO for real
//! hardware and an in-memory simulation everywhere else. The variant is
//! chosen once at startup by probing the environment, never per call.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

const GPIO_ROOT: &str = "/sys/class/gpio";

/// Actions the executor's gpio task type can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinAction {
    High,
    Low,
    Toggle,
    Read,
}

/// Pin state after the action was applied
#[derive(Debug, Clone, Serialize)]
pub struct PinReport {
    pub pin: u32,
    pub state: bool,
}

/// Collaborator contract: `apply(pin, action) -> result`
#[async_trait]
pub trait PinControl: Send + Sync {
    async fn apply(&self, pin: u32, action: PinAction) -> Result<PinReport>;
    fn is_simulated(&self) -> bool;
}

/// Probe the environment and pick a backend
pub fn detect() -> Arc<dyn PinControl> {
    if Path::new(GPIO_ROOT).is_dir() {
        info!("GPIO backend: sysfs ({GPIO_ROOT})");
        Arc::new(SysfsPins::new(GPIO_ROOT))
    } else {
        info!("GPIO backend: simulated (no {GPIO_ROOT})");
        Arc::new(SimulatedPins::default())
    }
}

/// In-memory pin state, for development hosts and tests
#[derive(Default)]
pub struct SimulatedPins {
    pins: Mutex<HashMap<u32, bool>>,
}

#[async_trait]
impl PinControl for SimulatedPins {
    async fn apply(&self, pin: u32, action: PinAction) -> Result<PinReport> {
        let mut pins = self.pins.lock().await;
        let current = pins.entry(pin).or_insert(false);
        let state = match action {
            PinAction::High => true,
            PinAction::Low => false,
            PinAction::Toggle => !*current,
            PinAction::Read => *current,
        };
        *current = state;
        Ok(PinReport { pin, state })
    }

    fn is_simulated(&self) -> bool {
        true
    }
}

/// Sysfs GPIO backend (Raspberry Pi and similar boards)
pub struct SysfsPins {
    root: PathBuf,
}

impl SysfsPins {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn pin_dir(&self, pin: u32) -> PathBuf {
        self.root.join(format!("gpio{pin}"))
    }

    async fn ensure_exported(&self, pin: u32) -> Result<()> {
        if tokio::fs::try_exists(self.pin_dir(pin)).await.unwrap_or(false) {
            return Ok(());
        }
        tokio::fs::write(self.root.join("export"), pin.to_string())
            .await
            .with_context(|| format!("exporting gpio {pin}"))?;
        Ok(())
    }

    async fn write_value(&self, pin: u32, high: bool) -> Result<()> {
        let dir = self.pin_dir(pin);
        tokio::fs::write(dir.join("direction"), "out").await?;
        tokio::fs::write(dir.join("value"), if high { "1" } else { "0" }).await?;
        Ok(())
    }

    async fn read_value(&self, pin: u32) -> Result<bool> {
        let raw = tokio::fs::read_to_string(self.pin_dir(pin).join("value"))
            .await
            .with_context(|| format!("reading gpio {pin}"))?;
        Ok(raw.trim() == "1")
    }
}

#[async_trait]
impl PinControl for SysfsPins {
    async fn apply(&self, pin: u32, action: PinAction) -> Result<PinReport> {
        self.ensure_exported(pin).await?;
        let state = match action {
            PinAction::High => {
                self.write_value(pin, true).await?;
                true
            }
            PinAction::Low => {
                self.write_value(pin, false).await?;
                false
            }
            PinAction::Toggle => {
                let next = !self.read_value(pin).await?;
                self.write_value(pin, next).await?;
                next
            }
            PinAction::Read => self.read_value(pin).await?,
        };
        Ok(PinReport { pin, state })
    }

    fn is_simulated(&self) -> bool {
        false
    }
}
