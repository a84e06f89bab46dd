//! OTA update manager
//!
//! Drives the multi-stage firmware update workflow. Exactly one job runs
//! at a time; a second request while one is active is rejected, never
//! queued. Whatever happens, the operator receives exactly one terminal
//! report per job.

mod flash;
mod image;
mod window;

pub use flash::{CommandFlasher, ImageFlasher, SimulatedFlasher};
pub use image::{verify_image, HttpFetcher, ImageFetcher};
pub use window::{AlwaysOpen, MaintenanceWindow, UtcHourWindow};

use outpost_proto::{AgentError, Manifest, ManifestRequest, MessageType, OtaReport};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::{IdentityConfig, OtaConfig};
use crate::connection::Outbound;
use crate::scheduler::Scheduler;

/// Update job stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStage {
    Idle,
    FetchingManifest,
    Downloading,
    Verifying,
    Flashing,
    RebootPending,
    Reporting,
    Failed,
}

struct ActiveJob {
    job_id: String,
    stage: UpdateStage,
}

struct Inner {
    agent_id: String,
    current_version: String,
    config: OtaConfig,
    outbound: Outbound,
    scheduler: Scheduler,
    window: Arc<dyn MaintenanceWindow>,
    fetcher: Arc<dyn ImageFetcher>,
    flasher: Arc<dyn ImageFlasher>,
    job: Mutex<Option<ActiveJob>>,
    manifest_slot: Mutex<Option<oneshot::Sender<Manifest>>>,
    job_seq: AtomicU64,
}

impl Inner {
    fn set_stage(&self, stage: UpdateStage) {
        let mut job = self.job.lock().expect("update lock poisoned");
        if let Some(active) = job.as_mut() {
            info!("OTA job {}: {:?} -> {:?}", active.job_id, active.stage, stage);
            active.stage = stage;
        }
    }
}

/// The update manager handle
#[derive(Clone)]
pub struct UpdateManager {
    inner: Arc<Inner>,
}

impl UpdateManager {
    pub fn new(
        identity: &IdentityConfig,
        config: OtaConfig,
        outbound: Outbound,
        scheduler: Scheduler,
    ) -> Self {
        let window = window::from_config(config.window_start_hour, config.window_end_hour);
        let flasher = flash::from_config(&config.flash_command);
        Self::with_backends(identity, config, outbound, scheduler, window, Arc::new(HttpFetcher::new()), flasher)
    }

    /// Constructor with injectable seams, used by tests and specialized builds
    pub fn with_backends(
        identity: &IdentityConfig,
        config: OtaConfig,
        outbound: Outbound,
        scheduler: Scheduler,
        window: Arc<dyn MaintenanceWindow>,
        fetcher: Arc<dyn ImageFetcher>,
        flasher: Arc<dyn ImageFlasher>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                agent_id: identity.agent_id.clone(),
                current_version: identity.firmware_version.clone(),
                config,
                outbound,
                scheduler,
                window,
                fetcher,
                flasher,
                job: Mutex::new(None),
                manifest_slot: Mutex::new(None),
                job_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Current stage; `Idle` when no job is active
    pub fn stage(&self) -> UpdateStage {
        self.inner
            .job
            .lock()
            .expect("update lock poisoned")
            .as_ref()
            .map(|job| job.stage)
            .unwrap_or(UpdateStage::Idle)
    }

    /// Start a job that asks the operator for the latest manifest.
    /// Rejected while another job is active.
    pub fn check_for_update(&self) -> Result<String, AgentError> {
        self.begin(None)
    }

    /// Handle an inbound `ota_manifest`: answer the fetch stage of the
    /// running job, or start a new job from an operator-pushed manifest.
    pub fn apply_manifest(&self, manifest: Manifest) -> Result<(), AgentError> {
        let waiting = self
            .inner
            .manifest_slot
            .lock()
            .expect("update lock poisoned")
            .take();

        match waiting {
            Some(sender) => {
                let _ = sender.send(manifest);
                Ok(())
            }
            None => self.begin(Some(manifest)).map(|_| ()),
        }
    }

    fn begin(&self, seed: Option<Manifest>) -> Result<String, AgentError> {
        let mut job = self.inner.job.lock().expect("update lock poisoned");
        if job.is_some() {
            return Err(AgentError::UpdateInProgress);
        }

        let job_id = format!("ota-{}", self.inner.job_seq.fetch_add(1, Ordering::SeqCst) + 1);
        *job = Some(ActiveJob {
            job_id: job_id.clone(),
            stage: UpdateStage::Idle,
        });
        drop(job);

        let inner = self.inner.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            run_job(inner, id, seed).await;
        });

        Ok(job_id)
    }
}

enum Outcome {
    Updated { to: String },
    UpToDate,
}

async fn run_job(inner: Arc<Inner>, job_id: String, seed: Option<Manifest>) {
    let outcome = drive(&inner, seed).await;

    let report = match outcome {
        Ok(Outcome::Updated { to }) => OtaReport {
            job_id: job_id.clone(),
            success: true,
            from_version: inner.current_version.clone(),
            to_version: to,
            error: String::new(),
        },
        Ok(Outcome::UpToDate) => OtaReport {
            job_id: job_id.clone(),
            success: true,
            from_version: inner.current_version.clone(),
            to_version: inner.current_version.clone(),
            error: String::new(),
        },
        Err((to_version, e)) => {
            inner.set_stage(UpdateStage::Failed);
            error!("OTA job {} failed: {}", job_id, e);
            OtaReport {
                job_id: job_id.clone(),
                success: false,
                from_version: inner.current_version.clone(),
                to_version,
                error: e.to_string(),
            }
        }
    };

    // The terminal report always goes out, success or failure
    inner.set_stage(UpdateStage::Reporting);
    if let Err(e) = inner.outbound.send_json(MessageType::OtaResult, &report).await {
        error!("OTA job {}: failed to send terminal report: {}", job_id, e);
    }

    *inner.job.lock().expect("update lock poisoned") = None;
}

type JobError = (String, AgentError);

async fn drive(inner: &Arc<Inner>, seed: Option<Manifest>) -> Result<Outcome, JobError> {
    let manifest = match seed {
        Some(manifest) => manifest,
        None => fetch_manifest(inner).await.map_err(|e| (String::new(), e))?,
    };

    // Nothing to do unless the manifest is strictly newer
    if !version_gt(&manifest.version, &inner.current_version) {
        info!(
            "Already up-to-date ({} <= {})",
            manifest.version, inner.current_version
        );
        return Ok(Outcome::UpToDate);
    }
    let target = manifest.version.clone();

    let path = download(inner, &manifest).await.map_err(|e| (target.clone(), e))?;

    inner.set_stage(UpdateStage::Verifying);
    if let Err(e) = verify_image(&path, &manifest.checksum).await {
        // Never flash an artifact that failed verification
        let _ = tokio::fs::remove_file(&path).await;
        return Err((target, e));
    }

    inner.set_stage(UpdateStage::Flashing);
    await_maintenance_window(inner).await;
    if let Err(e) = inner.flasher.flash(&path, &manifest.component).await {
        let _ = tokio::fs::remove_file(&path).await;
        return Err((target, e));
    }

    inner.set_stage(UpdateStage::RebootPending);
    if let Err(e) = reboot(inner).await {
        let _ = tokio::fs::remove_file(&path).await;
        return Err((target, e));
    }

    let _ = tokio::fs::remove_file(&path).await;
    Ok(Outcome::Updated { to: target })
}

/// Request the manifest over the connection manager, retrying with
/// exponential backoff up to the configured bound
async fn fetch_manifest(inner: &Arc<Inner>) -> Result<Manifest, AgentError> {
    inner.set_stage(UpdateStage::FetchingManifest);
    let request = ManifestRequest {
        agent_id: inner.agent_id.clone(),
        current_version: inner.current_version.clone(),
    };

    let response_deadline = Duration::from_millis(inner.config.manifest_timeout_ms);
    let base = Duration::from_millis(inner.config.retry_base_ms);
    for attempt in 0..inner.config.manifest_attempts {
        let (tx, rx) = oneshot::channel();
        *inner.manifest_slot.lock().expect("update lock poisoned") = Some(tx);

        if let Err(e) = inner
            .outbound
            .send_json(MessageType::OtaManifestRequest, &request)
            .await
        {
            warn!("Manifest request attempt {} failed to enqueue: {}", attempt + 1, e);
        } else if let Ok(Ok(manifest)) = timeout(response_deadline, rx).await {
            inner.manifest_slot.lock().expect("update lock poisoned").take();
            return Ok(manifest);
        }

        // No backoff after the final attempt; the job fails now
        if attempt + 1 < inner.config.manifest_attempts {
            tokio::time::sleep(base * 2u32.saturating_pow(attempt)).await;
        }
    }

    inner.manifest_slot.lock().expect("update lock poisoned").take();
    Err(AgentError::Connectivity(format!(
        "no manifest after {} attempts",
        inner.config.manifest_attempts
    )))
}

/// Retrieve the image into the staging directory, retrying whole
/// downloads up to the configured bound
async fn download(inner: &Arc<Inner>, manifest: &Manifest) -> Result<PathBuf, AgentError> {
    inner.set_stage(UpdateStage::Downloading);

    let dir = if inner.config.download_dir.as_os_str().is_empty() {
        std::env::temp_dir()
    } else {
        inner.config.download_dir.clone()
    };
    let path = dir.join(format!("outpost-{}.img", manifest.version));

    let base = Duration::from_millis(inner.config.retry_base_ms);
    let mut last_error = None;
    for attempt in 0..inner.config.download_attempts {
        match inner.fetcher.fetch(&manifest.image_url, &path).await {
            Ok(()) => return Ok(path),
            Err(e) => {
                warn!("Download attempt {} failed: {}", attempt + 1, e);
                last_error = Some(e);
                tokio::time::sleep(base * 2u32.saturating_pow(attempt)).await;
            }
        }
    }

    Err(last_error.unwrap_or_else(|| AgentError::Connectivity("download failed".into())))
}

/// Defer until the maintenance window opens, re-checking on the
/// scheduler's timeline rather than a private sleep
async fn await_maintenance_window(inner: &Arc<Inner>) {
    let recheck = Duration::from_millis(inner.config.window_recheck_ms);
    while !inner.window.is_open() {
        info!("Maintenance window closed; re-checking in {:?}", recheck);
        let notify = Arc::new(Notify::new());
        let signal = notify.clone();
        inner.scheduler.schedule_once(recheck, move || {
            let signal = signal.clone();
            async move {
                signal.notify_one();
            }
        });
        notify.notified().await;
    }
}

async fn reboot(inner: &Arc<Inner>) -> Result<(), AgentError> {
    let command = &inner.config.reboot_command;
    if command.is_empty() {
        info!("No reboot command configured; skipping reboot");
        return Ok(());
    }

    let status = tokio::process::Command::new(&command[0])
        .args(&command[1..])
        .status()
        .await
        .map_err(|e| AgentError::Execution(format!("reboot spawn failed: {e}")))?;

    if !status.success() {
        return Err(AgentError::Execution(format!(
            "reboot command exited with {status}"
        )));
    }
    Ok(())
}

/// Strictly-newer comparison on dot-separated numeric versions; a leading
/// `v` is ignored, unparsable versions compare as 0
fn version_gt(a: &str, b: &str) -> bool {
    fn parts(v: &str) -> Vec<u64> {
        v.trim_start_matches('v')
            .split('.')
            .map(|p| p.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .unwrap_or_else(|_| vec![0])
    }
    parts(a) > parts(b)
}
