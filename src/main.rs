mod config;
mod connection;
mod executor;
mod hardware;
mod scheduler;
mod telemetry;
mod update;

use config::AgentConfig;
use connection::{ConnectionEvent, ConnectionManager};
use executor::TaskExecutor;
use futures::FutureExt;
use hardware::PinControl;
use outpost_proto::{ErrorNotice, ExecutionRequest, Manifest, MessageType};
use scheduler::Scheduler;
use std::path::Path;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Duration;
use telemetry::SystemMetrics;
use update::UpdateManager;

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => match AgentConfig::load(Path::new(&path)) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load config from {}: {:#}", path, e);
                std::process::exit(1);
            }
        },
        None => AgentConfig::default(),
    };

    info!("Agent starting: {}", config.agent.agent_id);
    info!("  operator: {}", config.connection.operator_addr);
    info!("  firmware: {}", config.agent.firmware_version);

    let metrics = Arc::new(SystemMetrics);
    let in_flight = Arc::new(AtomicU32::new(0));

    let mut conn = ConnectionManager::new(
        config.agent.clone(),
        config.connection.clone(),
        metrics,
        in_flight.clone(),
    );

    let scheduler = Scheduler::new();
    scheduler.start();

    let pins = hardware::detect();
    if pins.is_simulated() {
        warn!("No GPIO hardware found; pin operations are simulated");
    }

    let executor = Arc::new(TaskExecutor::new(
        &config.executor,
        conn.outbound(),
        pins,
        in_flight,
    ));

    let update = UpdateManager::new(
        &config.agent,
        config.ota.clone(),
        conn.outbound(),
        scheduler.clone(),
    );

    // Inbound task requests go straight to the executor; a request we
    // cannot even parse gets an error notice instead of silence.
    let exec_clone = executor.clone();
    let outbound = conn.outbound();
    conn.on(MessageType::TaskDispatch, move |envelope| {
        let executor = exec_clone.clone();
        let outbound = outbound.clone();
        async move {
            match serde_json::from_value::<ExecutionRequest>(envelope.payload) {
                Ok(request) => executor.dispatch(request),
                Err(e) => {
                    warn!("Unparseable task dispatch {}: {}", envelope.id, e);
                    let notice = ErrorNotice {
                        code: "bad_request".into(),
                        detail: format!("task dispatch {}: {}", envelope.id, e),
                    };
                    if let Err(e) = outbound.send_json(MessageType::Error, &notice).await {
                        error!("Failed to send error notice: {}", e);
                    }
                }
            }
        }
        .boxed()
    })
    .await;

    let update_clone = update.clone();
    conn.on(MessageType::OtaManifest, move |envelope| {
        let update = update_clone.clone();
        async move {
            match serde_json::from_value::<Manifest>(envelope.payload) {
                Ok(manifest) => {
                    if let Err(e) = update.apply_manifest(manifest) {
                        warn!("Manifest ignored: {}", e);
                    }
                }
                Err(e) => warn!("Unparseable manifest {}: {}", envelope.id, e),
            }
        }
        .boxed()
    })
    .await;

    conn.on(MessageType::Error, move |envelope| {
        async move {
            match serde_json::from_value::<ErrorNotice>(envelope.payload) {
                Ok(notice) => warn!("Operator error [{}]: {}", notice.code, notice.detail),
                Err(_) => warn!("Operator error with opaque payload ({})", envelope.id),
            }
        }
        .boxed()
    })
    .await;

    // Periodic update polling, when enabled
    if config.ota.check_interval_ms > 0 {
        let interval = Duration::from_millis(config.ota.check_interval_ms);
        let update_clone = update.clone();
        scheduler.schedule_recurring(interval, interval, move || {
            let update = update_clone.clone();
            async move {
                match update.check_for_update() {
                    Ok(job_id) => info!("Scheduled update check started ({})", job_id),
                    Err(e) => debug!("Scheduled update check skipped: {}", e),
                }
            }
        });
        info!("Update polling every {:?}", interval);
    }

    // Main event loop
    loop {
        tokio::select! {
            event = conn.recv() => match event {
                Some(ConnectionEvent::Connected) => {
                    info!("Connected to operator");
                }
                Some(ConnectionEvent::Disconnected { reason }) => {
                    warn!("Disconnected: {}", reason);
                }
                Some(ConnectionEvent::ConnectionFailed { reason }) => {
                    error!("Connection failed permanently: {}", reason);
                    break;
                }
                None => {
                    error!("Connection manager closed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                conn.shutdown();
                break;
            }
        }
    }

    info!("Agent stopped");
}
