//! presenter device core daemon
//!
//! Finds supported presenter devices, intercepts their input and re-injects
//! it through a virtual device, running mapped actions for configured key
//! sequences.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use presenter_config::Config;
use presenter_daemon::action_executor::ActionExecutor;
use presenter_daemon::emitter::create_shared_emitter;
use presenter_daemon::hotplug::HotplugMonitor;
use presenter_daemon::{scan, CoreEvent, DeviceManager, ManagerEvent};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "presenterd")]
#[command(about = "Device core daemon for HID presenters")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/presenter/config.kdl")]
    config: String,

    /// Never create the virtual device; input is observed only
    #[arg(long)]
    no_virtual_device: bool,
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    presenter_config::parse_config(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

fn log_core_event(event: &CoreEvent) {
    match event {
        CoreEvent::DeviceConnected { identity, name } => {
            tracing::info!(device = %identity, name = %name, "Presenter connected");
        }
        CoreEvent::DeviceDisconnected { identity, name } => {
            tracing::info!(device = %identity, name = %name, "Presenter disconnected");
        }
        CoreEvent::AnyDeviceConnected(connected) => {
            tracing::debug!(connected, "Any device connected changed");
        }
        CoreEvent::SpotActive { identity, active } => {
            tracing::debug!(device = %identity, active, "Spot activity");
        }
        CoreEvent::Action { identity, action } => {
            tracing::info!(device = %identity, ?action, "Action requested");
        }
        CoreEvent::DeviceFeatures {
            identity,
            protocol,
            capabilities,
        } => {
            tracing::info!(device = %identity, protocol = %protocol, ?capabilities, "Device features");
        }
        CoreEvent::Battery { identity, info } => {
            tracing::info!(
                device = %identity,
                level = info.level,
                status = ?info.status,
                "Battery"
            );
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Expand tilde in config path
    let config_path: PathBuf = shellexpand::tilde(&args.config).into_owned().into();
    let config = load_config(&config_path);

    let fallback_level = config
        .as_ref()
        .map(|c| c.global.log_level.as_filter())
        .unwrap_or("info");
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback_level)),
        )
        .init();

    let config = config?;
    tracing::info!(
        path = %config_path.display(),
        mappings = config.mappings.len(),
        supported_devices = config.supported_devices.len(),
        "Configuration loaded"
    );

    let executor = if config.global.virtual_device && !args.no_virtual_device {
        match create_shared_emitter() {
            Ok(emitter) => Some(ActionExecutor::new(emitter)),
            Err(e) => {
                tracing::warn!(error = %e, "Virtual device unavailable, input is observed only");
                None
            }
        }
    } else {
        tracing::info!("Virtual device disabled");
        None
    };

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut manager = DeviceManager::new(&config, executor, events_tx);

    let scanned = scan(manager.supported());
    for error in &scanned.errors {
        tracing::warn!("Scan: {}", error);
    }
    manager.attach_scan(&scanned);

    match HotplugMonitor::new() {
        Ok(mut monitor) => {
            let sender = manager.sender();
            tokio::spawn(async move {
                loop {
                    match monitor.next_created().await {
                        Ok(paths) => {
                            for path in paths {
                                if sender.send(ManagerEvent::NodeAdded(path)).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Hotplug monitoring stopped");
                            return;
                        }
                    }
                }
            });
        }
        Err(e) => tracing::warn!(error = %e, "Hotplug monitoring unavailable"),
    }

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let sender = manager.sender();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = hangup.recv() => match load_config(&config_path) {
                    Ok(config) => {
                        tracing::info!(path = %config_path.display(), "Reloading configuration");
                        let _ = sender.send(ManagerEvent::Reload(Box::new(config)));
                    }
                    Err(e) => tracing::warn!("Keeping current configuration: {:#}", e),
                },
                _ = terminate.recv() => break,
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        tracing::info!("Shutting down...");
        let _ = sender.send(ManagerEvent::Shutdown);
    });

    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            log_core_event(&event);
        }
    });

    tracing::info!("presenter daemon running");
    manager.run().await;

    Ok(())
}
