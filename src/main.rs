mod domain;
mod infrastructure;

use crate::domain::models::DockingEvent;
use crate::domain::settings::{Settings, SettingsService};
use crate::infrastructure::bluetooth::adapter::{DiscoveryBackend, StreamConnector};
use crate::infrastructure::bluetooth::connection::{ConnectionConfig, ConnectionManager};
use crate::infrastructure::bluetooth::{BluetoothError, DockingConfig, DockingStateMachine};
use crate::infrastructure::capture::DirectoryCaptureStore;
use crate::infrastructure::logging::init_logger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();
    let _log_guard = init_logger(&settings.log_settings)?;

    info!("Starting dock-sync");
    info!("Settings loaded from {}", settings_service.path().display());
    if let Some(e) = settings_service.load_error() {
        warn!("Settings file is unreadable ({}), using defaults", e);
    }
    settings.validate()?;

    let stop = CancellationToken::new();
    let signal_stop = stop.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Stop requested"),
            Err(e) => error!("Could not listen for Ctrl+C: {}", e),
        }
        signal_stop.cancel();
    });

    let (discovery, connector) = build_backend(&settings).await?;
    let connections = Arc::new(ConnectionManager::new(
        connector,
        ConnectionConfig {
            read_timeout: settings.timing.read_timeout(),
            ..Default::default()
        },
    ));
    let captures = Arc::new(DirectoryCaptureStore::new(&settings.capture_dir));
    info!("Captures go to {}", captures.dir().display());

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            notify(event);
        }
    });

    let mut machine = DockingStateMachine::new(
        DockingConfig::from_settings(&settings),
        discovery,
        connections,
        captures,
        event_tx,
    );

    let idle_poll = Duration::from_secs(settings.idle_poll_secs.max(1));
    loop {
        match machine.run(&stop).await {
            Ok(()) => {}
            Err(BluetoothError::PermissionDenied) => {
                error!("Bluetooth discovery is not permitted; check adapter permissions");
            }
            Err(e) => warn!("Docking cycle failed: {}", e),
        }

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(idle_poll) => {}
        }
    }

    info!("dock-sync stopped");
    Ok(())
}

fn notify(event: DockingEvent) {
    match event {
        DockingEvent::Docked => info!("Sensor is docked"),
        DockingEvent::Undocked => info!("Sensor is not docked"),
        DockingEvent::Ambiguous => info!("Sensor presence ambiguous, asking the device"),
        DockingEvent::FileTransferStarted => info!("Retrieving recorded files"),
    }
}

#[cfg(feature = "bluez")]
async fn build_backend(
    settings: &Settings,
) -> anyhow::Result<(Arc<dyn DiscoveryBackend>, Arc<dyn StreamConnector>)> {
    use crate::infrastructure::bluetooth::bluez::BluezBackend;

    let backend = Arc::new(BluezBackend::new(settings.rfcomm_channel).await?);
    Ok((backend.clone(), backend))
}

#[cfg(not(feature = "bluez"))]
async fn build_backend(
    _settings: &Settings,
) -> anyhow::Result<(Arc<dyn DiscoveryBackend>, Arc<dyn StreamConnector>)> {
    anyhow::bail!("no Bluetooth backend compiled in; rebuild with `--features bluez`")
}
