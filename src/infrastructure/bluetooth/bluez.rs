//! BlueZ backend (Linux)
//!
//! BR/EDR inquiry through `bluer` and RFCOMM stream sockets to the sensor.

use crate::domain::models::{DeviceAddress, DeviceRecord};
use crate::infrastructure::bluetooth::adapter::{DeviceStream, DiscoveryBackend, StreamConnector};
use crate::infrastructure::bluetooth::error::BluetoothError;
use crate::infrastructure::bluetooth::scanner::ScanEvent;
use async_trait::async_trait;
use bluer::rfcomm::{SocketAddr, Stream};
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, DiscoveryFilter, DiscoveryTransport, ErrorKind,
    Session,
};
use futures_util::{pin_mut, StreamExt};
use std::io;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

pub struct BluezBackend {
    // Keeps the D-Bus connection alive for the adapter handle
    _session: Session,
    adapter: Adapter,
    channel: u8,
}

impl BluezBackend {
    /// Open the default adapter; `channel` is the sensor's RFCOMM channel
    pub async fn new(channel: u8) -> Result<Self, BluetoothError> {
        let session = Session::new().await.map_err(map_bluer)?;
        let adapter = session.default_adapter().await.map_err(map_bluer)?;
        info!(
            "Using Bluetooth adapter {} ({})",
            adapter.name(),
            adapter.address().await.map_err(map_bluer)?
        );
        Ok(Self {
            _session: session,
            adapter,
            channel,
        })
    }

    async fn record(&self, address: Address) -> Option<DeviceRecord> {
        let device = self.adapter.device(address).ok()?;
        // Cached entries without RSSI were not seen by this inquiry
        device.rssi().await.ok().flatten()?;
        let name = device.name().await.ok().flatten().unwrap_or_default();
        Some(DeviceRecord::new(name, DeviceAddress::new(address.to_string())))
    }
}

#[async_trait]
impl DiscoveryBackend for BluezBackend {
    async fn is_radio_enabled(&self) -> Result<bool, BluetoothError> {
        self.adapter.is_powered().await.map_err(map_bluer)
    }

    async fn set_radio_enabled(&self, enabled: bool) -> Result<(), BluetoothError> {
        info!("Setting adapter power to {}", enabled);
        self.adapter.set_powered(enabled).await.map_err(map_bluer)
    }

    async fn inquire(
        &self,
        events: mpsc::UnboundedSender<ScanEvent>,
        cancel: CancellationToken,
    ) -> Result<(), BluetoothError> {
        if !self.is_radio_enabled().await? {
            return Err(BluetoothError::RadioUnavailable);
        }

        self.adapter
            .set_discovery_filter(DiscoveryFilter {
                transport: DiscoveryTransport::BrEdr,
                ..Default::default()
            })
            .await
            .map_err(map_bluer)?;

        let discovery = self.adapter.discover_devices().await.map_err(map_bluer)?;
        pin_mut!(discovery);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = discovery.next() => match event {
                    Some(AdapterEvent::DeviceAdded(address)) => {
                        if let Some(record) = self.record(address).await {
                            trace!("Inquiry saw {} ({})", record.name, record.address);
                            let _ = events.send(ScanEvent::DeviceFound(record));
                        }
                    }
                    Some(AdapterEvent::PropertyChanged(AdapterProperty::Powered(false))) => {
                        return Err(BluetoothError::RadioUnavailable);
                    }
                    Some(_) => {}
                    None => {
                        debug!("Discovery stream ended");
                        return Ok(());
                    }
                },
            }
        }
    }
}

#[async_trait]
impl StreamConnector for BluezBackend {
    async fn open(&self, address: &DeviceAddress) -> Result<Box<dyn DeviceStream>, BluetoothError> {
        let target: Address = address.as_str().parse().map_err(|_| {
            BluetoothError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid Bluetooth address {}", address),
            ))
        })?;

        let stream = Stream::connect(SocketAddr::new(target, self.channel))
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => BluetoothError::PermissionDenied,
                _ => BluetoothError::Io(e),
            })?;
        Ok(Box::new(stream))
    }
}

fn map_bluer(e: bluer::Error) -> BluetoothError {
    match e.kind {
        ErrorKind::NotAuthorized | ErrorKind::NotPermitted => BluetoothError::PermissionDenied,
        ErrorKind::NotReady => BluetoothError::RadioUnavailable,
        _ => BluetoothError::Io(io::Error::other(e.to_string())),
    }
}
