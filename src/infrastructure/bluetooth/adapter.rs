//! Bluetooth Classic capability traits
//!
//! The host platform supplies radio control, inquiry and stream sockets
//! through these traits. Everything above this layer is platform-free.

use crate::domain::models::DeviceAddress;
use crate::infrastructure::bluetooth::error::BluetoothError;
use crate::infrastructure::bluetooth::scanner::ScanEvent;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Byte stream to a connected device
pub trait DeviceStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DeviceStream for T {}

#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    async fn is_radio_enabled(&self) -> Result<bool, BluetoothError>;

    async fn set_radio_enabled(&self, enabled: bool) -> Result<(), BluetoothError>;

    /// Run one inquiry, sending `ScanEvent::DeviceFound` for every device
    /// observed until `cancel` fires. Returns `RadioUnavailable` if the radio
    /// goes down and `PermissionDenied` if discovery is not allowed.
    async fn inquire(
        &self,
        events: mpsc::UnboundedSender<ScanEvent>,
        cancel: CancellationToken,
    ) -> Result<(), BluetoothError>;
}

#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Single connection attempt; retry policy lives in `ConnectionManager`
    async fn open(&self, address: &DeviceAddress) -> Result<Box<dyn DeviceStream>, BluetoothError>;
}
