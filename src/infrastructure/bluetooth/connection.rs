//! Connection Module
//!
//! Opens the stream socket to the sensor with bounded retries and wraps it
//! in a scoped `Connection` that owns the only socket slot.

use crate::domain::models::DeviceAddress;
use crate::infrastructure::bluetooth::adapter::{DeviceStream, StreamConnector};
use crate::infrastructure::bluetooth::error::BluetoothError;
use crate::infrastructure::bluetooth::protocol::{FILLER, MAX_FILLER_RUN};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, trace, warn};

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connection attempts before giving up
    pub max_attempts: u32,
    /// Delay between attempts
    pub retry_delay: Duration,
    /// Deadline for every single read
    pub read_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            read_timeout: Duration::from_secs(5),
        }
    }
}

/// Hands out at most one open connection at a time
pub struct ConnectionManager {
    connector: Arc<dyn StreamConnector>,
    config: ConnectionConfig,
    slot: Arc<Semaphore>,
}

impl ConnectionManager {
    /// Manager with a single free socket slot
    pub fn new(connector: Arc<dyn StreamConnector>, config: ConnectionConfig) -> Self {
        Self {
            connector,
            config,
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Connect to `address`, retrying with a fixed delay.
    ///
    /// `PermissionDenied` is returned at once; other failures are retried
    /// and end in `ConnectionFailed`.
    pub async fn connect(&self, address: &DeviceAddress) -> Result<Connection, BluetoothError> {
        let permit = self
            .slot
            .clone()
            .try_acquire_owned()
            .map_err(|_| BluetoothError::Busy(address.clone()))?;

        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            info!(
                "Connecting to {} (attempt {}/{})",
                address, attempt, attempts
            );
            match self.connector.open(address).await {
                Ok(stream) => {
                    info!("Connected to {}", address);
                    return Ok(Connection::new(
                        address.clone(),
                        stream,
                        self.config.read_timeout,
                        permit,
                    ));
                }
                Err(BluetoothError::PermissionDenied) => {
                    warn!("Connection to {} not permitted", address);
                    return Err(BluetoothError::PermissionDenied);
                }
                Err(e) => {
                    warn!("Connection attempt {} to {} failed: {}", attempt, address, e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        Err(BluetoothError::ConnectionFailed {
            address: address.clone(),
            attempts,
        })
    }

    /// Whether the socket slot is taken
    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.slot.available_permits() == 0
    }
}

/// An open socket to the device.
///
/// Dropping it releases the socket; `close` additionally shuts the write
/// side down first. Either way the release happens exactly once.
pub struct Connection {
    address: DeviceAddress,
    stream: BufReader<Box<dyn DeviceStream>>,
    read_timeout: Duration,
    _slot: OwnedSemaphorePermit,
}

impl Connection {
    fn new(
        address: DeviceAddress,
        stream: Box<dyn DeviceStream>,
        read_timeout: Duration,
        slot: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            address,
            stream: BufReader::new(stream),
            read_timeout,
            _slot: slot,
        }
    }

    /// Remote device this socket is open to
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Write and flush `bytes`
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), BluetoothError> {
        trace!("-> {}", hex::encode_upper(bytes));
        self.stream.write_all(bytes).await.map_err(map_io)?;
        self.stream.flush().await.map_err(map_io)?;
        Ok(())
    }

    /// Read one byte, failing with `Timeout` after the read timeout
    pub async fn read_u8(&mut self) -> Result<u8, BluetoothError> {
        let byte = tokio::time::timeout(self.read_timeout, self.stream.read_u8())
            .await
            .map_err(|_| BluetoothError::Timeout)?
            .map_err(map_io)?;
        Ok(byte)
    }

    /// Fill `buf` under a single read timeout
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), BluetoothError> {
        tokio::time::timeout(self.read_timeout, self.stream.read_exact(buf))
            .await
            .map_err(|_| BluetoothError::Timeout)?
            .map_err(map_io)?;
        Ok(())
    }

    /// Little-endian `u16`
    pub async fn read_u16_le(&mut self) -> Result<u16, BluetoothError> {
        let mut bytes = [0u8; 2];
        self.read_exact(&mut bytes).await?;
        Ok(u16::from_le_bytes(bytes))
    }

    /// Little-endian `u32`
    pub async fn read_u32_le(&mut self) -> Result<u32, BluetoothError> {
        let mut bytes = [0u8; 4];
        self.read_exact(&mut bytes).await?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Skip filler and return the first real byte
    pub async fn read_frame_byte(&mut self) -> Result<u8, BluetoothError> {
        for _ in 0..MAX_FILLER_RUN {
            let byte = self.read_u8().await?;
            if byte != FILLER {
                return Ok(byte);
            }
        }
        warn!("Device sent more than {} filler bytes", MAX_FILLER_RUN);
        Err(BluetoothError::Timeout)
    }

    /// Skip filler and require the next byte to be `expected`
    pub async fn expect_frame(&mut self, expected: u8) -> Result<(), BluetoothError> {
        let actual = self.read_frame_byte().await?;
        if actual != expected {
            return Err(BluetoothError::ProtocolViolation { expected, actual });
        }
        Ok(())
    }

    /// Shut the write side down before the slot is released
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("Shutdown of {} failed: {}", self.address, e);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        info!("Released connection to {}", self.address);
    }
}

fn map_io(e: io::Error) -> BluetoothError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => BluetoothError::StreamClosed,
        _ => BluetoothError::Io(e),
    }
}
