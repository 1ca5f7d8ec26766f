//! Dock Query Module
//!
//! Single request/response exchange asking the sensor whether it sits in
//! its dock. Every failure resolves to Undocked so that an uncertain answer
//! never starts a file transfer.

use crate::domain::models::{DeviceAddress, DockQueryResult, DockStatus};
use crate::infrastructure::bluetooth::connection::{Connection, ConnectionManager};
use crate::infrastructure::bluetooth::error::BluetoothError;
use crate::infrastructure::bluetooth::protocol::{
    dock_status, frame, HostCommand, DOCK_QUERY_SETTLE_DELAY,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct DockQueryProtocol {
    connections: Arc<ConnectionManager>,
}

impl DockQueryProtocol {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    /// Ask the device at `address` for its dock status
    pub async fn query(&self, address: &DeviceAddress) -> DockQueryResult {
        let mut connection = match self.connections.connect(address).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Dock query could not connect: {}", e);
                return DockQueryResult::undocked();
            }
        };

        let outcome = exchange(&mut connection).await;
        connection.close().await;

        match outcome {
            Ok(result) => {
                info!(
                    "Dock query answered {:?} (status byte {:?})",
                    result.status, result.raw_status
                );
                result
            }
            Err(e) => {
                warn!("Dock query failed, assuming undocked: {}", e);
                DockQueryResult::undocked()
            }
        }
    }
}

/// `D5` → (settle) → `FF* D6 <status>`
pub async fn exchange(connection: &mut Connection) -> Result<DockQueryResult, BluetoothError> {
    connection.send(HostCommand::DockQuery.as_bytes()).await?;
    tokio::time::sleep(DOCK_QUERY_SETTLE_DELAY).await;

    connection.expect_frame(frame::DOCK_STATUS).await?;
    let status = connection.read_u8().await?;
    Ok(result_from_status(status))
}

/// Only `DOCKED` counts as docked; unknown values fail safe
pub fn result_from_status(byte: u8) -> DockQueryResult {
    let status = match byte {
        dock_status::DOCKED => DockStatus::Docked,
        dock_status::UNDOCKED => DockStatus::Undocked,
        other => {
            debug!("Unknown dock status byte {:#04X}", other);
            DockStatus::Undocked
        }
    };
    DockQueryResult {
        status,
        raw_status: Some(byte),
    }
}
