use serde::{Deserialize, Serialize};
use std::fmt;

/// Bluetooth device address in `AA:BB:CC:DD:EE:FF` form
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(address.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A (name, address) pair observed during a discovery scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub name: String,
    pub address: DeviceAddress,
}

impl DeviceRecord {
    pub fn new(name: impl Into<String>, address: DeviceAddress) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }

    /// Case-insensitive substring match against the expected device-name fragment.
    /// An empty fragment matches nothing.
    pub fn matches(&self, name_fragment: &str) -> bool {
        if name_fragment.is_empty() {
            return false;
        }
        self.name
            .to_lowercase()
            .contains(&name_fragment.to_lowercase())
    }
}

/// Outward notifications produced by the docking state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockingEvent {
    Docked,
    Undocked,
    Ambiguous,
    FileTransferStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockStatus {
    Docked,
    Undocked,
}

/// Result of a single dock-status query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DockQueryResult {
    pub status: DockStatus,
    /// Raw status byte, when the exchange got that far
    pub raw_status: Option<u8>,
}

impl DockQueryResult {
    /// Fail-safe outcome for every error path
    pub fn undocked() -> Self {
        Self {
            status: DockStatus::Undocked,
            raw_status: None,
        }
    }

    pub fn is_docked(&self) -> bool {
        self.status == DockStatus::Docked
    }
}
