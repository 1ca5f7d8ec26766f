//! Bluetooth Module
//!
//! Bluetooth Classic presence detection and data retrieval for the sensor.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  DockingStateMachine                     │
//! │   (night-bounded detection cycle, emits DockingEvent)    │
//! └──────┬────────────────┬─────────────────────┬────────────┘
//!        │                │                     │
//!        ▼                ▼                     ▼
//! ┌────────────┐  ┌──────────────┐  ┌──────────────────────┐
//! │  Scanner   │  │  DockQuery   │  │    FileTransfer      │
//! │            │  │  D5 → D6 xx  │  │  D0/D1/D2 + chunks   │
//! └─────┬──────┘  └──────┬───────┘  └──────────┬───────────┘
//!       │                └──────────┬──────────┘
//!       ▼                           ▼
//! ┌────────────────┐        ┌──────────────────┐
//! │DiscoveryBackend│        │ ConnectionManager│
//! │  (adapter.rs)  │        │ + StreamConnector│
//! └────────────────┘        └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`adapter`] - Capability traits implemented by a platform backend
//! - [`protocol`] - Wire constants and chunk framing
//! - [`scanner`] - Bounded discovery scans as an event stream
//! - [`connection`] - Retried connect and the scoped socket
//! - [`dock_query`] - Dock-status exchange
//! - [`file_transfer`] - Multi-file chunked transfer
//! - [`service`] - The docking state machine

pub mod adapter;
#[cfg(feature = "bluez")]
pub mod bluez;
pub mod connection;
pub mod dock_query;
pub mod error;
pub mod file_transfer;
pub mod protocol;
pub mod scanner;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use error::BluetoothError;
pub use service::{DockingConfig, DockingStateMachine};
