//! Per-cycle docking session state

use crate::domain::models::DeviceAddress;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    InitializationScan,
    PeriodicMonitoring,
    DirectQuery,
    FileTransfer,
    SilentBackoff,
}

/// State owned by the docking state machine for one detection cycle.
///
/// Reset at the start of every initialization phase. Once a target address
/// has been discovered it stays fixed until the next reset.
#[derive(Debug, Clone)]
pub struct DockingSession {
    phase: Phase,
    target: Option<DeviceAddress>,
    monitoring_started: Option<Instant>,
    last_seen: Option<Instant>,
    found: bool,
}

impl Default for DockingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl DockingSession {
    /// Idle session with no target
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            target: None,
            monitoring_started: None,
            last_seen: None,
            found: false,
        }
    }

    /// Clear everything but the current phase
    pub fn reset(&mut self) {
        *self = Self {
            phase: self.phase,
            ..Self::new()
        };
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Record the phase the machine just moved to
    pub fn enter(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub fn target(&self) -> Option<&DeviceAddress> {
        self.target.as_ref()
    }

    /// Whether the initialization scan matched a device
    pub fn is_found(&self) -> bool {
        self.found
    }

    /// Record the first matching device. Returns `false` if a target was
    /// already set, in which case nothing changes.
    pub fn record_discovery(&mut self, address: DeviceAddress, now: Instant) -> bool {
        if self.target.is_some() {
            return false;
        }
        self.target = Some(address);
        self.found = true;
        self.last_seen = Some(now);
        true
    }

    /// Refresh last-seen if `address` is the session target
    pub fn record_sighting(&mut self, address: &DeviceAddress, now: Instant) -> bool {
        if self.target.as_ref() != Some(address) {
            return false;
        }
        self.last_seen = Some(now);
        true
    }

    /// Start the monitoring clock; a target never seen counts as seen now
    pub fn start_monitoring(&mut self, now: Instant) {
        self.monitoring_started = Some(now);
        if self.last_seen.is_none() {
            self.last_seen = Some(now);
        }
    }

    /// Zero before monitoring has started
    pub fn monitoring_elapsed(&self, now: Instant) -> Duration {
        self.monitoring_started
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default()
    }

    /// `Duration::MAX` when the target was never seen
    pub fn since_last_seen(&self, now: Instant) -> Duration {
        self.last_seen
            .map(|seen| now.saturating_duration_since(seen))
            .unwrap_or(Duration::MAX)
    }
}
