//! Discovery Scanner Module
//!
//! Runs bounded-duration Bluetooth Classic inquiries and exposes the
//! observed devices as an event stream.

use crate::domain::models::DeviceRecord;
use crate::infrastructure::bluetooth::adapter::DiscoveryBackend;
use crate::infrastructure::bluetooth::error::BluetoothError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug)]
pub enum ScanEvent {
    DeviceFound(DeviceRecord),
    /// The inquiry ended with an error (permission, radio down, ...)
    Failed(BluetoothError),
}

/// Event stream of one running inquiry.
///
/// Yields `None` once the scan has ended or was stopped. Nothing is
/// delivered after `stop()`, even if events were already queued.
pub struct ScanSession {
    events: mpsc::UnboundedReceiver<ScanEvent>,
    cancel: CancellationToken,
}

impl ScanSession {
    /// Next event, or `None` once the scan has ended or was stopped
    pub async fn next(&mut self) -> Option<ScanEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Discovery scanner for the sensor device
pub struct DiscoveryScanner {
    backend: Arc<dyn DiscoveryBackend>,
    active: Option<CancellationToken>,
}

impl DiscoveryScanner {
    pub fn new(backend: Arc<dyn DiscoveryBackend>) -> Self {
        Self {
            backend,
            active: None,
        }
    }

    /// Start an inquiry lasting at most `duration`.
    ///
    /// The scan is also stopped when `parent` is cancelled. Any scan still
    /// running from an earlier call is stopped first.
    pub fn start(&mut self, duration: Duration, parent: &CancellationToken) -> ScanSession {
        self.stop();

        debug!("Starting discovery scan for {:?}", duration);
        let cancel = parent.child_token();
        let (tx, rx) = mpsc::unbounded_channel();

        let backend = self.backend.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let failure_tx = tx.clone();
            tokio::select! {
                result = backend.inquire(tx, token.clone()) => {
                    if let Err(e) = result {
                        debug!("Discovery scan failed: {}", e);
                        let _ = failure_tx.send(ScanEvent::Failed(e));
                    }
                }
                _ = tokio::time::sleep(duration) => debug!("Discovery scan window elapsed"),
                _ = token.cancelled() => debug!("Discovery scan cancelled"),
            }
        });

        self.active = Some(cancel.clone());
        ScanSession { events: rx, cancel }
    }

    /// Stop the running scan, if any. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(token) = self.active.take() {
            if !token.is_cancelled() {
                info!("Stopping discovery scan");
                token.cancel();
            }
        }
    }

    /// Whether a started scan has not been stopped yet
    pub fn is_scanning(&self) -> bool {
        self.active
            .as_ref()
            .map(|token| !token.is_cancelled())
            .unwrap_or(false)
    }
}

impl Drop for DiscoveryScanner {
    fn drop(&mut self) {
        self.stop();
    }
}
