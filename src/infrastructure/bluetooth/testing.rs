//! Scripted Bluetooth doubles for unit tests

use crate::domain::models::{DeviceAddress, DeviceRecord};
use crate::infrastructure::bluetooth::adapter::{DeviceStream, DiscoveryBackend, StreamConnector};
use crate::infrastructure::bluetooth::error::BluetoothError;
use crate::infrastructure::bluetooth::file_transfer::{CaptureSink, FileCapture};
use crate::infrastructure::bluetooth::scanner::ScanEvent;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

pub enum ScriptStep {
    Found(Duration, DeviceRecord),
    Fail(Duration, BluetoothError),
}

impl ScriptStep {
    pub fn found_after(secs: u64, record: DeviceRecord) -> Self {
        Self::Found(Duration::from_secs(secs), record)
    }

    pub fn fail_after(secs: u64, error: BluetoothError) -> Self {
        Self::Fail(Duration::from_secs(secs), error)
    }
}

/// Discovery backend replaying one script per inquiry. With no script
/// queued an inquiry sees nothing and runs until cancelled.
#[derive(Default)]
pub struct ScriptedDiscovery {
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    default_script: Mutex<Option<(String, DeviceAddress)>>,
    started: AtomicUsize,
    active: Arc<AtomicUsize>,
    radio_off: AtomicBool,
    radio_toggles: Mutex<Vec<bool>>,
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_inquiry(&self, steps: Vec<ScriptStep>) {
        self.scripts.lock().unwrap().push_back(steps);
    }

    /// Once the queued scripts run out, every inquiry reports this device
    /// one second in
    pub fn always_find(&self, name: &str, address: &str) {
        *self.default_script.lock().unwrap() = Some((name.to_string(), DeviceAddress::new(address)));
    }

    pub fn started_inquiries(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn active_inquiries(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn radio_toggles(&self) -> Vec<bool> {
        self.radio_toggles.lock().unwrap().clone()
    }

    fn next_script(&self) -> Vec<ScriptStep> {
        if let Some(script) = self.scripts.lock().unwrap().pop_front() {
            return script;
        }
        match self.default_script.lock().unwrap().as_ref() {
            Some((name, address)) => vec![ScriptStep::found_after(
                1,
                DeviceRecord::new(name.clone(), address.clone()),
            )],
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl DiscoveryBackend for ScriptedDiscovery {
    async fn is_radio_enabled(&self) -> Result<bool, BluetoothError> {
        Ok(!self.radio_off.load(Ordering::SeqCst))
    }

    async fn set_radio_enabled(&self, enabled: bool) -> Result<(), BluetoothError> {
        self.radio_off.store(!enabled, Ordering::SeqCst);
        self.radio_toggles.lock().unwrap().push(enabled);
        Ok(())
    }

    async fn inquire(
        &self,
        events: mpsc::UnboundedSender<ScanEvent>,
        cancel: CancellationToken,
    ) -> Result<(), BluetoothError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        let _guard = ActiveGuard(self.active.clone());

        for step in self.next_script() {
            match step {
                ScriptStep::Found(delay, record) => {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(ScanEvent::DeviceFound(record));
                }
                ScriptStep::Fail(delay, error) => {
                    tokio::time::sleep(delay).await;
                    return Err(error);
                }
            }
        }
        cancel.cancelled().await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

/// Shared view of what the host did with a scripted stream
#[derive(Clone, Default)]
pub struct StreamTap {
    written: Arc<Mutex<Vec<u8>>>,
    drops: Arc<AtomicUsize>,
}

impl StreamTap {
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub fn drops(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }
}

/// Replays device bytes and records host writes. After the script is
/// exhausted reads hit end-of-stream, or stall when `stall_at_end` is set.
pub struct ScriptedStream {
    incoming: Vec<u8>,
    position: usize,
    stall_at_end: bool,
    tap: StreamTap,
}

impl ScriptedStream {
    pub fn new(incoming: Vec<u8>) -> (Self, StreamTap) {
        let tap = StreamTap::default();
        let stream = Self {
            incoming,
            position: 0,
            stall_at_end: false,
            tap: tap.clone(),
        };
        (stream, tap)
    }

    pub fn stalling(incoming: Vec<u8>) -> (Self, StreamTap) {
        let (mut stream, tap) = Self::new(incoming);
        stream.stall_at_end = true;
        (stream, tap)
    }
}

impl AsyncRead for ScriptedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let remaining = &this.incoming[this.position..];
        if remaining.is_empty() && this.stall_at_end {
            return Poll::Pending;
        }
        let n = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..n]);
        this.position += n;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ScriptedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.tap.written.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Drop for ScriptedStream {
    fn drop(&mut self) {
        self.tap.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector handing out queued outcomes, one per `open` call.
/// An empty queue fails the attempt.
#[derive(Default)]
pub struct ScriptedConnector {
    outcomes: Mutex<VecDeque<Result<ScriptedStream, BluetoothError>>>,
    attempts: Mutex<Vec<Instant>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_stream(&self, stream: ScriptedStream) {
        self.outcomes.lock().unwrap().push_back(Ok(stream));
    }

    pub fn push_failure(&self, error: BluetoothError) {
        self.outcomes.lock().unwrap().push_back(Err(error));
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamConnector for ScriptedConnector {
    async fn open(&self, _address: &DeviceAddress) -> Result<Box<dyn DeviceStream>, BluetoothError> {
        self.attempts.lock().unwrap().push(Instant::now());
        match self.outcomes.lock().unwrap().pop_front() {
            Some(Ok(stream)) => Ok(Box::new(stream)),
            Some(Err(e)) => Err(e),
            None => Err(BluetoothError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "no scripted stream",
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Captures
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingSink {
    captures: Mutex<Vec<FileCapture>>,
}

impl RecordingSink {
    pub fn captures(&self) -> Vec<FileCapture> {
        self.captures.lock().unwrap().clone()
    }
}

impl CaptureSink for RecordingSink {
    fn store(&self, capture: &FileCapture) -> anyhow::Result<()> {
        self.captures.lock().unwrap().push(capture.clone());
        Ok(())
    }
}
