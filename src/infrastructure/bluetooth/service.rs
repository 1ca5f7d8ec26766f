//! Docking Service Module
//!
//! The docking state machine: one night-bounded detection cycle driving
//! the scanner and both wire protocols, and emitting `DockingEvent`s.
//!
//! ```text
//! Idle ──window open──▶ InitializationScan ──match──▶ PeriodicMonitoring
//!                            │ no match                  │ elapsed ≥ phase duration
//!                            ▼                           ▼
//!                       SilentBackoff ◀──undocked──── DirectQuery ──docked──▶ FileTransfer
//!                            │ ▲                                                 │
//!                            │ └─────────────────────────────────────────────────┘
//!                            └──(window still open)──▶ InitializationScan
//! ```
//!
//! All transitions happen on the task that calls `run`. Socket exchanges run
//! on spawned workers whose results are awaited here, and every phase runs
//! under a child of the stop token that is cancelled when the phase exits.

use crate::domain::models::{DeviceAddress, DockQueryResult, DockingEvent};
use crate::domain::night_window::NightWindow;
use crate::domain::session::{DockingSession, Phase};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::adapter::DiscoveryBackend;
use crate::infrastructure::bluetooth::connection::ConnectionManager;
use crate::infrastructure::bluetooth::dock_query::DockQueryProtocol;
use crate::infrastructure::bluetooth::error::BluetoothError;
use crate::infrastructure::bluetooth::file_transfer::{CaptureSink, FileTransferProtocol};
use crate::infrastructure::bluetooth::scanner::{DiscoveryScanner, ScanEvent, ScanSession};
use chrono::NaiveTime;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Radio re-enable attempts per phase before failing safe
const MAX_RADIO_RECOVERIES: u32 = 3;

/// Time given to the radio to come back up after re-enabling it
const RADIO_RECOVERY_DELAY: Duration = Duration::from_secs(2);

/// Source of local wall-clock time for the night-window check
pub type WallClock = Arc<dyn Fn() -> NaiveTime + Send + Sync>;

/// Parameters of one detection cycle
#[derive(Debug, Clone)]
pub struct DockingConfig {
    pub name_fragment: String,
    pub window: NightWindow,
    pub scan_duration: Duration,
    pub scan_period: Duration,
    pub monitoring_phase_duration: Duration,
    pub undocked_timeout: Duration,
    pub silent_state_duration: Duration,
    pub disable_radio_during_backoff: bool,
    /// Go straight from backoff to a new scan without re-checking the window
    pub continue_past_window: bool,
}

impl DockingConfig {
    /// Build the cycle parameters from loaded settings
    pub fn from_settings(settings: &Settings) -> Self {
        let timing = &settings.timing;
        Self {
            name_fragment: settings.device_name_fragment.trim().to_string(),
            window: settings.night_window.window(),
            scan_duration: timing.scan_duration(),
            scan_period: timing.scan_period(),
            monitoring_phase_duration: timing.monitoring_phase_duration(),
            undocked_timeout: timing.undocked_timeout(),
            silent_state_duration: timing.silent_state_duration(),
            disable_radio_during_backoff: settings.disable_radio_during_backoff,
            continue_past_window: settings.continue_past_window,
        }
    }
}

enum InitialScan {
    Found(DeviceAddress),
    NotFound,
    Failed(BluetoothError),
    Stopped,
}

pub struct DockingStateMachine {
    config: DockingConfig,
    discovery: Arc<dyn DiscoveryBackend>,
    scanner: DiscoveryScanner,
    dock_query: DockQueryProtocol,
    file_transfer: FileTransferProtocol,
    captures: Arc<dyn CaptureSink>,
    events: mpsc::UnboundedSender<DockingEvent>,
    session: DockingSession,
    clock: WallClock,
}

impl DockingStateMachine {
    /// Create an idle state machine using the local clock
    pub fn new(
        config: DockingConfig,
        discovery: Arc<dyn DiscoveryBackend>,
        connections: Arc<ConnectionManager>,
        captures: Arc<dyn CaptureSink>,
        events: mpsc::UnboundedSender<DockingEvent>,
    ) -> Self {
        Self {
            config,
            scanner: DiscoveryScanner::new(discovery.clone()),
            discovery,
            dock_query: DockQueryProtocol::new(connections.clone()),
            file_transfer: FileTransferProtocol::new(connections),
            captures,
            events,
            session: DockingSession::new(),
            clock: Arc::new(|| chrono::Local::now().time()),
        }
    }

    /// Replace the wall clock used for the night-window check
    pub fn with_clock(mut self, clock: WallClock) -> Self {
        self.clock = clock;
        self
    }

    /// Current phase; `Idle` between invocations
    pub fn phase(&self) -> Phase {
        self.session.phase()
    }

    /// Check the night window against the wall clock
    pub fn window_open(&self) -> bool {
        self.config.window.contains(&(self.clock)())
    }

    /// Run one invocation of the detection cycle.
    ///
    /// Returns at once when the night window is closed. Otherwise cycles
    /// until the window closes after a backoff, `stop` is cancelled, or
    /// discovery is not permitted. The machine is back in `Idle` afterwards.
    pub async fn run(&mut self, stop: &CancellationToken) -> Result<(), BluetoothError> {
        if stop.is_cancelled() {
            return Ok(());
        }
        if !self.window_open() {
            debug!("Night window closed, staying idle");
            return Ok(());
        }

        info!("Night window open, starting docking cycle");
        self.session.enter(Phase::InitializationScan);
        let result = self.cycle(stop).await;

        self.scanner.stop();
        self.session.enter(Phase::Idle);
        match &result {
            Ok(()) if stop.is_cancelled() => info!("Docking cycle stopped"),
            Ok(()) => info!("Docking cycle finished"),
            Err(e) => error!("Docking cycle aborted: {}", e),
        }
        result
    }

    async fn cycle(&mut self, stop: &CancellationToken) -> Result<(), BluetoothError> {
        loop {
            let current = self.session.phase();
            let phase_token = stop.child_token();
            let _phase_guard = phase_token.clone().drop_guard();

            let next = match current {
                Phase::Idle => return Ok(()),
                Phase::InitializationScan => self.initialization_scan(&phase_token).await?,
                Phase::PeriodicMonitoring => self.periodic_monitoring(&phase_token).await?,
                Phase::DirectQuery => self.direct_query(&phase_token).await,
                Phase::FileTransfer => self.transfer_files(&phase_token).await,
                Phase::SilentBackoff => self.silent_backoff(&phase_token).await,
            };

            if stop.is_cancelled() {
                return Ok(());
            }
            debug!("Phase {:?} -> {:?}", current, next);
            self.session.enter(next);
        }
    }

    async fn initialization_scan(
        &mut self,
        token: &CancellationToken,
    ) -> Result<Phase, BluetoothError> {
        self.session.reset();
        let mut radio_recoveries = 0;

        loop {
            info!(
                "Scanning for '{}' ({:?})",
                self.config.name_fragment, self.config.scan_duration
            );
            let outcome = if self.radio_is_off().await {
                InitialScan::Failed(BluetoothError::RadioUnavailable)
            } else {
                self.scan_for_target(token).await
            };
            self.scanner.stop();

            match outcome {
                InitialScan::Stopped => return Ok(Phase::Idle),
                InitialScan::Found(address) => {
                    let now = Instant::now();
                    self.session.record_discovery(address.clone(), now);
                    self.session.start_monitoring(now);
                    info!("Found target device {}", address);
                    return Ok(Phase::PeriodicMonitoring);
                }
                InitialScan::NotFound => {
                    info!("Target device not found");
                    self.emit(token, DockingEvent::Undocked);
                    return Ok(Phase::SilentBackoff);
                }
                InitialScan::Failed(BluetoothError::PermissionDenied) => {
                    return Err(BluetoothError::PermissionDenied);
                }
                InitialScan::Failed(BluetoothError::RadioUnavailable) => {
                    if !self.recover_radio(&mut radio_recoveries, token).await {
                        if token.is_cancelled() {
                            return Ok(Phase::Idle);
                        }
                        self.emit(token, DockingEvent::Undocked);
                        return Ok(Phase::SilentBackoff);
                    }
                }
                InitialScan::Failed(e) => {
                    warn!("Discovery failed: {}", e);
                    self.emit(token, DockingEvent::Undocked);
                    return Ok(Phase::SilentBackoff);
                }
            }
        }
    }

    /// A query failure is left to the scan itself to report
    async fn radio_is_off(&self) -> bool {
        match self.discovery.is_radio_enabled().await {
            Ok(enabled) => !enabled,
            Err(e) => {
                debug!("Could not read radio state: {}", e);
                false
            }
        }
    }

    async fn scan_for_target(&mut self, token: &CancellationToken) -> InitialScan {
        let mut scan = self.scanner.start(self.config.scan_duration, token);
        while let Some(event) = scan.next().await {
            match event {
                ScanEvent::DeviceFound(device) if device.matches(&self.config.name_fragment) => {
                    return InitialScan::Found(device.address);
                }
                ScanEvent::DeviceFound(device) => {
                    trace!("Ignoring {} ({})", device.name, device.address);
                }
                ScanEvent::Failed(e) => return InitialScan::Failed(e),
            }
        }
        if token.is_cancelled() {
            InitialScan::Stopped
        } else {
            InitialScan::NotFound
        }
    }

    async fn periodic_monitoring(
        &mut self,
        token: &CancellationToken,
    ) -> Result<Phase, BluetoothError> {
        if !self.session.is_found() {
            warn!("Monitoring started without a target device");
            self.emit(token, DockingEvent::Undocked);
            return Ok(Phase::SilentBackoff);
        }

        let mut ticker = tokio::time::interval(self.config.scan_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut scan: Option<ScanSession> = None;
        let mut radio_recoveries = 0;

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(Phase::Idle),
                _ = ticker.tick() => {
                    let now = Instant::now();
                    if self.session.monitoring_elapsed(now) >= self.config.monitoring_phase_duration {
                        info!("Device still present after {:?}, querying dock", self.config.monitoring_phase_duration);
                        self.scanner.stop();
                        self.emit(token, DockingEvent::Ambiguous);
                        return Ok(Phase::DirectQuery);
                    }
                    if self.session.since_last_seen(now) > self.config.undocked_timeout {
                        info!("Device not seen for over {:?}", self.config.undocked_timeout);
                        self.scanner.stop();
                        self.emit(token, DockingEvent::Undocked);
                        return Ok(Phase::SilentBackoff);
                    }
                    scan = Some(self.scanner.start(self.config.scan_duration, token));
                }
                event = next_scan_event(&mut scan) => match event {
                    Some(ScanEvent::DeviceFound(device)) => {
                        if device.matches(&self.config.name_fragment)
                            && self.session.record_sighting(&device.address, Instant::now())
                        {
                            debug!("Target device {} still in range", device.address);
                        }
                    }
                    Some(ScanEvent::Failed(BluetoothError::PermissionDenied)) => {
                        self.scanner.stop();
                        return Err(BluetoothError::PermissionDenied);
                    }
                    Some(ScanEvent::Failed(BluetoothError::RadioUnavailable)) => {
                        scan = None;
                        if !self.recover_radio(&mut radio_recoveries, token).await {
                            if token.is_cancelled() {
                                return Ok(Phase::Idle);
                            }
                            self.emit(token, DockingEvent::Undocked);
                            return Ok(Phase::SilentBackoff);
                        }
                    }
                    Some(ScanEvent::Failed(e)) => {
                        warn!("Monitoring scan failed: {}", e);
                        scan = None;
                    }
                    None => scan = None,
                },
            }
        }
    }

    async fn direct_query(&mut self, token: &CancellationToken) -> Phase {
        let Some(address) = self.session.target().cloned() else {
            self.emit(token, DockingEvent::Undocked);
            return Phase::SilentBackoff;
        };

        info!("Querying dock status of {}", address);
        let protocol = self.dock_query.clone();
        let worker = tokio::spawn(async move { protocol.query(&address).await });

        let result = match join_worker(token, worker).await {
            None => return Phase::Idle,
            Some(Ok(result)) => result,
            Some(Err(e)) => {
                error!("Dock query worker failed: {}", e);
                DockQueryResult::undocked()
            }
        };

        if result.is_docked() {
            self.emit(token, DockingEvent::Docked);
            self.emit(token, DockingEvent::FileTransferStarted);
            Phase::FileTransfer
        } else {
            self.emit(token, DockingEvent::Undocked);
            Phase::SilentBackoff
        }
    }

    async fn transfer_files(&mut self, token: &CancellationToken) -> Phase {
        let Some(address) = self.session.target().cloned() else {
            return Phase::SilentBackoff;
        };

        info!("Starting file transfer from {}", address);
        let protocol = self.file_transfer.clone();
        let sink = self.captures.clone();
        let worker = tokio::spawn(async move { protocol.run(&address, sink.as_ref()).await });

        match join_worker(token, worker).await {
            None => return Phase::Idle,
            Some(Ok(Ok(report))) => info!(
                "File transfer finished: {} listed, {} completed, {} failed, {} degraded group(s)",
                report.files_listed, report.files_completed, report.files_failed, report.bad_groups
            ),
            Some(Ok(Err(e))) if e.is_stream_loss() => warn!("Device stream lost during transfer: {}", e),
            Some(Ok(Err(e))) => warn!("File transfer aborted: {}", e),
            Some(Err(e)) => error!("File transfer worker failed: {}", e),
        }
        Phase::SilentBackoff
    }

    async fn silent_backoff(&mut self, token: &CancellationToken) -> Phase {
        info!("Silent backoff for {:?}", self.config.silent_state_duration);
        if self.config.disable_radio_during_backoff {
            if let Err(e) = self.discovery.set_radio_enabled(false).await {
                warn!("Could not disable radio: {}", e);
            }
        }

        let stopped = tokio::select! {
            _ = token.cancelled() => true,
            _ = tokio::time::sleep(self.config.silent_state_duration) => false,
        };

        if self.config.disable_radio_during_backoff {
            if let Err(e) = self.discovery.set_radio_enabled(true).await {
                warn!("Could not re-enable radio: {}", e);
            }
        }

        if stopped {
            Phase::Idle
        } else if self.config.continue_past_window || self.window_open() {
            Phase::InitializationScan
        } else {
            info!("Night window closed");
            Phase::Idle
        }
    }

    /// Re-enable the radio and wait for it to settle. Returns `false` once
    /// the recovery budget is spent or the phase was stopped.
    async fn recover_radio(&self, recoveries: &mut u32, token: &CancellationToken) -> bool {
        if *recoveries >= MAX_RADIO_RECOVERIES {
            warn!("Radio still unavailable after {} attempts", MAX_RADIO_RECOVERIES);
            return false;
        }
        *recoveries += 1;
        warn!(
            "Radio unavailable, re-enabling (attempt {}/{})",
            recoveries, MAX_RADIO_RECOVERIES
        );
        if let Err(e) = self.discovery.set_radio_enabled(true).await {
            warn!("Could not re-enable radio: {}", e);
        }
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(RADIO_RECOVERY_DELAY) => true,
        }
    }

    /// Nothing is emitted once the cycle has been stopped
    fn emit(&self, token: &CancellationToken, event: DockingEvent) {
        if token.is_cancelled() {
            debug!("Dropping {:?} after stop", event);
            return;
        }
        info!("Docking event: {:?}", event);
        let _ = self.events.send(event);
    }
}

async fn next_scan_event(scan: &mut Option<ScanSession>) -> Option<ScanEvent> {
    match scan {
        Some(session) => session.next().await,
        None => std::future::pending().await,
    }
}

/// Await a worker, aborting it when `token` fires. `None` means stopped.
async fn join_worker<T>(
    token: &CancellationToken,
    mut worker: JoinHandle<T>,
) -> Option<Result<T, JoinError>> {
    tokio::select! {
        _ = token.cancelled() => {
            worker.abort();
            let _ = worker.await;
            None
        }
        joined = &mut worker => Some(joined),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DeviceRecord;
    use crate::infrastructure::bluetooth::connection::ConnectionConfig;
    use crate::infrastructure::bluetooth::testing::{
        RecordingSink, ScriptStep, ScriptedConnector, ScriptedDiscovery, ScriptedStream,
    };

    const SENSOR: &str = "00:11:22:33:44:55";

    struct Harness {
        discovery: Arc<ScriptedDiscovery>,
        connector: Arc<ScriptedConnector>,
        sink: Arc<RecordingSink>,
        events: mpsc::UnboundedReceiver<DockingEvent>,
    }

    impl Harness {
        fn drain(&mut self) -> Vec<DockingEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    /// 22:00-23:30 window with default timings; one cycle from 23:00 ends
    /// outside the window after the first backoff
    fn config() -> DockingConfig {
        let mut config = DockingConfig::from_settings(&Settings::default());
        config.window = NightWindow::new(22, 0, 23, 30);
        config
    }

    /// Wall clock starting at `hour:minute` and following tokio time
    fn clock_at(hour: u32, minute: u32) -> WallClock {
        let origin = Instant::now();
        let base = NaiveTime::from_hms_opt(hour, minute, 0).unwrap();
        Arc::new(move || base + chrono::Duration::from_std(origin.elapsed()).unwrap())
    }

    fn machine(config: DockingConfig) -> (DockingStateMachine, Harness) {
        let discovery = Arc::new(ScriptedDiscovery::new());
        let connector = Arc::new(ScriptedConnector::new());
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let connections = Arc::new(ConnectionManager::new(
            connector.clone(),
            ConnectionConfig::default(),
        ));
        let machine = DockingStateMachine::new(config, discovery.clone(), connections, sink.clone(), tx)
            .with_clock(clock_at(23, 0));
        let harness = Harness {
            discovery,
            connector,
            sink,
            events: rx,
        };
        (machine, harness)
    }

    fn sensor(address: &str) -> DeviceRecord {
        DeviceRecord::new("DockSensor-01", DeviceAddress::new(address))
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_window_stays_idle() {
        let (machine, mut harness) = machine(config());
        let mut machine = machine.with_clock(clock_at(12, 0));

        machine.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(machine.phase(), Phase::Idle);
        assert_eq!(harness.discovery.started_inquiries(), 0);
        assert!(harness.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_match_is_undocked_then_idle_after_window() {
        let (mut machine, mut harness) = machine(config());
        harness.discovery.push_inquiry(vec![ScriptStep::found_after(
            1,
            DeviceRecord::new("Headphones", DeviceAddress::new("00:00:00:00:00:09")),
        )]);

        machine.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(harness.drain(), vec![DockingEvent::Undocked]);
        assert_eq!(harness.discovery.started_inquiries(), 1);
        assert!(harness.connector.attempts().is_empty());
        assert_eq!(machine.phase(), Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_docked_device_triggers_transfer() {
        let (mut machine, mut harness) = machine(config());
        harness.discovery.always_find("dOcKsEnSoR-01", SENSOR);
        let (query, _) = ScriptedStream::new(vec![0xFF, 0xD6, 0x01]);
        let (transfer, transfer_tap) = ScriptedStream::new(vec![0xD3, 0x00]);
        harness.connector.push_stream(query);
        harness.connector.push_stream(transfer);

        let started = Instant::now();
        machine.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(
            harness.drain(),
            vec![
                DockingEvent::Ambiguous,
                DockingEvent::Docked,
                DockingEvent::FileTransferStarted
            ]
        );
        let attempts = harness.connector.attempts();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[0] - started >= Duration::from_secs(600));
        assert_eq!(transfer_tap.written(), vec![0xD0]);
        assert_eq!(transfer_tap.drops(), 1);
        assert!(harness.sink.captures().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_leaving_range_is_undocked() {
        let (mut machine, mut harness) = machine(config());
        harness
            .discovery
            .push_inquiry(vec![ScriptStep::found_after(1, sensor(SENSOR))]);
        // Same name, different address: not the session target
        harness.discovery.always_find("DockSensor-01", "00:00:00:00:00:02");

        let started = Instant::now();
        machine.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(harness.drain(), vec![DockingEvent::Undocked]);
        assert!(harness.connector.attempts().is_empty());
        // scans at +0, 60, 120, 180; undocked decided on the 240 tick
        assert_eq!(harness.discovery.started_inquiries(), 5);
        assert!(started.elapsed() >= Duration::from_secs(241 + 1800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_query_is_undocked() {
        let (mut machine, mut harness) = machine(config());
        harness.discovery.always_find("DockSensor-01", SENSOR);

        machine.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            harness.drain(),
            vec![DockingEvent::Ambiguous, DockingEvent::Undocked]
        );
        assert_eq!(harness.connector.attempts().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_monitoring_silences_machine() {
        let (mut machine, mut harness) = machine(config());
        harness.discovery.always_find("DockSensor-01", SENSOR);
        let discovery = harness.discovery.clone();

        let stop = CancellationToken::new();
        let task_stop = stop.clone();
        let task = tokio::spawn(async move {
            let result = machine.run(&task_stop).await;
            (machine, result)
        });

        // init scan finds the device at +1s; the second monitoring scan
        // starts at +61s and is still running at +65s
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(discovery.active_inquiries(), 1);
        stop.cancel();

        let (machine, result) = task.await.unwrap();
        result.unwrap();
        assert_eq!(machine.phase(), Phase::Idle);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(discovery.active_inquiries(), 0);
        let started = discovery.started_inquiries();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(discovery.started_inquiries(), started);
        assert!(harness.drain().is_empty());
        assert!(harness.connector.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_query_releases_connection() {
        let (mut machine, mut harness) = machine(config());
        harness.discovery.always_find("DockSensor-01", SENSOR);
        let (query, tap) = ScriptedStream::stalling(vec![0xFF]);
        harness.connector.push_stream(query);

        let stop = CancellationToken::new();
        let task_stop = stop.clone();
        let task = tokio::spawn(async move { machine.run(&task_stop).await });

        // monitoring ends on the 601s tick; the query is waiting on the device
        tokio::time::sleep(Duration::from_secs(603)).await;
        assert_eq!(harness.connector.attempts().len(), 1);
        stop.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(tap.drops(), 1);
        assert_eq!(harness.drain(), vec![DockingEvent::Ambiguous]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_aborts_cycle() {
        let (mut machine, mut harness) = machine(config());
        harness.discovery.push_inquiry(vec![ScriptStep::fail_after(
            0,
            BluetoothError::PermissionDenied,
        )]);

        let result = machine.run(&CancellationToken::new()).await;
        assert!(matches!(result, Err(BluetoothError::PermissionDenied)));
        assert_eq!(machine.phase(), Phase::Idle);
        assert!(harness.drain().is_empty());
        assert!(harness.discovery.radio_toggles().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_during_monitoring_aborts_cycle() {
        let (mut machine, mut harness) = machine(config());
        harness
            .discovery
            .push_inquiry(vec![ScriptStep::found_after(1, sensor(SENSOR))]);
        harness.discovery.push_inquiry(vec![ScriptStep::fail_after(
            1,
            BluetoothError::PermissionDenied,
        )]);

        let result = machine.run(&CancellationToken::new()).await;
        assert!(matches!(result, Err(BluetoothError::PermissionDenied)));
        assert_eq!(machine.phase(), Phase::Idle);
        assert!(harness.drain().is_empty());
        assert!(harness.connector.attempts().is_empty());
        assert_eq!(harness.discovery.started_inquiries(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_off_before_scan_is_recovered() {
        let (mut machine, mut harness) = machine(config());
        harness.discovery.set_radio_enabled(false).await.unwrap();

        machine.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(harness.discovery.radio_toggles(), vec![false, true]);
        assert_eq!(harness.discovery.started_inquiries(), 1);
        assert_eq!(harness.drain(), vec![DockingEvent::Undocked]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_loss_during_monitoring_keeps_monitoring() {
        let (mut machine, mut harness) = machine(config());
        harness
            .discovery
            .push_inquiry(vec![ScriptStep::found_after(1, sensor(SENSOR))]);
        harness.discovery.push_inquiry(vec![ScriptStep::fail_after(
            1,
            BluetoothError::RadioUnavailable,
        )]);
        harness.discovery.always_find("DockSensor-01", SENSOR);

        machine.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(harness.discovery.radio_toggles(), vec![true]);
        // no stream scripted, so the query fails safe
        assert_eq!(
            harness.drain(),
            vec![DockingEvent::Ambiguous, DockingEvent::Undocked]
        );
        assert_eq!(harness.connector.attempts().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_transfer_releases_connection() {
        let (mut machine, mut harness) = machine(config());
        harness.discovery.always_find("DockSensor-01", SENSOR);
        let (query, _) = ScriptedStream::new(vec![0xD6, 0x01]);
        let (transfer, tap) = ScriptedStream::stalling(vec![0xD3, 0x01]);
        harness.connector.push_stream(query);
        harness.connector.push_stream(transfer);

        let stop = CancellationToken::new();
        let task_stop = stop.clone();
        let task = tokio::spawn(async move {
            let result = machine.run(&task_stop).await;
            (machine, result)
        });

        // docked at ~601.5s; the device lists one file and then goes quiet
        tokio::time::sleep(Duration::from_secs(603)).await;
        assert_eq!(harness.connector.attempts().len(), 2);
        stop.cancel();

        let (machine, result) = task.await.unwrap();
        result.unwrap();
        assert_eq!(machine.phase(), Phase::Idle);
        assert_eq!(tap.written(), vec![0xD0, 0xD1]);
        assert_eq!(tap.drops(), 1);
        assert_eq!(
            harness.drain(),
            vec![
                DockingEvent::Ambiguous,
                DockingEvent::Docked,
                DockingEvent::FileTransferStarted
            ]
        );
        assert!(harness.sink.captures().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_loss_is_recovered_and_scan_retried() {
        let (mut machine, mut harness) = machine(config());
        harness.discovery.push_inquiry(vec![ScriptStep::fail_after(
            1,
            BluetoothError::RadioUnavailable,
        )]);

        machine.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(harness.discovery.radio_toggles(), vec![true]);
        assert_eq!(harness.discovery.started_inquiries(), 2);
        assert_eq!(harness.drain(), vec![DockingEvent::Undocked]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_recovery_is_bounded() {
        let (mut machine, mut harness) = machine(config());
        for _ in 0..4 {
            harness.discovery.push_inquiry(vec![ScriptStep::fail_after(
                1,
                BluetoothError::RadioUnavailable,
            )]);
        }

        machine.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(harness.discovery.radio_toggles(), vec![true, true, true]);
        assert_eq!(harness.discovery.started_inquiries(), 4);
        assert_eq!(harness.drain(), vec![DockingEvent::Undocked]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_toggles_radio_when_configured() {
        let mut config = config();
        config.disable_radio_during_backoff = true;
        let (mut machine, harness) = machine(config);

        machine.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(harness.discovery.radio_toggles(), vec![false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continue_past_window_rescans_after_backoff() {
        let mut config = config();
        config.continue_past_window = true;
        let (mut machine, harness) = machine(config);
        let discovery = harness.discovery.clone();

        let stop = CancellationToken::new();
        let task_stop = stop.clone();
        let task = tokio::spawn(async move { machine.run(&task_stop).await });

        // 12s scan + 30min backoff ends at 23:30:12, past the window
        tokio::time::sleep(Duration::from_secs(12 + 1800 + 5)).await;
        assert_eq!(discovery.started_inquiries(), 2);
        stop.cancel();
        task.await.unwrap().unwrap();
    }
}
