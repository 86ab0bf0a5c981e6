//! The device worker: one thread that owns the instrument session.
//!
//! Collaborators never touch the session. They submit [`Request`]s through a
//! [`WorkerHandle`] and receive [`Event`]s back on a channel, so a slow
//! transfer never blocks the caller. Requests run strictly in submission
//! order on the worker thread.
//!
//! Operations other than connect and cleanup need the worker to be idle.
//! The busy flag is claimed with a compare-and-swap when the request is
//! submitted, so a second request issued while one is outstanding is rejected
//! with an error event instead of being queued behind it.

use crate::commands::Channel;
use crate::error::{ErrorKind, ScopeError};
use crate::executor::{self, BatchReport};
use crate::measurement::{self, Measurement, MeasurementConfig};
use crate::safety::{SafetyPolicy, SafetyValidator};
use crate::screenshot::{self, CaptureSettings, Screenshot};
use crate::session::Session;
use crate::settings::{self, SettingsSnapshot};
use crate::transport::{Connector, NetworkConnector, ResourceAddress};
use crate::waveform;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Request {
    Connect(ResourceAddress),
    SendCommand(String),
    SendCommands(Vec<String>),
    CaptureScreenshot { target: Option<(u32, u32)> },
    FetchMeasurements(Vec<MeasurementConfig>),
    SyncSettings,
    ExportWaveform { channel: Channel, destination: PathBuf },
    Cleanup,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Connect(_) => "connect",
            Request::SendCommand(_) => "send-command",
            Request::SendCommands(_) => "send-commands",
            Request::CaptureScreenshot { .. } => "capture-screenshot",
            Request::FetchMeasurements(_) => "fetch-measurements",
            Request::SyncSettings => "sync-settings",
            Request::ExportWaveform { .. } => "export-waveform",
            Request::Cleanup => "cleanup",
        }
    }

    /// Connect and cleanup are accepted in any state.
    pub fn needs_idle(&self) -> bool {
        !matches!(self, Request::Connect(_) | Request::Cleanup)
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Connected { identity: String },
    Disconnected,
    Error { kind: ErrorKind, message: String },
    Response(String),
    ScreenshotReady(Screenshot),
    MeasurementReady(Vec<Measurement>),
    ExportFinished(String),
    SettingsReady(SettingsSnapshot),
    BusyState(bool),
    RefreshCycleComplete,
}

impl Event {
    pub fn error(err: &ScopeError) -> Self {
        Event::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::Connected { .. } => "connected",
            Event::Disconnected => "disconnected",
            Event::Error { .. } => "error",
            Event::Response(_) => "response",
            Event::ScreenshotReady(_) => "screenshot-ready",
            Event::MeasurementReady(_) => "measurement-ready",
            Event::ExportFinished(_) => "export-finished",
            Event::SettingsReady(_) => "settings-ready",
            Event::BusyState(_) => "busy-state",
            Event::RefreshCycleComplete => "refresh-cycle-complete",
        }
    }

    /// One-line human readable description.
    pub fn summary(&self) -> String {
        match self {
            Event::Connected { identity } => format!("Connected to {identity}"),
            Event::Disconnected => "Disconnected".to_string(),
            Event::Error { kind, message } => format!("{kind:?}: {message}"),
            Event::Response(text) => text.clone(),
            Event::ScreenshotReady(shot) => format!(
                "Screenshot {}x{} ({} bytes)",
                shot.width(),
                shot.height(),
                shot.byte_len
            ),
            Event::MeasurementReady(results) => results
                .iter()
                .map(|m| format!("{} {} {} = {}", m.p, m.source, m.kind, m.value))
                .collect::<Vec<_>>()
                .join("; "),
            Event::ExportFinished(message) => message.clone(),
            Event::SettingsReady(snapshot) => format!("Settings synced ({} registers)", snapshot.len()),
            Event::BusyState(busy) => format!("Busy: {busy}"),
            Event::RefreshCycleComplete => "Refresh cycle complete".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Runtime knobs of the worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Default link timeout, applied on connect.
    pub timeout: Duration,
    pub capture: CaptureSettings,
    /// Timeout for waveform transfers.
    pub transfer_timeout: Duration,
    pub policy: SafetyPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let capture = CaptureSettings::default();
        Self {
            timeout: Duration::from_millis(5000),
            transfer_timeout: capture.capture_timeout,
            capture,
            policy: SafetyPolicy::DEFAULT,
        }
    }
}

/// Clears the busy flag however the operation ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Worker {
    connector: Box<dyn Connector>,
    config: WorkerConfig,
    validator: SafetyValidator,
    session: Option<Session>,
    busy: Arc<AtomicBool>,
    state: Arc<RwLock<LinkState>>,
    events: Sender<Event>,
}

impl Worker {
    fn run(mut self, requests: Receiver<Request>) {
        info!("Device worker started");
        while let Ok(request) = requests.recv() {
            debug!("Handling {} request", request.name());
            if request.needs_idle() {
                self.run_exclusive(request);
            } else {
                self.run_lifecycle(request);
            }
        }

        if self.session.is_some() {
            info!("Request channel closed, releasing instrument");
            self.cleanup();
        }
        info!("Device worker stopped");
    }

    fn emit(&self, event: Event) {
        // Nobody listening is not an error for the worker.
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: LinkState) {
        *self.state.write() = state;
    }

    fn run_lifecycle(&mut self, request: Request) {
        match request {
            Request::Connect(address) => self.connect(&address),
            Request::Cleanup => self.cleanup(),
            other => warn!("{} is not a lifecycle request", other.name()),
        }
    }

    fn connect(&mut self, address: &ResourceAddress) {
        if self.session.is_some() {
            info!("Closing current session before reconnecting");
            self.cleanup();
        }

        self.set_state(LinkState::Connecting);
        match Session::connect(self.connector.as_mut(), address, self.config.timeout) {
            Ok(session) => {
                let identity = session.identity().to_string();
                self.session = Some(session);
                self.set_state(LinkState::Connected);
                self.emit(Event::Connected { identity });
            }
            Err(e) => {
                error!("Connect to {address} failed: {e}");
                self.set_state(LinkState::Disconnected);
                self.emit(Event::error(&e));
            }
        }
    }

    fn cleanup(&mut self) {
        match self.session.take() {
            Some(session) => {
                for failure in session.close() {
                    self.emit(Event::error(&failure));
                }
            }
            None => debug!("Cleanup without a session"),
        }
        self.set_state(LinkState::Disconnected);
        self.emit(Event::Disconnected);
    }

    /// Run a request that holds the busy flag. The flag was claimed when the
    /// request was submitted and is released here before any result event
    /// goes out, so a collaborator reacting to the result can submit again.
    fn run_exclusive(&mut self, request: Request) {
        let mut outbox = Vec::new();
        let is_capture = matches!(request, Request::CaptureScreenshot { .. });

        if self.session.is_none() {
            self.busy.store(false, Ordering::SeqCst);
            self.emit(Event::error(&ScopeError::NotConnected));
            if is_capture {
                self.emit(Event::RefreshCycleComplete);
            }
            return;
        }

        self.emit(Event::BusyState(true));
        let busy = self.busy.clone();
        {
            let _guard = BusyGuard(&busy);
            if let Err(e) = self.dispatch(request, &mut outbox) {
                warn!("Operation failed: {e}");
                outbox.push(Event::error(&e));
                if e.is_transport() {
                    self.drop_session(&mut outbox);
                }
            }
            if is_capture {
                outbox.push(Event::RefreshCycleComplete);
            }
        }

        for event in outbox {
            self.emit(event);
        }
        self.emit(Event::BusyState(false));
    }

    fn dispatch(&mut self, request: Request, outbox: &mut Vec<Event>) -> Result<(), ScopeError> {
        let session = self.session.as_mut().ok_or(ScopeError::NotConnected)?;

        match request {
            Request::SendCommand(command) => {
                let text = executor::execute_one(session, &self.validator, &command)?;
                outbox.push(Event::Response(text));
            }
            Request::SendCommands(batch) => {
                let mut report = BatchReport::default();
                let result = report.run(session, &self.validator, &batch);
                // Skips recorded before a fault are reported either way.
                for (command, reason) in &report.skipped {
                    let rejection = ScopeError::SafetyRejection(format!("{command} skipped: {reason}"));
                    outbox.push(Event::error(&rejection));
                }
                result?;
                outbox.push(Event::Response(report.summary()));
            }
            Request::CaptureScreenshot { target } => {
                let shot = screenshot::capture(session, &self.config.capture, target)?;
                outbox.push(Event::ScreenshotReady(shot));
            }
            Request::FetchMeasurements(configs) => {
                let results = measurement::fetch(session, &configs)?;
                outbox.push(Event::MeasurementReady(results));
            }
            Request::SyncSettings => {
                let outcome = settings::sync(session);
                let link_lost = outcome.failures.iter().any(is_broken_link);
                outbox.extend(outcome.failures.iter().map(Event::error));
                if !outcome.snapshot.is_empty() {
                    outbox.push(Event::SettingsReady(outcome.snapshot));
                }
                if link_lost {
                    warn!("Link broke during settings sync");
                    self.drop_session(outbox);
                }
            }
            Request::ExportWaveform {
                channel,
                destination,
            } => {
                waveform::export(session, channel, &destination, self.config.transfer_timeout)?;
                outbox.push(Event::ExportFinished(waveform::finished_message(
                    channel,
                    &destination,
                )));
            }
            Request::Connect(_) | Request::Cleanup => {}
        }
        Ok(())
    }

    /// The link can no longer be trusted: release it without the restore
    /// sequence and require a new connect.
    fn drop_session(&mut self, outbox: &mut Vec<Event>) {
        if let Some(session) = self.session.take() {
            session.abandon();
        }
        self.set_state(LinkState::Disconnected);
        outbox.push(Event::Disconnected);
    }
}

/// A failed register whose cause was the connection itself rather than a
/// slow or unsupported query.
fn is_broken_link(err: &ScopeError) -> bool {
    match err {
        ScopeError::PartialResult { source, .. } => matches!(**source, ScopeError::Io { .. }),
        other => matches!(other, ScopeError::Io { .. }),
    }
}

/// Collaborator side of the worker.
pub struct WorkerHandle {
    requests: Option<Sender<Request>>,
    events_tx: Sender<Event>,
    events: Receiver<Event>,
    busy: Arc<AtomicBool>,
    state: Arc<RwLock<LinkState>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn(config: WorkerConfig) -> Result<Self, ScopeError> {
        let connector = NetworkConnector {
            connect_timeout: config.timeout,
        };
        Self::spawn_with_connector(config, Box::new(connector))
    }

    pub fn spawn_with_connector(
        config: WorkerConfig,
        connector: Box<dyn Connector>,
    ) -> Result<Self, ScopeError> {
        let (request_tx, request_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();
        let busy = Arc::new(AtomicBool::new(false));
        let state = Arc::new(RwLock::new(LinkState::Disconnected));

        let worker = Worker {
            connector,
            validator: SafetyValidator::new(config.policy),
            config,
            session: None,
            busy: busy.clone(),
            state: state.clone(),
            events: events_tx.clone(),
        };

        let thread = thread::Builder::new()
            .name("scope-worker".to_string())
            .spawn(move || worker.run(request_rx))
            .map_err(|source| ScopeError::Io {
                source,
                context: "Spawning device worker".to_string(),
            })?;

        Ok(Self {
            requests: Some(request_tx),
            events_tx,
            events: events_rx,
            busy,
            state,
            thread: Some(thread),
        })
    }

    /// Hand a request to the worker. Returns false when it was rejected; the
    /// reason is delivered as an error event.
    pub fn submit(&self, request: Request) -> bool {
        let claimed = request.needs_idle();
        if claimed
            && self
                .busy
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            debug!("Rejecting {} while busy", request.name());
            let _ = self
                .events_tx
                .send(Event::error(&ScopeError::Busy(request.name().to_string())));
            return false;
        }

        let name = request.name();
        let sent = self
            .requests
            .as_ref()
            .is_some_and(|tx| tx.send(request).is_ok());
        if !sent {
            error!("Device worker is gone, {name} request dropped");
            if claimed {
                self.busy.store(false, Ordering::SeqCst);
            }
            let _ = self.events_tx.send(Event::error(&ScopeError::NotConnected));
        }
        sent
    }

    pub fn connect(&self, address: ResourceAddress) -> bool {
        self.submit(Request::Connect(address))
    }

    pub fn send_command(&self, command: impl Into<String>) -> bool {
        self.submit(Request::SendCommand(command.into()))
    }

    pub fn send_commands(&self, commands: Vec<String>) -> bool {
        self.submit(Request::SendCommands(commands))
    }

    pub fn capture_screenshot(&self, target: Option<(u32, u32)>) -> bool {
        self.submit(Request::CaptureScreenshot { target })
    }

    pub fn fetch_measurements(&self, configs: Vec<MeasurementConfig>) -> bool {
        self.submit(Request::FetchMeasurements(configs))
    }

    pub fn sync_settings(&self) -> bool {
        self.submit(Request::SyncSettings)
    }

    pub fn export_waveform(&self, channel: Channel, destination: impl Into<PathBuf>) -> bool {
        self.submit(Request::ExportWaveform {
            channel,
            destination: destination.into(),
        })
    }

    pub fn cleanup(&self) -> bool {
        self.submit(Request::Cleanup)
    }

    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn link_state(&self) -> LinkState {
        *self.state.read()
    }

    /// Stop accepting requests, let the worker finish what is queued and
    /// release the instrument, then wait for the thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(requests) = self.requests.take() {
            drop(requests);
            if let Some(thread) = self.thread.take() {
                if thread.join().is_err() {
                    error!("Device worker panicked");
                }
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands;
    use crate::transport::mock::{MockConnector, MockInstrument, MOCK_IDN};
    use image::{DynamicImage, ImageFormat, RgbImage};
    use parking_lot::Mutex;
    use std::io::Cursor;

    const WAIT: Duration = Duration::from_secs(3);

    fn address() -> ResourceAddress {
        ResourceAddress::parse("TCPIP::192.168.1.50::INSTR").unwrap()
    }

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            capture: CaptureSettings {
                capture_timeout: Duration::from_secs(10),
                prepare_delay: Duration::ZERO,
            },
            ..WorkerConfig::default()
        }
    }

    fn spawn(config: WorkerConfig) -> (WorkerHandle, Arc<Mutex<MockInstrument>>) {
        let instrument = MockInstrument::shared();
        let connector = MockConnector {
            state: instrument.clone(),
        };
        let handle = WorkerHandle::spawn_with_connector(config, Box::new(connector)).unwrap();
        (handle, instrument)
    }

    /// Collect events up to and including the first one matching `done`.
    fn collect_until(handle: &WorkerHandle, done: impl Fn(&Event) -> bool) -> Vec<Event> {
        let mut seen = Vec::new();
        loop {
            let event = handle
                .events()
                .recv_timeout(WAIT)
                .unwrap_or_else(|_| panic!("timed out, events so far: {seen:?}"));
            let finished = done(&event);
            seen.push(event);
            if finished {
                return seen;
            }
        }
    }

    fn idle(event: &Event) -> bool {
        matches!(event, Event::BusyState(false))
    }

    fn connected() -> (WorkerHandle, Arc<Mutex<MockInstrument>>) {
        let (handle, instrument) = spawn(test_config());
        assert!(handle.connect(address()));
        let events = collect_until(&handle, |e| matches!(e, Event::Connected { .. }));
        assert!(matches!(
            events.last(),
            Some(Event::Connected { identity }) if identity == MOCK_IDN
        ));
        instrument.lock().sent.clear();
        (handle, instrument)
    }

    fn error_kinds(events: &[Event]) -> Vec<ErrorKind> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Error { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect()
    }

    fn png_response(width: u32, height: u32) -> Vec<u8> {
        let mut out = b"#9000000000".to_vec();
        let mut png = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(width, height))
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();
        out.extend(png);
        out
    }

    #[test]
    fn test_connect_reports_identity() {
        let (handle, _instrument) = connected();
        assert_eq!(handle.link_state(), LinkState::Connected);
        assert!(!handle.is_busy());
    }

    #[test]
    fn test_failed_connect_stays_disconnected() {
        let (handle, instrument) = spawn(test_config());
        instrument.lock().fail_connect = true;

        handle.connect(address());
        let events = collect_until(&handle, |e| matches!(e, Event::Error { .. }));

        assert_eq!(error_kinds(&events), vec![ErrorKind::Transport]);
        assert_eq!(handle.link_state(), LinkState::Disconnected);
    }

    #[test]
    fn test_command_status_is_reported() {
        let (handle, instrument) = connected();
        instrument.lock().reply("*ESR?", "1");

        handle.send_command("TEST_CMD");
        let events = collect_until(&handle, idle);

        assert!(matches!(events.first(), Some(Event::BusyState(true))));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Response(text) if text.contains("Status: 1"))));
        assert!(!handle.is_busy());
    }

    #[test]
    fn test_safety_rejection_keeps_session() {
        let (handle, instrument) = connected();
        instrument.lock().reply("C1:COUPLING?", "D50");

        handle.send_command("C1:VOLT_DIV 10.0");
        let events = collect_until(&handle, idle);

        assert_eq!(error_kinds(&events), vec![ErrorKind::SafetyRejection]);
        assert!(!instrument.lock().was_sent("C1:VOLT_DIV 10.0"));
        assert_eq!(handle.link_state(), LinkState::Connected);
    }

    #[test]
    fn test_batch_reports_each_skipped_command() {
        let (handle, instrument) = connected();
        instrument.lock().reply("C1:COUPLING?", "D50");

        handle.send_commands(vec![
            "C1:OFFSET 9".to_string(),
            "C1:VOLT_DIV 1".to_string(),
            "TRIG_MODE NORM".to_string(),
        ]);
        let events = collect_until(&handle, idle);

        assert_eq!(error_kinds(&events), vec![ErrorKind::SafetyRejection]);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Response(text) if text == "Bulk: 2 sent, 1 skipped | Status: 0"
        )));
    }

    #[test]
    fn test_batch_fault_still_reports_earlier_skips() {
        let (handle, instrument) = connected();
        {
            let mut state = instrument.lock();
            state.reply("C1:COUPLING?", "D50");
            state.fail_write("TRIG_MODE NORM");
        }

        handle.send_commands(vec!["C1:OFFSET 9".to_string(), "TRIG_MODE NORM".to_string()]);
        let events = collect_until(&handle, idle);

        assert_eq!(
            error_kinds(&events),
            vec![ErrorKind::SafetyRejection, ErrorKind::Transport]
        );
        assert!(events.iter().any(|e| matches!(e, Event::Disconnected)));
        assert!(!events.iter().any(|e| matches!(e, Event::Response(_))));
    }

    #[test]
    fn test_second_request_is_rejected_while_busy() {
        let mut config = test_config();
        config.capture.prepare_delay = Duration::from_millis(300);
        let (handle, instrument) = {
            let (handle, instrument) = spawn(config);
            handle.connect(address());
            collect_until(&handle, |e| matches!(e, Event::Connected { .. }));
            (handle, instrument)
        };
        instrument.lock().reply_binary("SCDP", png_response(4, 4));

        assert!(handle.capture_screenshot(None));
        assert!(!handle.send_command("TRIG_MODE AUTO"));

        let events = collect_until(&handle, idle);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Error { kind: ErrorKind::State, message } if message.contains("busy")
        )));
        assert!(events.iter().any(|e| matches!(e, Event::ScreenshotReady(_))));
        assert!(!instrument.lock().was_sent("TRIG_MODE AUTO"));

        // Free again once the capture settled.
        assert!(handle.send_command("TRIG_MODE AUTO"));
        collect_until(&handle, idle);
        assert!(instrument.lock().was_sent("TRIG_MODE AUTO"));
    }

    #[test]
    fn test_transport_fault_disconnects_and_clears_busy() {
        let (handle, instrument) = connected();
        instrument.lock().fail_write("TIME_DIV 1E-3");

        handle.send_command("TIME_DIV 1E-3");
        let events = collect_until(&handle, idle);

        assert_eq!(error_kinds(&events), vec![ErrorKind::Transport]);
        assert!(events.iter().any(|e| matches!(e, Event::Disconnected)));
        assert!(!handle.is_busy());
        assert_eq!(handle.link_state(), LinkState::Disconnected);

        handle.sync_settings();
        let events = collect_until(&handle, |e| matches!(e, Event::Error { .. }));
        assert_eq!(error_kinds(&events), vec![ErrorKind::State]);
        assert!(!handle.is_busy());
    }

    #[test]
    fn test_bad_capture_completes_cycle_without_image() {
        let (handle, instrument) = connected();
        let mut truncated = png_response(8, 8);
        truncated.truncate(truncated.len() - 12);
        instrument.lock().reply_binary("SCDP", truncated);

        handle.capture_screenshot(Some((4, 4)));
        let events = collect_until(&handle, idle);

        assert_eq!(error_kinds(&events), vec![ErrorKind::Framing]);
        assert!(events.iter().any(|e| matches!(e, Event::RefreshCycleComplete)));
        assert!(!events.iter().any(|e| matches!(e, Event::ScreenshotReady(_))));
        assert_eq!(instrument.lock().timeout, test_config().timeout);
        assert_eq!(handle.link_state(), LinkState::Connected);
    }

    #[test]
    fn test_capture_without_session_still_completes_cycle() {
        let (handle, _instrument) = spawn(test_config());

        handle.capture_screenshot(None);
        let events = collect_until(&handle, |e| matches!(e, Event::RefreshCycleComplete));

        assert_eq!(error_kinds(&events), vec![ErrorKind::State]);
        assert!(!handle.is_busy());
    }

    #[test]
    fn test_sync_emits_partial_errors_and_snapshot() {
        let (handle, instrument) = connected();
        {
            let mut state = instrument.lock();
            state.reply("TIME_DIV?", "1E-3");
            state.reply("TRIG_MODE?", "AUTO");
            state.reply("TRIG_SELECT?", "EDGE,SR,LINE,HT,OFF");
        }

        handle.sync_settings();
        let events = collect_until(&handle, idle);

        let kinds = error_kinds(&events);
        assert_eq!(kinds.len(), 24);
        assert!(kinds.iter().all(|k| *k == ErrorKind::PartialResult));
        let snapshot = events
            .iter()
            .find_map(|e| match e {
                Event::SettingsReady(s) => Some(s.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(snapshot.get("TRIG_SRC"), Some("LINE"));
        assert_eq!(handle.link_state(), LinkState::Connected);
    }

    #[test]
    fn test_cleanup_restores_local_control() {
        let (handle, instrument) = connected();

        handle.cleanup();
        collect_until(&handle, |e| matches!(e, Event::Disconnected));

        let state = instrument.lock();
        assert!(state.was_sent(commands::HARDCOPY_PRINT));
        assert!(state.was_sent(commands::GO_TO_LOCAL));
        assert!(state.closed);
        drop(state);
        assert_eq!(handle.link_state(), LinkState::Disconnected);
    }

    #[test]
    fn test_dropping_handle_releases_instrument() {
        let (handle, instrument) = connected();
        drop(handle);

        let state = instrument.lock();
        assert!(state.was_sent(commands::GO_TO_LOCAL));
        assert!(state.closed);
    }
}
