use chrono::Local;
use clap::{Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use env_logger::Env;
use log::{debug, error, info, warn, LevelFilter};
use rusty_scope::{
    load_config, load_config_or_default, AppConfig, Channel, ErrorKind, Event, EventLogger,
    MeasurementConfig, ResourceAddress, SettingsSnapshot, WorkerConfig, WorkerHandle,
};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Longest wait for the worker to settle one request.
const EVENT_WAIT: Duration = Duration::from_secs(300);

/// Remote control for LeCroy oscilloscopes
#[derive(Parser, Debug)]
#[command(name = "scope-remote")]
#[command(about = "Drive a LeCroy oscilloscope over the network", long_about = None)]
struct Args {
    /// Path to configuration file (defaults to ./scope.toml when present)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Instrument resource, e.g. TCPIP::192.168.1.100::INSTR
    #[arg(short, long, value_name = "RESOURCE", global = true)]
    address: Option<String>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Connect and print the instrument identity
    Idn,
    /// Send one command (voltage settings are checked against the coupling)
    Send { command: String },
    /// Send every line of FILE as one batch (blank and # lines ignored)
    Batch { file: PathBuf },
    /// Capture the screen to a PNG file
    Screenshot {
        #[arg(short, long, value_name = "FILE")]
        out: Option<PathBuf>,
        #[arg(long, requires = "height")]
        width: Option<u32>,
        #[arg(long, requires = "width")]
        height: Option<u32>,
    },
    /// Capture continuously until Ctrl+C or the frame limit
    Live {
        #[arg(short, long)]
        frames: Option<usize>,
    },
    /// Configure and read measurements, each given as SOURCE:TYPE[@P]
    Measure {
        #[arg(required = true, value_name = "SOURCE:TYPE[@P]")]
        specs: Vec<String>,
    },
    /// Read the current settings as JSON
    Sync {
        #[arg(short, long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Push a JSON settings snapshot to the instrument
    Apply { file: PathBuf },
    /// Save the binary waveform of CHANNEL to FILE
    Export { channel: String, file: PathBuf },
    /// Print the default configuration as TOML
    ConfigTemplate,
}

fn main() -> CliResult<()> {
    let args = Args::parse();

    if let CliCommand::ConfigTemplate = args.command {
        print!("{}", AppConfig::default().to_toml()?);
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => load_config(Some(path.as_path()))?,
        None => load_config_or_default(None),
    };

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.log_level.clone());
    initialize_logging(&log_level)?;

    let resource = args
        .address
        .clone()
        .unwrap_or_else(|| config.instrument.resource.clone());
    let address = ResourceAddress::parse(&resource)?;
    log_startup_info(&config, &address);

    let mut client = Client::start(&config)?;
    let identity = client.connect(address)?;
    info!("Instrument: {}", identity);

    let result = run_command(&mut client, &config, &args.command, &identity);
    if let Err(e) = &result {
        error!("✗ {}", e);
    }

    info!("Cleaning up and shutting down...");
    client.finish();
    info!("Cleanup complete");

    result
}

fn run_command(
    client: &mut Client,
    config: &AppConfig,
    command: &CliCommand,
    identity: &str,
) -> CliResult<()> {
    match command {
        CliCommand::Idn => {
            println!("{}", identity);
            Ok(())
        }
        CliCommand::Send { command } => {
            let events = client.request(|w| w.send_command(command.as_str()))?;
            print_responses(&events);
            fail_on_errors(&events)
        }
        CliCommand::Batch { file } => {
            let commands = read_batch_file(file)?;
            info!("Sending {} commands from {}", commands.len(), file.display());
            let events = client.request(|w| w.send_commands(commands))?;
            print_responses(&events);
            fail_on_errors(&events)
        }
        CliCommand::Screenshot { out, width, height } => {
            let target = (*width).zip(*height).or_else(|| config.capture.target());
            let events = client.request(|w| w.capture_screenshot(target))?;
            fail_on_errors(&events)?;

            let path = match out {
                Some(path) => path.clone(),
                None => capture_path(config, None)?,
            };
            save_screenshot(&events, &path)
        }
        CliCommand::Live { frames } => run_live(client, config, *frames),
        CliCommand::Measure { specs } => {
            let configs = specs
                .iter()
                .map(|spec| MeasurementConfig::parse_spec(spec))
                .collect::<Result<Vec<_>, _>>()?;
            let events = client.request(|w| w.fetch_measurements(configs))?;
            fail_on_errors(&events)?;

            for event in &events {
                if let Event::MeasurementReady(results) = event {
                    println!("{}", serde_json::to_string_pretty(results)?);
                }
            }
            Ok(())
        }
        CliCommand::Sync { out } => {
            let events = client.request(|w| w.sync_settings())?;
            let snapshot = events.iter().find_map(|event| match event {
                Event::SettingsReady(snapshot) => Some(snapshot),
                _ => None,
            });

            match snapshot {
                Some(snapshot) => {
                    let json = serde_json::to_string_pretty(snapshot)?;
                    match out {
                        Some(path) => {
                            fs::write(path, json)?;
                            info!("Settings written to {}", path.display());
                        }
                        None => println!("{}", json),
                    }
                }
                None => warn!("Instrument reported no settings"),
            }
            // Individual registers may fail without failing the sync.
            fail_on_link_loss(&events)
        }
        CliCommand::Apply { file } => {
            let text = fs::read_to_string(file)?;
            let snapshot: SettingsSnapshot = serde_json::from_str(&text)?;
            let commands = snapshot.to_commands();
            info!("Applying {} settings from {}", commands.len(), file.display());
            let events = client.request(|w| w.send_commands(commands))?;
            print_responses(&events);
            fail_on_errors(&events)
        }
        CliCommand::Export { channel, file } => {
            let channel: Channel = channel.parse()?;
            let destination = file.clone();
            let events = client.request(|w| w.export_waveform(channel, destination))?;
            print_responses(&events);
            fail_on_errors(&events)
        }
        CliCommand::ConfigTemplate => Ok(()),
    }
}

/// Live view: the next frame is requested only after the previous cycle
/// completed, so requests never overlap.
fn run_live(client: &mut Client, config: &AppConfig, frames: Option<usize>) -> CliResult<()> {
    let shutdown_flag = setup_shutdown_handler()?;
    let interval = Duration::from_millis(config.capture.interval_ms);
    let target = config.capture.target();
    let mut saved = 0usize;
    let mut cycle = 0usize;

    info!("Live view started (Ctrl+C to stop)");
    while !shutdown_flag.load(Ordering::SeqCst) && frames.is_none_or(|limit| cycle < limit) {
        cycle += 1;
        let events = client.request(|w| w.capture_screenshot(target))?;
        fail_on_link_loss(&events)?;

        if events.iter().any(|e| matches!(e, Event::ScreenshotReady(_))) {
            let path = capture_path(config, Some(cycle))?;
            save_screenshot(&events, &path)?;
            saved += 1;
        } else {
            warn!("Frame {} dropped", cycle);
        }

        if !interval.is_zero() {
            thread::sleep(interval);
        }
    }

    if shutdown_flag.load(Ordering::SeqCst) {
        info!("✓ Live view stopped by user after {} frames", saved);
    } else {
        info!("✓ Live view finished, {} of {} frames saved", saved, cycle);
    }
    Ok(())
}

/// Worker handle plus the session event log.
struct Client {
    worker: WorkerHandle,
    logger: Option<EventLogger>,
}

impl Client {
    fn start(config: &AppConfig) -> CliResult<Self> {
        let worker = WorkerHandle::spawn(WorkerConfig::from(config))?;
        let logger = if config.logging.event_log {
            match EventLogger::for_session(Path::new(&config.logging.log_path), 16) {
                Ok(logger) => Some(logger),
                Err(e) => {
                    warn!("Event log disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };
        Ok(Self { worker, logger })
    }

    fn connect(&mut self, address: ResourceAddress) -> CliResult<String> {
        info!("Connecting to {}", address);
        self.worker.connect(address);
        let events = self.collect(|event, _| {
            matches!(event, Event::Connected { .. } | Event::Error { .. })
        })?;

        match events.last() {
            Some(Event::Connected { identity }) => Ok(identity.clone()),
            Some(Event::Error { message, .. }) => Err(message.clone().into()),
            _ => Err("connect did not complete".into()),
        }
    }

    /// Submit one request and gather its events until the worker is idle.
    fn request(&mut self, submit: impl FnOnce(&WorkerHandle) -> bool) -> CliResult<Vec<Event>> {
        if !submit(&self.worker) {
            let events = self.drain();
            return Err(first_error(&events).unwrap_or("request rejected").to_string().into());
        }

        // An operation that started ends with BusyState(false); one refused
        // before starting ends with its error.
        self.collect(|event, started| match event {
            Event::BusyState(false) => true,
            Event::Error { .. } => !started,
            _ => false,
        })
    }

    fn collect(&mut self, done: impl Fn(&Event, bool) -> bool) -> CliResult<Vec<Event>> {
        let mut events = Vec::new();
        let mut started = false;
        loop {
            let event = match self.worker.events().recv_timeout(EVENT_WAIT) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => return Err("timed out waiting for the instrument".into()),
                Err(RecvTimeoutError::Disconnected) => return Err("device worker stopped".into()),
            };
            self.log_event(&event);
            if matches!(event, Event::BusyState(true)) {
                started = true;
            }
            let finished = done(&event, started);
            events.push(event);
            if finished {
                return Ok(events);
            }
        }
    }

    fn drain(&mut self) -> Vec<Event> {
        let events: Vec<Event> = self.worker.events().try_iter().collect();
        for event in &events {
            self.log_event(event);
        }
        events
    }

    fn log_event(&mut self, event: &Event) {
        match event {
            Event::Error { .. } => error!("{}", event.summary()),
            Event::BusyState(_) | Event::RefreshCycleComplete => debug!("{}", event.summary()),
            _ => info!("{}", event.summary()),
        }
        if let Some(logger) = &mut self.logger {
            if let Err(e) = logger.record(event) {
                warn!("Event log disabled: {}", e);
                self.logger = None;
            }
        }
    }

    /// Graceful handoff to local control, then stop the worker.
    fn finish(mut self) {
        if self.worker.cleanup() {
            if let Err(e) = self.collect(|event, _| matches!(event, Event::Disconnected)) {
                warn!("Cleanup did not confirm: {}", e);
            }
        }
        self.drain();
        self.worker.shutdown();
    }
}

fn first_error(events: &[Event]) -> Option<&str> {
    events.iter().find_map(|event| match event {
        Event::Error { message, .. } => Some(message.as_str()),
        _ => None,
    })
}

fn fail_on_errors(events: &[Event]) -> CliResult<()> {
    match first_error(events) {
        Some(message) => Err(message.to_string().into()),
        None => Ok(()),
    }
}

fn fail_on_link_loss(events: &[Event]) -> CliResult<()> {
    let lost = events.iter().any(|event| {
        matches!(event, Event::Disconnected)
            || matches!(event, Event::Error { kind: ErrorKind::State, .. })
    });
    if lost {
        return Err(first_error(events).unwrap_or("instrument disconnected").to_string().into());
    }
    Ok(())
}

fn print_responses(events: &[Event]) {
    for event in events {
        match event {
            Event::Response(text) | Event::ExportFinished(text) => println!("{}", text),
            _ => {}
        }
    }
}

fn save_screenshot(events: &[Event], path: &Path) -> CliResult<()> {
    let shot = events
        .iter()
        .find_map(|event| match event {
            Event::ScreenshotReady(shot) => Some(shot),
            _ => None,
        })
        .ok_or("no screenshot received")?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    shot.image.save(path)?;
    info!(
        "Saved {}x{} capture to {}",
        shot.width(),
        shot.height(),
        path.display()
    );
    Ok(())
}

/// `capture_TIMESTAMP.png`, or `capture_NNN_TIMESTAMP.png` for live frames.
fn capture_path(config: &AppConfig, frame: Option<usize>) -> CliResult<PathBuf> {
    let dir = PathBuf::from(&config.capture.output_dir);
    fs::create_dir_all(&dir)?;
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let name = match frame {
        Some(n) => format!("capture_{:03}_{}.png", n, timestamp),
        None => format!("capture_{}.png", timestamp),
    };
    Ok(dir.join(name))
}

fn read_batch_file(path: &Path) -> CliResult<Vec<String>> {
    let text = fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn log_startup_info(config: &AppConfig, address: &ResourceAddress) {
    info!("=== Rusty Scope Remote ===");
    info!("Instrument: {}", address);
    info!(
        "Timeouts: {} ms default, {} ms capture",
        config.instrument.timeout_ms, config.instrument.capture_timeout_ms
    );
    if config.logging.event_log {
        info!("Event log directory: {}", config.logging.log_path);
    }
}

/// Setup Ctrl+C handler for graceful shutdown
fn setup_shutdown_handler() -> CliResult<Arc<AtomicBool>> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - finishing current frame...");
        shutdown_flag_clone.store(true, Ordering::SeqCst);
    })?;

    Ok(shutdown_flag)
}

fn initialize_logging(log_level: &str) -> CliResult<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    Ok(())
}
