pub mod commands;
pub mod config;
pub mod error;
pub mod executor;
pub mod logger;
pub mod measurement;
pub mod safety;
pub mod screenshot;
pub mod session;
pub mod settings;
pub mod transport;
pub mod waveform;
pub mod worker;

pub use commands::{Channel, ChannelField, Command};
pub use config::{load_config, load_config_or_default, AppConfig};
pub use error::{ErrorKind, ScopeError};
pub use executor::BatchReport;
pub use logger::{EventLogger, EventRecord};
pub use measurement::{Measurement, MeasurementConfig};
pub use safety::{CouplingMode, SafetyPolicy, SafetyValidator, Verdict};
pub use screenshot::{CaptureSettings, Screenshot};
pub use session::Session;
pub use settings::{SettingsSnapshot, SyncOutcome};
pub use transport::{Connector, NetworkConnector, ResourceAddress, Transport};
pub use worker::{Event, LinkState, Request, WorkerConfig, WorkerHandle};
