use crate::error::{ErrorKind, ScopeError};
use crate::worker::Event;
use chrono::{DateTime, Local};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// One line of the session log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub timestamp: DateTime<Local>,
    pub event: String,
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    pub message: String,
}

impl EventRecord {
    pub fn from_event(event: &Event) -> Self {
        let (level, kind) = match event {
            Event::Error { kind, .. } => ("ERROR", Some(*kind)),
            Event::BusyState(_) | Event::RefreshCycleComplete => ("DEBUG", None),
            _ => ("INFO", None),
        };
        Self {
            timestamp: Local::now(),
            event: event.name().to_string(),
            level: level.to_string(),
            kind,
            message: event.summary(),
        }
    }
}

/// Buffered JSON-lines log of worker events.
#[derive(Debug)]
pub struct EventLogger {
    buffer: Vec<EventRecord>,
    buffer_size: usize,
    file_path: PathBuf,
    flush_failures: usize,
    max_flush_failures: usize,
}

impl EventLogger {
    pub fn new<P: Into<PathBuf>>(file_path: P, buffer_size: usize) -> Self {
        let mut path = file_path.into();
        if path.extension() != Some(std::ffi::OsStr::new("jsonl")) {
            path.set_extension("jsonl");
        }

        Self {
            buffer: Vec::with_capacity(buffer_size),
            buffer_size: buffer_size.max(1),
            file_path: path,
            flush_failures: 0,
            max_flush_failures: 10,
        }
    }

    /// Logger writing to `session_YYYYMMDD_HHMMSS.jsonl` inside `dir`,
    /// creating the directory if needed.
    pub fn for_session(dir: &Path, buffer_size: usize) -> Result<Self, ScopeError> {
        std::fs::create_dir_all(dir).map_err(|source| ScopeError::File {
            source,
            context: format!("Creating log directory {}", dir.display()),
        })?;
        let name = format!("session_{}.jsonl", Local::now().format("%Y%m%d_%H%M%S"));
        let logger = Self::new(dir.join(name), buffer_size);
        info!("Event log: {}", logger.path().display());
        Ok(logger)
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub fn record(&mut self, event: &Event) -> Result<(), ScopeError> {
        self.add(EventRecord::from_event(event))
    }

    pub fn add(&mut self, record: EventRecord) -> Result<(), ScopeError> {
        self.buffer.push(record);

        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }

        Ok(())
    }

    /// Append the buffer to the file. Failures are tolerated and the records
    /// kept until `max_flush_failures` consecutive attempts failed.
    pub fn flush(&mut self) -> Result<(), ScopeError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        match self.write_buffer() {
            Ok(()) => {
                debug!("Flushed {} events to {:?}", self.buffer.len(), self.file_path);
                self.flush_failures = 0;
                self.buffer.clear();
                Ok(())
            }
            Err(e) => {
                self.flush_failures += 1;
                log::error!(
                    "Flush failure {}/{}: {}",
                    self.flush_failures,
                    self.max_flush_failures,
                    e
                );

                if self.flush_failures % 3 == 0 {
                    log::warn!(
                        "Experiencing intermittent flush failures ({}/{})",
                        self.flush_failures,
                        self.max_flush_failures
                    );
                }

                if self.flush_failures >= self.max_flush_failures {
                    return Err(ScopeError::File {
                        source: std::io::Error::other(e.to_string()),
                        context: format!(
                            "Too many consecutive flush failures ({}) for {:?}",
                            self.max_flush_failures, self.file_path
                        ),
                    });
                }

                Ok(())
            }
        }
    }

    fn write_buffer(&self) -> Result<(), ScopeError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .map_err(|source| ScopeError::File {
                source,
                context: format!("Opening event log {:?}", self.file_path),
            })?;

        let mut writer = std::io::BufWriter::new(file);
        for record in &self.buffer {
            let line = serde_json::to_string(record)?;
            writeln!(writer, "{}", line).map_err(|source| ScopeError::File {
                source,
                context: "Writing event log".to_string(),
            })?;
        }
        writer.flush().map_err(|source| ScopeError::File {
            source,
            context: "Flushing event log".to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn flush_failures(&self) -> usize {
        self.flush_failures
    }
}

impl Drop for EventLogger {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
