use crate::commands;
use crate::error::ScopeError;
use crate::safety::{SafetyValidator, Verdict};
use crate::session::Session;
use log::{debug, info, warn};

/// Validate and write one command, then report the status register.
///
/// Returns the status text `Cmd: <command> | Status: <esr>`. A rejected
/// command is never written and comes back as [`ScopeError::SafetyRejection`].
pub fn execute_one(
    session: &mut Session,
    validator: &SafetyValidator,
    command: &str,
) -> Result<String, ScopeError> {
    let command = command.trim();
    if command.is_empty() {
        return Err(ScopeError::InvalidCommand("empty command".to_string()));
    }

    if let Verdict::Deny(reason) = validator.validate(session, command) {
        warn!("Rejected {command}: {reason}");
        return Err(ScopeError::SafetyRejection(reason));
    }

    session.write(command)?;
    let status = session.query(commands::STATUS_REGISTER)?;
    Ok(format!("Cmd: {command} | Status: {status}"))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub sent: usize,
    /// Commands that were not written, with the reason.
    pub skipped: Vec<(String, String)>,
    pub status: String,
}

impl BatchReport {
    pub fn summary(&self) -> String {
        format!(
            "Bulk: {} sent, {} skipped | Status: {}",
            self.sent,
            self.skipped.len(),
            self.status
        )
    }
}

/// Run a list of commands in order. Rejected entries are skipped and
/// recorded; the remainder still runs. A transport fault aborts the batch.
pub fn execute_batch<S: AsRef<str>>(
    session: &mut Session,
    validator: &SafetyValidator,
    batch: &[S],
) -> Result<BatchReport, ScopeError> {
    let mut report = BatchReport::default();
    report.run(session, validator, batch)?;
    Ok(report)
}

impl BatchReport {
    /// Fill this report from `batch`. On a transport fault the entries
    /// handled so far stay recorded and the fault is returned.
    pub fn run<S: AsRef<str>>(
        &mut self,
        session: &mut Session,
        validator: &SafetyValidator,
        batch: &[S],
    ) -> Result<(), ScopeError> {
        for command in batch.iter().map(|c| c.as_ref().trim()) {
            if command.is_empty() {
                debug!("Ignoring blank batch entry");
                continue;
            }

            match validator.validate(session, command) {
                Verdict::Allow => {
                    session.write(command)?;
                    self.sent += 1;
                }
                Verdict::Deny(reason) => {
                    warn!("Skipping {command}: {reason}");
                    self.skipped.push((command.to_string(), reason));
                }
            }
        }

        self.status = session.query(commands::STATUS_REGISTER)?;
        info!("{}", self.summary());
        Ok(())
    }
}
