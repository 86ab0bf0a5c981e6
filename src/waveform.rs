use crate::commands::{self, Channel};
use crate::error::ScopeError;
use crate::session::Session;
use log::info;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub fn waveform_query(channel: Channel) -> String {
    format!("{channel}:WAVEFORM? DAT1")
}

/// Read the binary waveform of `channel` and write it verbatim to
/// `destination`. Returns the number of bytes written.
///
/// Nothing touches the file unless the whole transfer arrived.
pub fn export(
    session: &mut Session,
    channel: Channel,
    destination: &Path,
    transfer_timeout: Duration,
) -> Result<usize, ScopeError> {
    session.write(commands::WAVEFORM_FORMAT)?;
    session.write(&waveform_query(channel))?;
    let data = session.with_timeout(transfer_timeout, |s| s.read_raw())?;

    fs::write(destination, &data).map_err(|source| ScopeError::File {
        source,
        context: format!("Writing waveform to {}", destination.display()),
    })?;

    info!(
        "Waveform {channel}: {} bytes to {}",
        data.len(),
        destination.display()
    );
    Ok(data.len())
}

/// Operator message for a finished export.
pub fn finished_message(channel: Channel, destination: &Path) -> String {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| destination.display().to_string());
    format!("Waveform {channel} saved to {name}")
}
