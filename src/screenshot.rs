//! Screen capture over the hardcopy subsystem.
//!
//! The instrument answers `SCDP` with a PNG wrapped in whatever block header
//! the link adds. The image is located by its signature and only accepted
//! when the IEND trailer arrived too.

use crate::commands;
use crate::error::ScopeError;
use crate::session::Session;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use log::{debug, info};
use std::thread;
use std::time::Duration;

pub const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";
/// IEND chunk type and CRC.
pub const PNG_TRAILER: &[u8] = b"IEND\xaeB\x60\x82";
/// The trailer must end within this many bytes of the buffer end.
pub const TRAILER_WINDOW: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    pub capture_timeout: Duration,
    pub prepare_delay: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            capture_timeout: Duration::from_millis(10_000),
            prepare_delay: Duration::from_millis(150),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Screenshot {
    pub image: DynamicImage,
    /// Size of the PNG payload as received.
    pub byte_len: usize,
}

impl Screenshot {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Locate the PNG inside a raw capture response.
pub fn extract_png(raw: &[u8]) -> Result<&[u8], ScopeError> {
    let start = find(raw, PNG_SIGNATURE).ok_or_else(|| {
        ScopeError::Framing(format!("no PNG signature in {} byte response", raw.len()))
    })?;
    let payload = &raw[start..];

    let window_start = payload.len().saturating_sub(TRAILER_WINDOW);
    let trailer = rfind(&payload[window_start..], PNG_TRAILER).ok_or_else(|| {
        ScopeError::Framing(format!(
            "PNG trailer missing, payload of {} bytes is incomplete",
            payload.len()
        ))
    })?;

    Ok(&payload[..window_start + trailer + PNG_TRAILER.len()])
}

/// Decode a PNG payload, optionally fitting it into `target` while keeping
/// the aspect ratio.
pub fn decode(payload: &[u8], target: Option<(u32, u32)>) -> Result<Screenshot, ScopeError> {
    let image = image::load_from_memory_with_format(payload, ImageFormat::Png)?;
    let image = match target {
        Some((width, height)) if width > 0 && height > 0 => {
            image.resize(width, height, FilterType::Triangle)
        }
        _ => image,
    };

    Ok(Screenshot {
        image,
        byte_len: payload.len(),
    })
}

/// Run one capture cycle. The link timeout is widened only for the transfer
/// and is back at its previous value when this returns.
pub fn capture(
    session: &mut Session,
    settings: &CaptureSettings,
    target: Option<(u32, u32)>,
) -> Result<Screenshot, ScopeError> {
    session.write(commands::HARDCOPY_REMOTE)?;
    thread::sleep(settings.prepare_delay);
    session.write(commands::SCREEN_DUMP)?;

    let raw = session.with_timeout(settings.capture_timeout, |s| s.read_raw())?;
    debug!("Capture response: {} bytes", raw.len());

    let payload = extract_png(&raw)?;
    let screenshot = decode(payload, target)?;
    info!(
        "Screenshot {}x{} ({} bytes)",
        screenshot.width(),
        screenshot.height(),
        screenshot.byte_len
    );
    Ok(screenshot)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}
