//! Plain SCPI socket: newline-terminated messages over TCP.

use super::{apply_stream_timeout, Transport, MAX_RESPONSE_SIZE};
use crate::error::ScopeError;
use log::debug;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

const TERMINATOR: u8 = b'\n';

pub struct SocketTransport {
    reader: BufReader<TcpStream>,
    timeout: Duration,
}

impl SocketTransport {
    pub fn new(stream: TcpStream, timeout: Duration) -> Result<Self, ScopeError> {
        apply_stream_timeout(&stream, timeout)?;
        Ok(Self {
            reader: BufReader::new(stream),
            timeout,
        })
    }
}

/// Read one response. A response that opens with an IEEE 488.2 definite
/// length block (`#<n><len><data>`) is read by length, so binary payloads
/// containing newlines arrive whole; anything else ends at the terminator.
pub fn read_response<R: Read>(
    reader: &mut BufReader<R>,
    max_size: usize,
) -> Result<Vec<u8>, ScopeError> {
    let first = reader
        .fill_buf()
        .map_err(|e| ScopeError::link(e, "Reading response"))?;
    if first.is_empty() {
        return Err(ScopeError::Protocol("connection closed by instrument".to_string()));
    }

    if first[0] != b'#' {
        return read_line(reader, Vec::new(), max_size);
    }

    let mut prefix = [0u8; 2];
    reader
        .read_exact(&mut prefix)
        .map_err(|e| ScopeError::link(e, "Reading block header"))?;
    let digits = match (prefix[1] as char).to_digit(10) {
        Some(0) | None => {
            // Indefinite length block: terminator ends it.
            return read_line(reader, prefix.to_vec(), max_size);
        }
        Some(n) => n as usize,
    };

    let mut length_field = vec![0u8; digits];
    reader
        .read_exact(&mut length_field)
        .map_err(|e| ScopeError::link(e, "Reading block length"))?;
    let length: usize = std::str::from_utf8(&length_field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ScopeError::Protocol("malformed block length".to_string()))?;
    if length > max_size {
        return Err(ScopeError::Protocol(format!(
            "block of {length} bytes exceeds {max_size}"
        )));
    }

    let mut response = Vec::with_capacity(2 + digits + length + 1);
    response.extend_from_slice(&prefix);
    response.extend_from_slice(&length_field);

    let start = response.len();
    response.resize(start + length, 0);
    reader
        .read_exact(&mut response[start..])
        .map_err(|e| ScopeError::link(e, "Reading block data"))?;

    // Swallow a trailing terminator that already arrived with the block.
    if reader.buffer().first() == Some(&TERMINATOR) {
        reader.consume(1);
        response.push(TERMINATOR);
    }

    debug!("Read definite length block of {length} bytes");
    Ok(response)
}

fn read_line<R: BufRead>(reader: &mut R, mut buf: Vec<u8>, max_size: usize) -> Result<Vec<u8>, ScopeError> {
    let mut limited = Read::take(reader, max_size as u64);
    limited
        .read_until(TERMINATOR, &mut buf)
        .map_err(|e| ScopeError::link(e, "Reading response line"))?;
    if buf.last() != Some(&TERMINATOR) {
        return Err(ScopeError::Protocol(
            "response ended without terminator".to_string(),
        ));
    }
    Ok(buf)
}

impl Transport for SocketTransport {
    fn write(&mut self, data: &[u8]) -> Result<(), ScopeError> {
        let stream = self.reader.get_mut();
        stream
            .write_all(data)
            .map_err(|e| ScopeError::link(e, "Writing command"))?;
        if data.last() != Some(&TERMINATOR) {
            stream
                .write_all(&[TERMINATOR])
                .map_err(|e| ScopeError::link(e, "Writing terminator"))?;
        }
        stream
            .flush()
            .map_err(|e| ScopeError::link(e, "Flushing command"))
    }

    fn read_raw(&mut self) -> Result<Vec<u8>, ScopeError> {
        read_response(&mut self.reader, MAX_RESPONSE_SIZE)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), ScopeError> {
        apply_stream_timeout(self.reader.get_ref(), timeout)?;
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear(&mut self) -> Result<(), ScopeError> {
        // No out-of-band clear on a raw socket; drop whatever is buffered.
        let buffered = self.reader.buffer().len();
        self.reader.consume(buffered);
        Ok(())
    }

    fn close(&mut self) -> Result<(), ScopeError> {
        match self.reader.get_ref().shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(ScopeError::link(e, "Closing socket")),
        }
    }
}
