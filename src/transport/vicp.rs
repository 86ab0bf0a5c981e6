//! LeCroy VICP link.
//!
//! Every message is preceded by an 8 byte header:
//!
//! | byte | meaning                                   |
//! |------|-------------------------------------------|
//! | 0    | operation flags (DATA, REMOTE, CLEAR, EOI) |
//! | 1    | header version, always 1                  |
//! | 2    | sequence number, 1..=255                  |
//! | 3    | spare                                     |
//! | 4-7  | payload length, big endian                |
//!
//! A response may span several DATA blocks; the last one carries EOI.

use super::{apply_stream_timeout, Transport, MAX_RESPONSE_SIZE};
use crate::error::ScopeError;
use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

pub const VICP_PORT: u16 = 1861;
pub const HEADER_SIZE: usize = 8;
pub const HEADER_VERSION: u8 = 1;
/// How long a device clear waits for stale replies still on the wire.
pub const CLEAR_DRAIN_WINDOW: Duration = Duration::from_millis(100);

pub const OP_DATA: u8 = 0x80;
pub const OP_REMOTE: u8 = 0x40;
pub const OP_LOCKOUT: u8 = 0x20;
pub const OP_CLEAR: u8 = 0x10;
pub const OP_SRQ: u8 = 0x08;
pub const OP_EOI: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VicpHeader {
    pub operation: u8,
    pub sequence: u8,
    pub length: u32,
}

impl VicpHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.operation;
        buf[1] = HEADER_VERSION;
        buf[2] = self.sequence;
        BigEndian::write_u32(&mut buf[4..8], self.length);
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self, ScopeError> {
        if buf[1] != HEADER_VERSION {
            return Err(ScopeError::Protocol(format!(
                "Unsupported VICP header version {}",
                buf[1]
            )));
        }
        Ok(Self {
            operation: buf[0],
            sequence: buf[2],
            length: BigEndian::read_u32(&buf[4..8]),
        })
    }

    pub fn has(&self, flag: u8) -> bool {
        self.operation & flag != 0
    }
}

/// Write one complete VICP message (single DATA|EOI block).
pub fn write_message<W: Write>(writer: &mut W, sequence: u8, payload: &[u8]) -> Result<(), ScopeError> {
    let length = u32::try_from(payload.len())
        .map_err(|_| ScopeError::InvalidCommand("message too large for VICP".to_string()))?;
    let header = VicpHeader {
        operation: OP_DATA | OP_REMOTE | OP_EOI,
        sequence,
        length,
    };

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(payload);

    writer
        .write_all(&frame)
        .map_err(|e| ScopeError::link(e, "Writing VICP message"))?;
    writer
        .flush()
        .map_err(|e| ScopeError::link(e, "Flushing VICP message"))
}

/// Read blocks until one carries EOI, concatenating DATA payloads.
pub fn read_message<R: Read>(reader: &mut R, max_size: usize) -> Result<Vec<u8>, ScopeError> {
    let mut message = Vec::new();

    loop {
        let mut raw = [0u8; HEADER_SIZE];
        reader
            .read_exact(&mut raw)
            .map_err(|e| ScopeError::link(e, "Reading VICP header"))?;
        let header = VicpHeader::decode(&raw)?;
        trace!("VICP block: {header:?}");

        let length = header.length as usize;
        if message.len() + length > max_size {
            return Err(ScopeError::Protocol(format!(
                "VICP response exceeds {max_size} bytes"
            )));
        }

        let mut block = vec![0u8; length];
        reader
            .read_exact(&mut block)
            .map_err(|e| ScopeError::link(e, "Reading VICP block"))?;

        if header.has(OP_DATA) {
            message.extend_from_slice(&block);
        } else if header.has(OP_SRQ) {
            debug!("Ignoring SRQ block ({} bytes)", block.len());
        }

        if header.has(OP_EOI) {
            return Ok(message);
        }
    }
}

pub struct VicpTransport {
    stream: TcpStream,
    sequence: u8,
    timeout: Duration,
}

impl VicpTransport {
    pub fn new(stream: TcpStream, timeout: Duration) -> Result<Self, ScopeError> {
        apply_stream_timeout(&stream, timeout)?;
        Ok(Self {
            stream,
            sequence: 0,
            timeout,
        })
    }

    fn next_sequence(&mut self) -> u8 {
        self.sequence = self.sequence % 255 + 1;
        self.sequence
    }

    /// Read and drop whatever the instrument already queued on the link,
    /// waiting at most [`CLEAR_DRAIN_WINDOW`] for more.
    fn discard_pending(&mut self) -> Result<usize, ScopeError> {
        apply_stream_timeout(&self.stream, CLEAR_DRAIN_WINDOW)?;

        let mut dropped = 0;
        let mut buf = [0u8; 4096];
        let drained = loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    break Err(ScopeError::Io {
                        source: std::io::ErrorKind::UnexpectedEof.into(),
                        context: "VICP link closed during device clear".to_string(),
                    });
                }
                Ok(n) => dropped += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                    ) =>
                {
                    break Ok(dropped);
                }
                Err(e) => break Err(ScopeError::link(e, "Draining VICP input")),
            }
        };

        apply_stream_timeout(&self.stream, self.timeout)?;
        drained
    }
}

impl Transport for VicpTransport {
    fn write(&mut self, data: &[u8]) -> Result<(), ScopeError> {
        let sequence = self.next_sequence();
        write_message(&mut self.stream, sequence, data)
    }

    fn read_raw(&mut self) -> Result<Vec<u8>, ScopeError> {
        read_message(&mut self.stream, MAX_RESPONSE_SIZE)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), ScopeError> {
        apply_stream_timeout(&self.stream, timeout)?;
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear(&mut self) -> Result<(), ScopeError> {
        let header = VicpHeader {
            operation: OP_CLEAR,
            sequence: self.next_sequence(),
            length: 0,
        };
        self.stream
            .write_all(&header.encode())
            .map_err(|e| ScopeError::link(e, "Sending VICP device clear"))?;

        let dropped = self.discard_pending()?;
        if dropped > 0 {
            debug!("Device clear dropped {dropped} stale bytes");
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), ScopeError> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(ScopeError::link(e, "Closing VICP link")),
        }
    }
}
