//! Scripted in-memory instrument for tests.

use super::{Connector, ResourceAddress, Transport};
use crate::error::ScopeError;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

pub(crate) const MOCK_IDN: &str = "LECROY,WAVESURFER3024,LCRY0000,9.2.0";

#[derive(Debug, Clone)]
pub(crate) enum MockReply {
    Text(String),
    Binary(Vec<u8>),
    Fail,
    /// Times out, then the answer turns up behind the timeout.
    Late(String),
}

/// Instrument state shared between the test and the transport handed to the
/// code under test.
#[derive(Debug)]
pub(crate) struct MockInstrument {
    /// Every message written, terminator stripped, in order.
    pub sent: Vec<String>,
    pub replies: HashMap<String, MockReply>,
    pub failing_writes: HashSet<String>,
    pending: VecDeque<MockReply>,
    pub timeout: Duration,
    pub timeout_history: Vec<Duration>,
    pub clears: usize,
    pub closed: bool,
    pub fail_connect: bool,
}

impl MockInstrument {
    pub fn shared() -> Arc<Mutex<Self>> {
        let mut instrument = Self {
            sent: Vec::new(),
            replies: HashMap::new(),
            failing_writes: HashSet::new(),
            pending: VecDeque::new(),
            timeout: Duration::from_secs(2),
            timeout_history: Vec::new(),
            clears: 0,
            closed: false,
            fail_connect: false,
        };
        instrument.reply("*IDN?", MOCK_IDN);
        instrument.reply("*ESR?", "0");
        Arc::new(Mutex::new(instrument))
    }

    pub fn reply(&mut self, query: &str, text: &str) {
        self.replies
            .insert(query.to_string(), MockReply::Text(text.to_string()));
    }

    pub fn late_reply(&mut self, query: &str, text: &str) {
        self.replies
            .insert(query.to_string(), MockReply::Late(text.to_string()));
    }

    pub fn reply_binary(&mut self, query: &str, data: Vec<u8>) {
        self.replies.insert(query.to_string(), MockReply::Binary(data));
    }

    /// The query is sent but its response never arrives.
    pub fn fail_query(&mut self, query: &str) {
        self.replies.insert(query.to_string(), MockReply::Fail);
    }

    pub fn fail_write(&mut self, command: &str) {
        self.failing_writes.insert(command.to_string());
    }

    pub fn was_sent(&self, command: &str) -> bool {
        self.sent.iter().any(|c| c == command)
    }

    pub fn sent_count(&self, command: &str) -> usize {
        self.sent.iter().filter(|c| *c == command).count()
    }
}

pub(crate) struct MockTransport {
    pub state: Arc<Mutex<MockInstrument>>,
}

impl MockTransport {
    pub fn new(state: Arc<Mutex<MockInstrument>>) -> Self {
        Self { state }
    }
}

impl Transport for MockTransport {
    fn write(&mut self, data: &[u8]) -> Result<(), ScopeError> {
        let mut state = self.state.lock();
        let text = String::from_utf8_lossy(data).trim_end().to_string();
        state.sent.push(text.clone());

        if state.failing_writes.contains(&text) {
            return Err(ScopeError::Io {
                source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "link down"),
                context: format!("Writing {text}"),
            });
        }

        match state.replies.get(&text).cloned() {
            Some(MockReply::Late(answer)) => {
                state.pending.push_back(MockReply::Fail);
                state.pending.push_back(MockReply::Text(answer));
            }
            Some(reply) => state.pending.push_back(reply),
            None => {}
        }
        Ok(())
    }

    fn read_raw(&mut self) -> Result<Vec<u8>, ScopeError> {
        let mut state = self.state.lock();
        match state.pending.pop_front() {
            Some(MockReply::Text(text)) => Ok(format!("{text}\n").into_bytes()),
            Some(MockReply::Binary(data)) => Ok(data),
            Some(MockReply::Fail | MockReply::Late(_)) | None => {
                Err(ScopeError::Timeout("mock instrument did not answer".to_string()))
            }
        }
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), ScopeError> {
        let mut state = self.state.lock();
        state.timeout = timeout;
        state.timeout_history.push(timeout);
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.state.lock().timeout
    }

    fn clear(&mut self) -> Result<(), ScopeError> {
        let mut state = self.state.lock();
        state.pending.clear();
        state.clears += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), ScopeError> {
        self.state.lock().closed = true;
        Ok(())
    }
}

pub(crate) struct MockConnector {
    pub state: Arc<Mutex<MockInstrument>>,
}

impl Connector for MockConnector {
    fn open(
        &mut self,
        address: &ResourceAddress,
        _timeout: Duration,
    ) -> Result<Box<dyn Transport>, ScopeError> {
        if self.state.lock().fail_connect {
            return Err(ScopeError::Io {
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
                context: format!("Failed to connect to {address}"),
            });
        }
        Ok(Box::new(MockTransport::new(self.state.clone())))
    }
}
