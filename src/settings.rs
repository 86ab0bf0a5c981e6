//! Settings snapshot: a best-effort read of the front panel state.

use crate::commands::{self, strip_echo, Channel, ChannelField};
use crate::error::ScopeError;
use crate::session::Session;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const KEY_TIME_DIV: &str = "TIME_DIV";
pub const KEY_TRIG_MODE: &str = "TRIG_MODE";
pub const KEY_TRIG_TYPE: &str = "TRIG_TYPE";
pub const KEY_TRIG_SRC: &str = "TRIG_SRC";
pub const KEY_TRIG_LVL: &str = "TRIG_LVL";
pub const KEY_TRIG_SLOPE: &str = "TRIG_SLOPE";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub trace: Option<String>,
    pub volt_div: Option<String>,
    pub offset: Option<String>,
    pub coupling: Option<String>,
    pub bandwidth_limit: Option<String>,
    pub invert: Option<String>,
}

impl ChannelSettings {
    fn slot(&mut self, field: ChannelField) -> Option<&mut Option<String>> {
        match field {
            ChannelField::Trace => Some(&mut self.trace),
            ChannelField::VoltDiv => Some(&mut self.volt_div),
            ChannelField::Offset => Some(&mut self.offset),
            ChannelField::Coupling => Some(&mut self.coupling),
            ChannelField::BandwidthLimit => Some(&mut self.bandwidth_limit),
            ChannelField::Invert => Some(&mut self.invert),
            ChannelField::TriggerLevel | ChannelField::TriggerSlope => None,
        }
    }

    pub fn get(&self, field: ChannelField) -> Option<&str> {
        match field {
            ChannelField::Trace => self.trace.as_deref(),
            ChannelField::VoltDiv => self.volt_div.as_deref(),
            ChannelField::Offset => self.offset.as_deref(),
            ChannelField::Coupling => self.coupling.as_deref(),
            ChannelField::BandwidthLimit => self.bandwidth_limit.as_deref(),
            ChannelField::Invert => self.invert.as_deref(),
            ChannelField::TriggerLevel | ChannelField::TriggerSlope => None,
        }
    }
}

/// Raw register values read from the instrument. Registers without a
/// dedicated field land in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsSnapshot {
    pub time_div: Option<String>,
    pub channels: [ChannelSettings; 4],
    pub trigger_mode: Option<String>,
    pub trigger_type: Option<String>,
    pub trigger_source: Option<String>,
    pub trigger_level: Option<String>,
    pub trigger_slope: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl SettingsSnapshot {
    /// Store `value` under a register key such as `C1:VOLT_DIV` or `TRIG_MODE`.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        let slot = match key {
            KEY_TIME_DIV => Some(&mut self.time_div),
            KEY_TRIG_MODE => Some(&mut self.trigger_mode),
            KEY_TRIG_TYPE => Some(&mut self.trigger_type),
            KEY_TRIG_SRC => Some(&mut self.trigger_source),
            KEY_TRIG_LVL => Some(&mut self.trigger_level),
            KEY_TRIG_SLOPE => Some(&mut self.trigger_slope),
            _ => match channel_key(key) {
                Some((channel, field)) => self.channels[channel.index()].slot(field),
                None => None,
            },
        };

        match slot {
            Some(slot) => *slot = Some(value),
            None => {
                self.extra.insert(key.to_string(), value);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        match key {
            KEY_TIME_DIV => self.time_div.as_deref(),
            KEY_TRIG_MODE => self.trigger_mode.as_deref(),
            KEY_TRIG_TYPE => self.trigger_type.as_deref(),
            KEY_TRIG_SRC => self.trigger_source.as_deref(),
            KEY_TRIG_LVL => self.trigger_level.as_deref(),
            KEY_TRIG_SLOPE => self.trigger_slope.as_deref(),
            _ => channel_key(key)
                .and_then(|(channel, field)| self.channels[channel.index()].get(field))
                .or_else(|| self.extra.get(key).map(String::as_str)),
        }
    }

    /// All populated registers as `(key, value)` pairs.
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let mut push = |key: String, value: Option<&str>| {
            if let Some(value) = value {
                out.push((key, value.to_string()));
            }
        };

        push(KEY_TIME_DIV.to_string(), self.time_div.as_deref());
        for channel in Channel::ALL {
            let settings = &self.channels[channel.index()];
            for field in ChannelField::POLLED {
                push(format!("{channel}:{}", field.header()), settings.get(field));
            }
        }
        push(KEY_TRIG_MODE.to_string(), self.trigger_mode.as_deref());
        push(KEY_TRIG_TYPE.to_string(), self.trigger_type.as_deref());
        push(KEY_TRIG_SRC.to_string(), self.trigger_source.as_deref());
        push(KEY_TRIG_LVL.to_string(), self.trigger_level.as_deref());
        push(KEY_TRIG_SLOPE.to_string(), self.trigger_slope.as_deref());

        out.extend(self.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        out
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Setter commands that put an instrument into this state.
    ///
    /// Coupling is written before volts/division and offset so the impedance
    /// check sees the termination the scale is meant for.
    pub fn to_commands(&self) -> Vec<String> {
        let mut out = Vec::new();

        if let Some(value) = &self.time_div {
            out.push(format!("{} {value}", commands::TIMEBASE));
        }

        for channel in Channel::ALL {
            let settings = &self.channels[channel.index()];
            for field in [
                ChannelField::Trace,
                ChannelField::Coupling,
                ChannelField::VoltDiv,
                ChannelField::Offset,
                ChannelField::BandwidthLimit,
                ChannelField::Invert,
            ] {
                if let Some(value) = settings.get(field) {
                    out.push(channel.set(field, value));
                }
            }
        }

        if let Some(mode) = &self.trigger_mode {
            out.push(format!("{} {mode}", commands::TRIGGER_MODE));
        }

        if let (Some(kind), Some(source)) = (&self.trigger_type, &self.trigger_source) {
            out.push(format!("{} {kind},SR,{source}", commands::TRIGGER_SELECT));
        }

        if let Some(channel) = self.trigger_source.as_deref().and_then(Channel::parse) {
            if let Some(level) = &self.trigger_level {
                out.push(channel.set(ChannelField::TriggerLevel, level));
            }
            if let Some(slope) = &self.trigger_slope {
                out.push(channel.set(ChannelField::TriggerSlope, slope));
            }
        }

        out.extend(self.extra.iter().map(|(k, v)| format!("{k} {v}")));
        out
    }
}

fn channel_key(key: &str) -> Option<(Channel, ChannelField)> {
    let (prefix, header) = key.split_once(':')?;
    Some((Channel::parse(prefix)?, ChannelField::from_header(header)?))
}

/// Result of one sync pass: whatever could be read, plus one error per
/// register that could not.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub snapshot: SettingsSnapshot,
    pub failures: Vec<ScopeError>,
}

struct Poll<'s> {
    session: &'s mut Session,
    outcome: SyncOutcome,
}

impl Poll<'_> {
    fn read(&mut self, key: &str, query: &str) -> Option<String> {
        match self.session.query(query) {
            Ok(response) => {
                let value = strip_echo(&response).to_string();
                debug!("{key} = {value}");
                Some(value)
            }
            Err(e) => {
                warn!("Reading {key} failed: {e}");
                let timed_out = matches!(e, ScopeError::Timeout(_));
                self.outcome.failures.push(ScopeError::partial(key, e));
                if timed_out {
                    self.resync(key);
                }
                None
            }
        }
    }

    /// A late answer to a timed-out query would be taken as the reply to
    /// the next one, so the link is cleared before polling on.
    fn resync(&mut self, key: &str) {
        if let Err(e) = self.session.clear() {
            warn!("Device clear after {key} failed: {e}");
            self.outcome
                .failures
                .push(ScopeError::partial(format!("clear after {key}"), e));
        }
    }

    fn store(&mut self, key: &str, query: &str) -> Option<String> {
        let value = self.read(key, query)?;
        self.outcome.snapshot.set(key, value.clone());
        Some(value)
    }
}

/// Poll timebase, the four channels and the trigger. A failed register is
/// recorded and the pass carries on with the next one.
pub fn sync(session: &mut Session) -> SyncOutcome {
    let mut poll = Poll {
        session,
        outcome: SyncOutcome::default(),
    };

    poll.store(KEY_TIME_DIV, &format!("{}?", commands::TIMEBASE));

    for channel in Channel::ALL {
        for field in ChannelField::POLLED {
            let key = format!("{channel}:{}", field.header());
            poll.store(&key, &channel.query(field));
        }
    }

    poll.store(KEY_TRIG_MODE, &format!("{}?", commands::TRIGGER_MODE));

    let mut trigger_channel = None;
    if let Some(select) = poll.read(commands::TRIGGER_SELECT, &format!("{}?", commands::TRIGGER_SELECT)) {
        let parts: Vec<&str> = select.split(',').map(str::trim).collect();
        match (parts.first(), parts.get(2)) {
            (Some(kind), Some(source)) if !kind.is_empty() => {
                poll.outcome.snapshot.set(KEY_TRIG_TYPE, *kind);
                poll.outcome.snapshot.set(KEY_TRIG_SRC, *source);
                trigger_channel = Channel::parse(source);
            }
            _ => poll.outcome.failures.push(ScopeError::partial(
                commands::TRIGGER_SELECT,
                ScopeError::Protocol(format!("cannot split trigger select '{select}'")),
            )),
        }
    }

    match trigger_channel {
        Some(channel) => {
            poll.store(KEY_TRIG_LVL, &channel.query(ChannelField::TriggerLevel));
            poll.store(KEY_TRIG_SLOPE, &channel.query(ChannelField::TriggerSlope));
        }
        None => debug!("Trigger source is not a channel, level not polled"),
    }

    let outcome = poll.outcome;
    info!(
        "Settings sync: {} registers, {} failures",
        outcome.snapshot.len(),
        outcome.failures.len()
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::connected_session;

    #[test]
    fn test_keys_map_to_fields() {
        let mut snapshot = SettingsSnapshot::default();
        snapshot.set("C2:VOLT_DIV", "0.5");
        snapshot.set("TRIG_LVL", "0.1");
        snapshot.set("MEMORY_SIZE", "10K");

        assert_eq!(snapshot.channels[1].volt_div.as_deref(), Some("0.5"));
        assert_eq!(snapshot.get("C2:VDIV"), Some("0.5"));
        assert_eq!(snapshot.trigger_level.as_deref(), Some("0.1"));
        assert_eq!(snapshot.get("MEMORY_SIZE"), Some("10K"));
        assert_eq!(snapshot.len(), 3);
    }

    #[test]
    fn test_full_sync_reads_trigger_level_for_channel_source() {
        let (mut session, instrument) = connected_session();
        {
            let mut state = instrument.lock();
            state.reply("TIME_DIV?", "1E-3");
            for channel in Channel::ALL {
                for field in ChannelField::POLLED {
                    state.reply(&channel.query(field), "1");
                }
            }
            state.reply("TRIG_MODE?", "AUTO");
            state.reply("TRIG_SELECT?", "EDGE,SR,C2,HT,OFF");
            state.reply("C2:TRIG_LEVEL?", "0.25");
            state.reply("C2:TRIG_SLOPE?", "POS");
        }

        let outcome = sync(&mut session);

        assert!(outcome.failures.is_empty());
        let snapshot = &outcome.snapshot;
        assert_eq!(snapshot.get(KEY_TRIG_TYPE), Some("EDGE"));
        assert_eq!(snapshot.get(KEY_TRIG_SRC), Some("C2"));
        assert_eq!(snapshot.get(KEY_TRIG_LVL), Some("0.25"));
        assert_eq!(snapshot.get(KEY_TRIG_SLOPE), Some("POS"));
        assert_eq!(snapshot.len(), 1 + 24 + 5);

        let state = instrument.lock();
        assert_eq!(state.sent.first().map(String::as_str), Some("TIME_DIV?"));
        assert_eq!(state.sent.get(1).map(String::as_str), Some("C1:TRACE?"));
    }

    #[test]
    fn test_non_channel_trigger_source_skips_level() {
        let (mut session, instrument) = connected_session();
        instrument.lock().reply("TRIG_SELECT?", "EDGE,SR,EX,HT,OFF");

        let outcome = sync(&mut session);

        assert_eq!(outcome.snapshot.get(KEY_TRIG_SRC), Some("EX"));
        assert!(!instrument
            .lock()
            .sent
            .iter()
            .any(|c| c.contains("TRIG_LEVEL")));
    }

    #[test]
    fn test_failed_fields_do_not_stop_the_pass() {
        let (mut session, instrument) = connected_session();
        {
            let mut state = instrument.lock();
            state.reply("TIME_DIV?", "5E-6");
            state.reply("TRIG_MODE?", "NORM");
        }

        // Every channel query and the trigger select go unanswered.
        let outcome = sync(&mut session);

        assert_eq!(outcome.snapshot.len(), 2);
        assert_eq!(outcome.failures.len(), 24 + 1);
        assert!(outcome
            .failures
            .iter()
            .all(|e| e.kind() == crate::error::ErrorKind::PartialResult));
        assert!(instrument.lock().was_sent("TRIG_SELECT?"));
    }

    #[test]
    fn test_late_answer_is_not_taken_for_the_next_register() {
        let (mut session, instrument) = connected_session();
        {
            let mut state = instrument.lock();
            state.late_reply("TIME_DIV?", "1E-3");
            state.reply("C1:TRACE?", "ON");
        }
        let clears_before = instrument.lock().clears;

        let outcome = sync(&mut session);

        assert_eq!(outcome.snapshot.get(KEY_TIME_DIV), None);
        assert_eq!(outcome.snapshot.get("C1:TRACE"), Some("ON"));
        // One clear per unanswered register.
        assert_eq!(
            instrument.lock().clears - clears_before,
            outcome.failures.len()
        );
    }

    #[test]
    fn test_empty_sync_yields_empty_snapshot() {
        let (mut session, _instrument) = connected_session();
        let outcome = sync(&mut session);
        assert!(outcome.snapshot.is_empty());
    }

    #[test]
    fn test_to_commands_orders_coupling_before_scale() {
        let mut snapshot = SettingsSnapshot::default();
        snapshot.set("TIME_DIV", "1E-3");
        snapshot.set("C1:VOLT_DIV", "2");
        snapshot.set("C1:COUPLING", "D50");
        snapshot.set("TRIG_MODE", "AUTO");
        snapshot.set("TRIG_TYPE", "EDGE");
        snapshot.set("TRIG_SRC", "C1");
        snapshot.set("TRIG_LVL", "0.5");

        assert_eq!(
            snapshot.to_commands(),
            vec![
                "TIME_DIV 1E-3",
                "C1:COUPLING D50",
                "C1:VOLT_DIV 2",
                "TRIG_MODE AUTO",
                "TRIG_SELECT EDGE,SR,C1",
                "C1:TRIG_LEVEL 0.5",
            ]
        );
    }
}
