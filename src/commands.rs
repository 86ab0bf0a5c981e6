//! Instrument dialect: the fixed command vocabulary and a light parser for
//! operator-supplied command text.

use crate::error::ScopeError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const IDENTITY: &str = "*IDN?";
pub const HEADERS_OFF: &str = "COMM_HEADER OFF";
pub const STATUS_REGISTER: &str = "*ESR?";
pub const GO_TO_LOCAL: &str = "*GTL";

pub const HARDCOPY_REMOTE: &str = "HCSU DEV, PNG, PORT, REMOTE";
pub const HARDCOPY_PRINT: &str = "HCSU DEV, PNG, PORT, PRINT";
pub const HARDCOPY_AUTOSAVE_OFF: &str = r#"VBS 'app.Hardcopy.AutoSave = "None"'"#;
pub const SCREEN_DUMP: &str = "SCDP";

pub const WAVEFORM_FORMAT: &str = "COMM_FORMAT OFF,WORD,BIN";

pub const TIMEBASE: &str = "TIME_DIV";
pub const TRIGGER_MODE: &str = "TRIG_MODE";
pub const TRIGGER_SELECT: &str = "TRIG_SELECT";

/// Analog input channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    C1,
    C2,
    C3,
    C4,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::C1, Channel::C2, Channel::C3, Channel::C4];

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_uppercase().as_str() {
            "C1" => Some(Channel::C1),
            "C2" => Some(Channel::C2),
            "C3" => Some(Channel::C3),
            "C4" => Some(Channel::C4),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::C1 => "C1",
            Channel::C2 => "C2",
            Channel::C3 => "C3",
            Channel::C4 => "C4",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Channel::C1 => 0,
            Channel::C2 => 1,
            Channel::C3 => 2,
            Channel::C4 => 3,
        }
    }

    pub fn query(&self, field: ChannelField) -> String {
        format!("{}:{}?", self.as_str(), field.header())
    }

    pub fn set(&self, field: ChannelField, value: &str) -> String {
        format!("{}:{} {}", self.as_str(), field.header(), value)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::parse(s).ok_or_else(|| ScopeError::InvalidCommand(format!("unknown channel {s}")))
    }
}

/// Per-channel register addressed as `<channel>:<header>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelField {
    Trace,
    VoltDiv,
    Offset,
    Coupling,
    BandwidthLimit,
    Invert,
    TriggerLevel,
    TriggerSlope,
}

impl ChannelField {
    /// Fields polled for every channel during a settings sync, in order.
    pub const POLLED: [ChannelField; 6] = [
        ChannelField::Trace,
        ChannelField::VoltDiv,
        ChannelField::Offset,
        ChannelField::Coupling,
        ChannelField::BandwidthLimit,
        ChannelField::Invert,
    ];

    pub fn header(&self) -> &'static str {
        match self {
            ChannelField::Trace => "TRACE",
            ChannelField::VoltDiv => "VOLT_DIV",
            ChannelField::Offset => "OFFSET",
            ChannelField::Coupling => "COUPLING",
            ChannelField::BandwidthLimit => "BANDWIDTH_LIMIT",
            ChannelField::Invert => "INVERT",
            ChannelField::TriggerLevel => "TRIG_LEVEL",
            ChannelField::TriggerSlope => "TRIG_SLOPE",
        }
    }

    /// Long and short header forms are both accepted.
    pub fn from_header(header: &str) -> Option<Self> {
        let header = header.trim().trim_end_matches('?').to_ascii_uppercase();
        match header.as_str() {
            "TRACE" | "TRA" => Some(ChannelField::Trace),
            "VOLT_DIV" | "VDIV" => Some(ChannelField::VoltDiv),
            "OFFSET" | "OFST" => Some(ChannelField::Offset),
            "COUPLING" | "CPL" => Some(ChannelField::Coupling),
            "BANDWIDTH_LIMIT" | "BWL" => Some(ChannelField::BandwidthLimit),
            "INVERT" | "INVS" => Some(ChannelField::Invert),
            "TRIG_LEVEL" | "TRLV" => Some(ChannelField::TriggerLevel),
            "TRIG_SLOPE" | "TRSL" => Some(ChannelField::TriggerSlope),
            _ => None,
        }
    }

    /// Fields whose magnitude is limited by the input impedance.
    pub fn is_voltage_sensitive(&self) -> bool {
        matches!(self, ChannelField::VoltDiv | ChannelField::Offset)
    }
}

/// Operator command split into its parts. Nothing is validated here; the
/// parser only locates the prefix, header and parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Command<'a> {
    pub text: &'a str,
    /// Text before the first `:` of the header token, e.g. `C1`.
    pub prefix: Option<&'a str>,
    pub header: &'a str,
    pub parameter: Option<&'a str>,
}

impl<'a> Command<'a> {
    pub fn parse(text: &'a str) -> Self {
        let text = text.trim();
        let (head, parameter) = match text.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, Some(rest.trim()).filter(|p| !p.is_empty())),
            None => (text, None),
        };
        // Root-anchored form `:C1:VOLT_DIV`.
        let head = head.trim_start_matches(':');
        let (prefix, header) = match head.split_once(':') {
            Some((prefix, header)) if !prefix.is_empty() => (Some(prefix), header),
            _ => (None, head),
        };

        Self {
            text,
            prefix,
            header,
            parameter,
        }
    }

    pub fn is_query(&self) -> bool {
        self.header.ends_with('?')
    }

    pub fn channel(&self) -> Option<Channel> {
        self.prefix.and_then(Channel::parse)
    }

    /// Channel register this command addresses, if the header names one.
    pub fn field(&self) -> Option<ChannelField> {
        ChannelField::from_header(self.header)
    }

    /// True when any token of the prefix or header names a voltage-limited
    /// register, even if the command as a whole is malformed.
    pub fn names_voltage_field(&self) -> bool {
        self.prefix
            .into_iter()
            .chain([self.header])
            .flat_map(|part| part.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_')))
            .filter_map(ChannelField::from_header)
            .any(|field| field.is_voltage_sensitive())
    }

    /// First numeric value of the parameter. A trailing `V` unit is accepted;
    /// any other suffix is refused rather than guessed at.
    pub fn numeric_parameter(&self) -> Result<f64, ScopeError> {
        let parameter = self
            .parameter
            .ok_or_else(|| ScopeError::InvalidCommand(format!("{} has no parameter", self.text)))?;
        let token = parameter
            .split(|c: char| c == ',' || c.is_whitespace())
            .next()
            .unwrap_or_default();
        let number = token.strip_suffix(['V', 'v']).unwrap_or(token);

        number
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| {
                ScopeError::InvalidCommand(format!("cannot read a number from '{parameter}'"))
            })
    }
}

/// Program units of a `;` chained command line, e.g.
/// `TRIG_MODE AUTO;C1:VDIV 2` -> `TRIG_MODE AUTO`, `C1:VDIV 2`.
pub fn program_units(text: &str) -> impl Iterator<Item = &str> {
    text.split(';').map(str::trim).filter(|unit| !unit.is_empty())
}

/// Strip the header echo some firmware adds even with headers off, e.g.
/// `C1:CPL D50` -> `D50`.
pub fn strip_echo(response: &str) -> &str {
    let response = response.trim();
    match response.split_once(char::is_whitespace) {
        Some((head, rest)) if head.contains(':') => rest.trim(),
        _ => response,
    }
}
