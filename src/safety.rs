//! Impedance guard for vertical scale and offset writes.
//!
//! A channel terminated in 50 ohm cannot take more than a few volts. Before
//! any volts/division or offset write the validator reads the channel's live
//! coupling and refuses values the termination cannot tolerate. When the
//! coupling cannot be read or understood the write is refused.

use crate::commands::{program_units, strip_echo, Channel, ChannelField, Command};
use crate::session::Session;
use log::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouplingMode {
    Dc50,
    Dc1M,
    Ac1M,
    Ground,
}

impl CouplingMode {
    pub fn parse(response: &str) -> Option<Self> {
        match strip_echo(response).to_ascii_uppercase().as_str() {
            "D50" | "DC50" => Some(CouplingMode::Dc50),
            "D1M" | "DC" | "DC1M" => Some(CouplingMode::Dc1M),
            "A1M" | "AC" | "AC1M" => Some(CouplingMode::Ac1M),
            "GND" => Some(CouplingMode::Ground),
            _ => None,
        }
    }

    pub fn is_low_impedance(&self) -> bool {
        matches!(self, CouplingMode::Dc50)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyPolicy {
    /// Largest absolute volts/division or offset accepted in 50 ohm mode.
    pub low_impedance_limit: f64,
}

impl SafetyPolicy {
    pub const DEFAULT: SafetyPolicy = SafetyPolicy {
        low_impedance_limit: 5.0,
    };

    /// Maximum magnitude for `mode`, `None` when unrestricted.
    pub fn limit(&self, mode: CouplingMode) -> Option<f64> {
        mode.is_low_impedance().then_some(self.low_impedance_limit)
    }
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Allow,
    Deny(String),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SafetyValidator {
    policy: SafetyPolicy,
}

impl SafetyValidator {
    pub fn new(policy: SafetyPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    /// True when `command` must go through [`SafetyValidator::validate`].
    pub fn applies_to(command: &Command<'_>) -> bool {
        !command.is_query() && command.names_voltage_field()
    }

    /// Decide whether `text` may be written. Every `;` chained unit is
    /// checked and one refused unit refuses the whole line. A guarded unit
    /// costs a round trip for the coupling of the addressed channel.
    pub fn validate(&self, session: &mut Session, text: &str) -> Verdict {
        for unit in program_units(text) {
            if let Verdict::Deny(reason) = self.validate_unit(session, unit) {
                return Verdict::Deny(reason);
            }
        }
        Verdict::Allow
    }

    fn validate_unit(&self, session: &mut Session, unit: &str) -> Verdict {
        let command = Command::parse(unit);
        if !Self::applies_to(&command) {
            return Verdict::Allow;
        }

        let Some(channel) = command.channel() else {
            return Verdict::Deny(format!(
                "unknown channel '{}' in {}",
                command.prefix.unwrap_or_default(),
                command.text
            ));
        };

        if !command.field().is_some_and(|field| field.is_voltage_sensitive()) {
            return Verdict::Deny(format!("cannot parse header of {}", command.text));
        }

        let value = match command.numeric_parameter() {
            Ok(value) => value,
            Err(e) => return Verdict::Deny(format!("{e}, refusing {}", command.text)),
        };

        let mode = match self.read_coupling(session, channel) {
            Ok(mode) => mode,
            Err(reason) => {
                warn!("Refusing {}: {reason}", command.text);
                return Verdict::Deny(reason);
            }
        };

        match self.policy.limit(mode) {
            Some(limit) if value.abs() > limit => Verdict::Deny(format!(
                "{channel} is in 50 Ohm mode, {} of {value} exceeds the {limit} limit",
                command.header
            )),
            _ => {
                debug!("{} allowed under {mode:?}", command.text);
                Verdict::Allow
            }
        }
    }

    fn read_coupling(&self, session: &mut Session, channel: Channel) -> Result<CouplingMode, String> {
        let response = session
            .query(&channel.query(ChannelField::Coupling))
            .map_err(|e| format!("cannot read {channel} coupling ({e})"))?;
        CouplingMode::parse(&response)
            .ok_or_else(|| format!("unrecognised {channel} coupling '{response}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::connected_session;

    #[test]
    fn test_low_impedance_rejects_large_values_without_writing() {
        let (mut session, instrument) = connected_session();
        instrument.lock().reply("C1:COUPLING?", "D50");
        let validator = SafetyValidator::default();

        let verdict = validator.validate(&mut session, "C1:VOLT_DIV 10.0");
        assert!(matches!(verdict, Verdict::Deny(ref reason) if reason.contains("50 Ohm")));
        assert!(!validator.validate(&mut session, "C1:OFFSET -10").is_allowed());

        assert!(validator.validate(&mut session, "C1:VOLT_DIV 3.0").is_allowed());
        assert!(!instrument.lock().sent.iter().any(|c| c.starts_with("C1:VOLT_DIV")));
    }

    #[test]
    fn test_high_impedance_is_unrestricted() {
        let (mut session, instrument) = connected_session();
        instrument.lock().reply("C2:COUPLING?", "D1M");

        let verdict = SafetyValidator::default().validate(&mut session, "C2:VDIV 10.0");
        assert_eq!(verdict, Verdict::Allow);
    }

    #[test]
    fn test_unreadable_coupling_fails_closed() {
        let (mut session, instrument) = connected_session();
        instrument.lock().fail_query("C3:COUPLING?");
        let validator = SafetyValidator::default();

        assert!(!validator.validate(&mut session, "C3:OFFSET 0.1").is_allowed());

        instrument.lock().reply("C3:COUPLING?", "???");
        assert!(!validator.validate(&mut session, "C3:OFFSET 0.1").is_allowed());
    }

    #[test]
    fn test_unguarded_commands_skip_the_round_trip() {
        let (mut session, instrument) = connected_session();
        let validator = SafetyValidator::default();

        assert!(validator.validate(&mut session, "TIME_DIV 1E-3").is_allowed());
        assert!(validator.validate(&mut session, "C1:VOLT_DIV?").is_allowed());
        assert!(validator.validate(&mut session, "C1:TRACE ON").is_allowed());
        assert!(instrument.lock().sent.is_empty());
    }

    #[test]
    fn test_unparseable_values_are_refused() {
        let (mut session, instrument) = connected_session();
        instrument.lock().reply("C1:COUPLING?", "D1M");
        let validator = SafetyValidator::default();

        assert!(!validator.validate(&mut session, "C1:VOLT_DIV 2mV").is_allowed());
        assert!(!validator.validate(&mut session, "C9:VOLT_DIV 1").is_allowed());
    }

    #[test]
    fn test_every_chained_unit_is_checked() {
        let (mut session, instrument) = connected_session();
        instrument.lock().reply("C1:COUPLING?", "D50");
        let validator = SafetyValidator::default();

        let verdict = validator.validate(&mut session, "TRIG_MODE AUTO;C1:VOLT_DIV 10");
        assert!(matches!(verdict, Verdict::Deny(ref reason) if reason.contains("50 Ohm")));
        assert!(validator.validate(&mut session, "C1:VDIV 2;TRIG_MODE AUTO").is_allowed());
        assert_eq!(instrument.lock().sent_count("C1:COUPLING?"), 2);
    }

    #[test]
    fn test_root_colon_form_is_guarded() {
        let (mut session, instrument) = connected_session();
        instrument.lock().reply("C1:COUPLING?", "D50");
        let validator = SafetyValidator::default();

        assert!(!validator.validate(&mut session, ":C1:VOLT_DIV 10").is_allowed());
        assert!(!validator.validate(&mut session, ":c1:ofst -8").is_allowed());
        assert_eq!(instrument.lock().sent_count("C1:COUPLING?"), 2);
    }

    #[test]
    fn test_malformed_voltage_writes_are_refused() {
        let (mut session, instrument) = connected_session();
        instrument.lock().reply("C1:COUPLING?", "D1M");
        let validator = SafetyValidator::default();

        assert!(!validator.validate(&mut session, "C1:VOLT_DIV,10").is_allowed());
        assert!(!validator.validate(&mut session, "VDIV 10").is_allowed());
        assert!(!validator.validate(&mut session, "C1:OFFSET:X 1").is_allowed());
    }

    #[test]
    fn test_coupling_parse_accepts_echoed_header() {
        assert_eq!(CouplingMode::parse("C1:CPL D50"), Some(CouplingMode::Dc50));
        assert_eq!(CouplingMode::parse("a1m\n"), Some(CouplingMode::Ac1M));
        assert_eq!(CouplingMode::parse("bogus"), None);
    }
}
