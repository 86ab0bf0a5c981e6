use crate::error::ScopeError;
use crate::session::Session;
use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Number of measurement parameter slots (`P1`..`P12`).
pub const PARAMETER_SLOTS: u8 = 12;

fn default_p_index() -> u8 {
    1
}

/// One measurement slot to configure and read back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementConfig {
    #[serde(default = "default_p_index")]
    pub p_index: u8,
    pub source: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl MeasurementConfig {
    pub fn new(p_index: u8, source: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            p_index,
            source: source.into(),
            kind: kind.into(),
        }
    }

    /// Parse `SOURCE:TYPE[@P]`, e.g. `C1:Frequency@2`.
    pub fn parse_spec(spec: &str) -> Result<Self, ScopeError> {
        let (body, p_index) = match spec.rsplit_once('@') {
            Some((body, index)) => {
                let index = index.trim().parse::<u8>().map_err(|_| {
                    ScopeError::InvalidCommand(format!("bad parameter slot in '{spec}'"))
                })?;
                (body, index)
            }
            None => (spec, default_p_index()),
        };
        let (source, kind) = body.split_once(':').ok_or_else(|| {
            ScopeError::InvalidCommand(format!("expected SOURCE:TYPE, got '{spec}'"))
        })?;

        let config = Self::new(p_index, source.trim(), kind.trim());
        config.check()?;
        Ok(config)
    }

    /// The values end up inside quoted VBS strings and must not break out.
    pub fn check(&self) -> Result<(), ScopeError> {
        if !(1..=PARAMETER_SLOTS).contains(&self.p_index) {
            return Err(ScopeError::InvalidCommand(format!(
                "parameter slot P{} outside P1..P{PARAMETER_SLOTS}",
                self.p_index
            )));
        }
        for (name, value) in [("source", &self.source), ("type", &self.kind)] {
            if value.is_empty() || value.contains(['"', '\'']) {
                return Err(ScopeError::InvalidCommand(format!(
                    "invalid measurement {name} '{value}'"
                )));
            }
        }
        Ok(())
    }

    pub fn parameter(&self) -> String {
        format!("P{}", self.p_index)
    }

    fn setup_commands(&self) -> [String; 3] {
        let p = self.p_index;
        [
            format!(r#"VBS 'app.Measure.P{p}.Source = "{}"'"#, self.source),
            format!(r#"VBS 'app.Measure.P{p}.ParamEngine = "{}"'"#, self.kind),
            format!("VBS 'app.Measure.P{p}.View = True'"),
        ]
    }

    fn result_query(&self) -> String {
        format!(r#"VBS? "Return=app.Measure.P{}.Out.Result.Value""#, self.p_index)
    }
}

/// Read-back of one configured measurement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    pub p: String,
    pub source: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

/// Configure every slot and read its value. All or nothing: the first
/// failure ends the pass.
pub fn fetch(
    session: &mut Session,
    configs: &[MeasurementConfig],
) -> Result<Vec<Measurement>, ScopeError> {
    for config in configs {
        config.check()?;
    }

    let mut results = Vec::with_capacity(configs.len());
    for config in configs {
        for command in config.setup_commands() {
            session.write(&command)?;
        }
        let value = session.query(&config.result_query())?;
        debug!("{} {} on {} = {value}", config.parameter(), config.kind, config.source);

        results.push(Measurement {
            p: config.parameter(),
            source: config.source.clone(),
            kind: config.kind.clone(),
            value,
        });
    }

    info!("Read {} measurements", results.len());
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::connected_session;

    #[test]
    fn test_parse_spec() {
        let config = MeasurementConfig::parse_spec("C1:Frequency@2").unwrap();
        assert_eq!(config, MeasurementConfig::new(2, "C1", "Frequency"));

        let config = MeasurementConfig::parse_spec("C3:Amplitude").unwrap();
        assert_eq!(config.p_index, 1);

        assert!(MeasurementConfig::parse_spec("Frequency").is_err());
        assert!(MeasurementConfig::parse_spec("C1:Freq@13").is_err());
        assert!(MeasurementConfig::parse_spec(r#"C1:Freq"uency"#).is_err());
    }

    #[test]
    fn test_config_json_uses_type_key() {
        let config: MeasurementConfig =
            serde_json::from_str(r#"{"source": "C2", "type": "Mean"}"#).unwrap();
        assert_eq!(config, MeasurementConfig::new(1, "C2", "Mean"));
    }

    #[test]
    fn test_fetch_configures_then_reads() {
        let (mut session, instrument) = connected_session();
        instrument
            .lock()
            .reply(r#"VBS? "Return=app.Measure.P2.Out.Result.Value""#, " 1.0002E+03 ");

        let results =
            fetch(&mut session, &[MeasurementConfig::new(2, "C1", "Frequency")]).unwrap();

        assert_eq!(
            results,
            vec![Measurement {
                p: "P2".to_string(),
                source: "C1".to_string(),
                kind: "Frequency".to_string(),
                value: "1.0002E+03".to_string(),
            }]
        );
        assert_eq!(
            instrument.lock().sent,
            vec![
                r#"VBS 'app.Measure.P2.Source = "C1"'"#,
                r#"VBS 'app.Measure.P2.ParamEngine = "Frequency"'"#,
                "VBS 'app.Measure.P2.View = True'",
                r#"VBS? "Return=app.Measure.P2.Out.Result.Value""#,
            ]
        );
    }

    #[test]
    fn test_fetch_fails_as_a_whole() {
        let (mut session, _instrument) = connected_session();
        let configs = [
            MeasurementConfig::new(1, "C1", "Frequency"),
            MeasurementConfig::new(2, "C2", "Amplitude"),
        ];
        assert!(fetch(&mut session, &configs).unwrap_err().is_transport());
    }
}
