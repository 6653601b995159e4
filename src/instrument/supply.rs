use log::debug;

use super::{Command, InstrumentChannel, Query, unsupported_command, unsupported_query};
use crate::config::SupplyConfig;
use crate::error::ControlError;
use crate::transport::{LineLink, SerialLine};

/// Programmable DC supply speaking `VSET`/`ISET`/`VOUT?`/`IOUT?` lines.
pub struct PowerSupply<L: LineLink> {
    link: L,
    name: String,
}

impl PowerSupply<SerialLine> {
    /// Open the serial line, address the supply through the GPIB bridge if
    /// configured, and probe its identity.
    pub fn open(config: &SupplyConfig) -> Result<Self, ControlError> {
        let timeout = std::time::Duration::from_millis(config.read_timeout_ms);
        let mut link = SerialLine::open(&config.port, config.baud_rate, timeout, &config.terminator)
            .map_err(|e| ControlError::from_io("power supply", "open", e))?;

        if let Some(address) = config.gpib_address {
            for line in ["++mode 1".to_string(), format!("++addr {address}"), "++auto 1".to_string()] {
                link.send(&line)
                    .map_err(|e| ControlError::from_io("power supply", &line, e))?;
            }
        }

        let mut supply = Self::new(link);
        supply.probe()?;
        Ok(supply)
    }
}

impl<L: LineLink> PowerSupply<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            name: "power supply".to_string(),
        }
    }

    fn send(&mut self, line: &str) -> Result<(), ControlError> {
        debug!("{} <- {}", self.name, line);
        self.link
            .send(line)
            .map_err(|e| ControlError::from_io(&self.name, line, e))
    }

    fn query_value(&mut self, line: &str) -> Result<f64, ControlError> {
        let answer = self
            .link
            .query(line)
            .map_err(|e| ControlError::from_io(&self.name, line, e))?;
        parse_numeric(&answer).ok_or_else(|| {
            ControlError::Protocol(format!("{} answered {answer:?} to {line}", self.name))
        })
    }
}

impl<L: LineLink> InstrumentChannel for PowerSupply<L> {
    fn name(&self) -> &str {
        &self.name
    }

    fn probe(&mut self) -> Result<(), ControlError> {
        let identity = self
            .link
            .query("ID?")
            .map_err(|e| ControlError::from_io(&self.name, "ID?", e))?;
        if identity.is_empty() {
            return Err(ControlError::unavailable(&self.name, "empty identity"));
        }
        debug!("{} identifies as {identity}", self.name);
        Ok(())
    }

    fn write(&mut self, command: Command) -> Result<(), ControlError> {
        match command {
            Command::SetVoltage(volts) => self.send(&format!("VSET {volts}")),
            Command::SetCurrent(milliamps) => self.send(&format!("ISET {milliamps} MA")),
            other => Err(unsupported_command(&self.name, other)),
        }
    }

    fn read(&mut self, query: Query) -> Result<f64, ControlError> {
        match query {
            Query::OutputVoltage => self.query_value("VOUT?"),
            Query::OutputCurrent => self.query_value("IOUT?"),
            other => Err(unsupported_query(&self.name, other)),
        }
    }
}

/// Keep only digits and the decimal point, then parse.
///
/// Supply answers carry unit letters and echoes (`"VOUT 10.50V"`).
pub fn parse_numeric(answer: &str) -> Option<f64> {
    let digits: String = answer
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::collections::VecDeque;
    use std::io;

    /// Records sent lines and replays canned answers.
    #[derive(Default)]
    pub(crate) struct FakeLink {
        pub sent: Vec<String>,
        pub answers: VecDeque<String>,
    }

    impl FakeLink {
        pub fn answering(answers: &[&str]) -> Self {
            Self {
                sent: Vec::new(),
                answers: answers.iter().map(|a| a.to_string()).collect(),
            }
        }
    }

    impl LineLink for FakeLink {
        fn send(&mut self, line: &str) -> io::Result<()> {
            self.sent.push(line.to_string());
            Ok(())
        }

        fn query(&mut self, line: &str) -> io::Result<String> {
            self.sent.push(line.to_string());
            self.answers
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "silent"))
        }
    }

    #[test]
    fn strips_units_from_answers() {
        assert_eq!(parse_numeric("10.50V"), Some(10.5));
        assert_eq!(parse_numeric("IOUT 0.123A"), Some(0.123));
        assert_eq!(parse_numeric("ERR"), None);
    }

    #[test]
    fn setpoint_commands_use_supply_syntax() {
        let mut supply = PowerSupply::new(FakeLink::default());
        supply.write(Command::SetVoltage(10.5)).unwrap();
        supply.write(Command::SetCurrent(250.0)).unwrap();
        supply.write(Command::SetVoltage(0.0)).unwrap();
        assert_eq!(supply.link.sent, vec!["VSET 10.5", "ISET 250 MA", "VSET 0"]);
    }

    #[test]
    fn reads_output_values() {
        let mut supply = PowerSupply::new(FakeLink::answering(&["10.02V", "0.25A"]));
        assert_eq!(supply.read(Query::OutputVoltage).unwrap(), 10.02);
        assert_eq!(supply.read(Query::OutputCurrent).unwrap(), 0.25);
        assert_eq!(supply.link.sent, vec!["VOUT?", "IOUT?"]);
    }

    #[test]
    fn silent_supply_times_out() {
        let mut supply = PowerSupply::new(FakeLink::default());
        let err = supply.read(Query::OutputVoltage).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceTimeout);
    }

    #[test]
    fn probe_requires_identity() {
        let mut supply = PowerSupply::new(FakeLink::answering(&["GW GPR-6060D"]));
        supply.probe().unwrap();

        let mut blank = PowerSupply::new(FakeLink::answering(&[""]));
        assert!(blank.probe().is_err());
    }

    #[test]
    fn pump_commands_are_refused() {
        let mut supply = PowerSupply::new(FakeLink::default());
        assert!(supply.write(Command::StartFlow).is_err());
        assert!(supply.link.sent.is_empty());
    }
}
