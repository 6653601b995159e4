use log::debug;
use std::sync::Arc;
use std::time::Duration;

use super::{Command, InstrumentChannel, Query, daq_error, unsupported_command, unsupported_query};
use crate::config::PumpDirection;
use crate::error::ControlError;
use crate::transport::{
    AnalogOut, Daqmx, DigitalOut, LineLink, SerialLine,
    daqmx::{AnalogOutputTask, DigitalOutputTask},
};

/// End-of-text byte closing every syringe pump answer.
const ETX: char = '\u{3}';

/// Pump driven by DAQ lines: an analog rate input and a digital run line.
///
/// The rate line takes 1 V per mL/s; the run line is active-low on the stand.
pub struct DaqPump<A: AnalogOut, D: DigitalOut> {
    rate: A,
    start: D,
    max_volts: f64,
    start_active_low: bool,
    name: String,
}

impl DaqPump<AnalogOutputTask, DigitalOutputTask> {
    pub fn open(
        daqmx: &Arc<Daqmx>,
        start_line: &str,
        rate_line: &str,
        max_volts: f64,
        start_active_low: bool,
        timeout: Duration,
    ) -> Result<Self, ControlError> {
        let rate = daqmx
            .analog_output(rate_line, 0.0, max_volts, timeout)
            .map_err(|e| daq_error("pump", rate_line, e))?;
        let start = daqmx
            .digital_output(start_line, timeout)
            .map_err(|e| daq_error("pump", start_line, e))?;
        let mut pump = Self::new(rate, start, max_volts, start_active_low);
        pump.probe()?;
        Ok(pump)
    }
}

impl<A: AnalogOut, D: DigitalOut> DaqPump<A, D> {
    pub fn new(rate: A, start: D, max_volts: f64, start_active_low: bool) -> Self {
        Self {
            rate,
            start,
            max_volts,
            start_active_low,
            name: "pump".to_string(),
        }
    }

    /// Control voltage for a rate in mL/min.
    pub fn rate_volts(&self, ml_per_min: f64) -> f64 {
        (ml_per_min / 60.0).clamp(0.0, self.max_volts)
    }

    fn set_running(&mut self, running: bool) -> Result<(), ControlError> {
        let level = running != self.start_active_low;
        debug!("{} run line -> {}", self.name, if level { "high" } else { "low" });
        self.start
            .write_level(level)
            .map_err(|e| daq_error(&self.name, "run line", e))
    }
}

impl<A: AnalogOut, D: DigitalOut> InstrumentChannel for DaqPump<A, D> {
    fn name(&self) -> &str {
        &self.name
    }

    /// DAQ lines have no identity; a created task is a live line.
    fn probe(&mut self) -> Result<(), ControlError> {
        Ok(())
    }

    fn write(&mut self, command: Command) -> Result<(), ControlError> {
        match command {
            Command::SetFlowRate(rate) => {
                let volts = self.rate_volts(rate);
                debug!("{} rate line -> {volts:.4} V", self.name);
                self.rate
                    .write_volts(volts)
                    .map_err(|e| daq_error(&self.name, "rate line", e))
            }
            Command::StartFlow => self.set_running(true),
            Command::StopFlow => self.set_running(false),
            other => Err(unsupported_command(&self.name, other)),
        }
    }

    fn read(&mut self, query: Query) -> Result<f64, ControlError> {
        Err(unsupported_query(&self.name, query))
    }
}

/// Serial syringe pump (NE-1000 style command set).
pub struct SyringePump<L: LineLink> {
    link: L,
    name: String,
}

impl SyringePump<SerialLine> {
    /// Open the pump, probe its firmware version and configure the syringe.
    pub fn open(
        port: &str,
        baud_rate: u32,
        diameter_mm: f64,
        direction: PumpDirection,
        timeout: Duration,
    ) -> Result<Self, ControlError> {
        let link = SerialLine::open(port, baud_rate, timeout, "\r")
            .map_err(|e| ControlError::from_io("pump", "open", e))?
            .with_response_terminator(ETX);
        let mut pump = Self::new(link);
        pump.probe()?;
        pump.configure(diameter_mm, direction)?;
        Ok(pump)
    }
}

impl<L: LineLink> SyringePump<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            name: "pump".to_string(),
        }
    }

    /// Syringe diameter, cleared dispense volume and pumping direction.
    pub fn configure(&mut self, diameter_mm: f64, direction: PumpDirection) -> Result<(), ControlError> {
        self.command(&format!("DIA {diameter_mm}"))?;
        self.command("VOL 0")?;
        let direction = match direction {
            PumpDirection::Infuse => "DIR INF",
            PumpDirection::Withdraw => "DIR WDR",
        };
        self.command(direction)?;
        Ok(())
    }

    fn command(&mut self, line: &str) -> Result<String, ControlError> {
        debug!("{} <- {}", self.name, line);
        let answer = self
            .link
            .query(line)
            .map_err(|e| ControlError::from_io(&self.name, line, e))?;
        // Answers look like "<STX>00S?OOR<ETX>"; a '?' marks a rejected command
        if answer.contains('?') {
            return Err(ControlError::Protocol(format!(
                "{} rejected {line}: {}",
                self.name,
                answer.trim_matches(|c: char| c.is_control())
            )));
        }
        Ok(answer)
    }
}

impl<L: LineLink> InstrumentChannel for SyringePump<L> {
    fn name(&self) -> &str {
        &self.name
    }

    fn probe(&mut self) -> Result<(), ControlError> {
        let version = self.command("VER")?;
        debug!(
            "{} firmware {}",
            self.name,
            version.trim_matches(|c: char| c.is_control())
        );
        Ok(())
    }

    fn write(&mut self, command: Command) -> Result<(), ControlError> {
        match command {
            // The pump rejects a zero rate; stopping is the equivalent
            Command::SetFlowRate(rate) if rate <= 0.0 => self.command("STP").map(|_| ()),
            Command::SetFlowRate(rate) => self.command(&format!("RAT {rate} MM")).map(|_| ()),
            Command::StartFlow => self.command("RUN").map(|_| ()),
            Command::StopFlow => self.command("STP").map(|_| ()),
            other => Err(unsupported_command(&self.name, other)),
        }
    }

    fn read(&mut self, query: Query) -> Result<f64, ControlError> {
        Err(unsupported_query(&self.name, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::supply::tests::FakeLink;
    use crate::transport::DaqmxError;

    #[derive(Default)]
    struct FakeAnalogOut {
        written: Vec<f64>,
    }

    impl AnalogOut for FakeAnalogOut {
        fn write_volts(&mut self, volts: f64) -> Result<(), DaqmxError> {
            self.written.push(volts);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeDigitalOut {
        levels: Vec<bool>,
        fail: bool,
    }

    impl DigitalOut for FakeDigitalOut {
        fn write_level(&mut self, high: bool) -> Result<(), DaqmxError> {
            if self.fail {
                return Err(DaqmxError::Status {
                    code: -200088,
                    message: "task invalid".into(),
                });
            }
            self.levels.push(high);
            Ok(())
        }
    }

    fn daq_pump() -> DaqPump<FakeAnalogOut, FakeDigitalOut> {
        DaqPump::new(FakeAnalogOut::default(), FakeDigitalOut::default(), 10.0, true)
    }

    #[test]
    fn rate_is_converted_to_volts() {
        let mut pump = daq_pump();
        pump.write(Command::SetFlowRate(250.0)).unwrap();
        pump.write(Command::SetFlowRate(0.0)).unwrap();
        assert_eq!(pump.rate.written.len(), 2);
        assert!((pump.rate.written[0] - 250.0 / 60.0).abs() < 1e-12);
        assert_eq!(pump.rate.written[1], 0.0);
    }

    #[test]
    fn rate_volts_are_clamped() {
        let pump = daq_pump();
        assert_eq!(pump.rate_volts(2000.0), 10.0);
        assert_eq!(pump.rate_volts(-5.0), 0.0);
    }

    #[test]
    fn run_line_is_active_low() {
        let mut pump = daq_pump();
        pump.write(Command::StartFlow).unwrap();
        pump.write(Command::StopFlow).unwrap();
        assert_eq!(pump.start.levels, vec![false, true]);
    }

    #[test]
    fn active_high_run_line() {
        let mut pump = DaqPump::new(FakeAnalogOut::default(), FakeDigitalOut::default(), 10.0, false);
        pump.write(Command::StartFlow).unwrap();
        assert_eq!(pump.start.levels, vec![true]);
    }

    #[test]
    fn failed_line_write_is_unavailable() {
        let mut pump = daq_pump();
        pump.start.fail = true;
        let err = pump.write(Command::StartFlow).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DeviceUnavailable);
    }

    #[test]
    fn syringe_pump_configuration_sequence() {
        let ok = "\u{2}00S\u{3}";
        let mut pump = SyringePump::new(FakeLink::answering(&[ok, ok, ok, ok]));
        pump.probe().unwrap();
        pump.configure(26.7, PumpDirection::Withdraw).unwrap();
        assert_eq!(pump.link.sent, vec!["VER", "DIA 26.7", "VOL 0", "DIR WDR"]);
    }

    #[test]
    fn syringe_pump_rate_and_run() {
        let ok = "\u{2}00I\u{3}";
        let mut pump = SyringePump::new(FakeLink::answering(&[ok, ok, ok, ok]));
        pump.write(Command::SetFlowRate(250.0)).unwrap();
        pump.write(Command::StartFlow).unwrap();
        pump.write(Command::SetFlowRate(0.0)).unwrap();
        pump.write(Command::StopFlow).unwrap();
        assert_eq!(pump.link.sent, vec!["RAT 250 MM", "RUN", "STP", "STP"]);
    }

    #[test]
    fn syringe_pump_rejection_is_reported() {
        let mut pump = SyringePump::new(FakeLink::answering(&["\u{2}00S?OOR\u{3}"]));
        let err = pump.write(Command::SetFlowRate(9999.0)).unwrap_err();
        assert!(err.to_string().contains("OOR"));
    }
}
