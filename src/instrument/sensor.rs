use std::sync::Arc;
use std::time::Duration;

use super::{Command, InstrumentChannel, Query, daq_error, unsupported_command, unsupported_query};
use crate::config::SensorConfig;
use crate::error::ControlError;
use crate::transport::{AnalogIn, Daqmx, daqmx::AnalogInputTask};

/// Water resistivity meter read as a raw voltage on a DAQ analog input.
pub struct ResistivityMeter<I: AnalogIn> {
    input: I,
    name: String,
}

impl ResistivityMeter<AnalogInputTask> {
    pub fn open(
        daqmx: &Arc<Daqmx>,
        config: &SensorConfig,
        timeout: Duration,
    ) -> Result<Self, ControlError> {
        let input = daqmx
            .analog_input(&config.input_line, config.min_volts, config.max_volts, timeout)
            .map_err(|e| daq_error("resistivity meter", &config.input_line, e))?;
        let mut meter = Self::new(input);
        meter.probe()?;
        Ok(meter)
    }
}

impl<I: AnalogIn> ResistivityMeter<I> {
    pub fn new(input: I) -> Self {
        Self {
            input,
            name: "resistivity meter".to_string(),
        }
    }
}

impl<I: AnalogIn> InstrumentChannel for ResistivityMeter<I> {
    fn name(&self) -> &str {
        &self.name
    }

    fn probe(&mut self) -> Result<(), ControlError> {
        self.read(Query::SensorVolts).map(|_| ())
    }

    fn write(&mut self, command: Command) -> Result<(), ControlError> {
        Err(unsupported_command(&self.name, command))
    }

    fn read(&mut self, query: Query) -> Result<f64, ControlError> {
        match query {
            Query::SensorVolts => self
                .input
                .read_volts()
                .map_err(|e| daq_error(&self.name, "analog read", e)),
            other => Err(unsupported_query(&self.name, other)),
        }
    }
}
