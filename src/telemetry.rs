use chrono::Local;
use log::{debug, warn};

use crate::instrument::{InstrumentChannel, Instruments, Query};
use crate::types::{RunState, TelemetrySample};

/// Round to a fixed number of decimal places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Reads back every instrument once per tick and derives the computed values.
pub struct TelemetryPoller {
    resistivity_scale: f64,
}

impl TelemetryPoller {
    pub fn new(resistivity_scale: f64) -> Self {
        Self { resistivity_scale }
    }

    /// One poll tick.
    ///
    /// Reads run in a fixed order and a failed read never aborts the tick;
    /// its field is left `None`. `flow` is the commanded rate since the pump
    /// has no read-back.
    pub fn poll(
        &self,
        instruments: &mut Instruments,
        flow: Option<f64>,
        run_state: RunState,
    ) -> TelemetrySample {
        let resistivity = read(instruments.sensor.as_mut(), Query::SensorVolts)
            .map(|volts| round_to(volts * self.resistivity_scale, 2));

        let voltage = read(instruments.supply.as_mut(), Query::OutputVoltage).map(|v| round_to(v, 2));
        let amps = read(instruments.supply.as_mut(), Query::OutputCurrent).map(|a| round_to(a, 2));

        let temperature = read(instruments.heater.as_mut(), Query::PresentValue);

        let power = match (voltage, amps) {
            (Some(v), Some(a)) => Some(round_to(v * a, 4)),
            _ => None,
        };

        TelemetrySample {
            timestamp: Local::now(),
            voltage,
            current: amps.map(|a| round_to(a * 1000.0, 2)),
            power,
            resistivity,
            flow,
            temperature,
            run_state,
        }
    }
}

fn read(channel: &mut dyn InstrumentChannel, query: Query) -> Option<f64> {
    match channel.read(query) {
        Ok(value) => {
            debug!("{} {:?} = {}", channel.name(), query, value);
            Some(value)
        }
        Err(e) => {
            warn!("{} {:?} failed: {}", channel.name(), query, e);
            None
        }
    }
}

/// Telemetry fields shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Voltage,
    Current,
    Power,
    Resistivity,
    Flow,
    Temperature,
}

impl Field {
    pub const ALL: [Field; 6] = [
        Field::Voltage,
        Field::Current,
        Field::Power,
        Field::Resistivity,
        Field::Flow,
        Field::Temperature,
    ];

    fn of(self, sample: &TelemetrySample) -> Option<f64> {
        match self {
            Field::Voltage => sample.voltage,
            Field::Current => sample.current,
            Field::Power => sample.power,
            Field::Resistivity => sample.resistivity,
            Field::Flow => sample.flow,
            Field::Temperature => sample.temperature,
        }
    }
}

/// Display state: the last good value per field, and which fields failed on
/// the most recent tick.
#[derive(Debug, Clone, Default)]
pub struct TelemetryView {
    values: [Option<f64>; 6],
    stale: [bool; 6],
}

impl TelemetryView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, sample: &TelemetrySample) {
        for (i, field) in Field::ALL.into_iter().enumerate() {
            match field.of(sample) {
                Some(value) => {
                    self.values[i] = Some(value);
                    self.stale[i] = false;
                }
                None => self.stale[i] = true,
            }
        }
    }

    pub fn value(&self, field: Field) -> Option<f64> {
        self.values[field as usize]
    }

    pub fn is_stale(&self, field: Field) -> bool {
        self.stale[field as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::instrument::tests::mock_instruments;

    #[test]
    fn rounding() {
        assert_eq!(round_to(4.567, 2), 4.57);
        assert_eq!(round_to(2.5012345, 4), 2.5012);
    }

    #[test]
    fn derives_resistivity_current_and_power() {
        let (mut instruments, stand) = mock_instruments();
        stand.sensor.lock().read_default = Some(4.6);
        stand.supply.lock().read_values.extend([Ok(10.024), Ok(0.254)]);
        stand.heater.lock().read_default = Some(40.1);

        let sample = TelemetryPoller::new(2.0).poll(&mut instruments, Some(100.0), RunState::Running);

        assert_eq!(sample.resistivity, Some(9.2));
        assert_eq!(sample.voltage, Some(10.02));
        assert_eq!(sample.current, Some(250.0));
        assert_eq!(sample.power, Some(2.505));
        assert_eq!(sample.temperature, Some(40.1));
        assert_eq!(sample.flow, Some(100.0));
        assert_eq!(sample.run_state, RunState::Running);
        assert_eq!(
            stand.supply.lock().reads,
            vec![Query::OutputVoltage, Query::OutputCurrent]
        );
    }

    #[test]
    fn supply_timeout_does_not_abort_the_tick() {
        let (mut instruments, stand) = mock_instruments();
        stand.sensor.lock().read_default = Some(1.0);
        stand
            .supply
            .lock()
            .read_values
            .extend([Err(ErrorKind::DeviceTimeout), Err(ErrorKind::DeviceTimeout)]);
        stand.heater.lock().read_default = Some(25.0);

        let sample = TelemetryPoller::new(2.0).poll(&mut instruments, None, RunState::Standby);

        assert_eq!(sample.resistivity, Some(2.0));
        assert_eq!(sample.temperature, Some(25.0));
        assert_eq!(sample.voltage, None);
        assert_eq!(sample.current, None);
        assert_eq!(sample.power, None);
        assert_eq!(stand.heater.lock().reads, vec![Query::PresentValue]);
    }

    #[test]
    fn view_keeps_last_known_good() {
        let mut view = TelemetryView::new();
        let mut sample = TelemetrySample::empty(RunState::Running);
        sample.voltage = Some(10.02);
        view.update(&sample);
        assert_eq!(view.value(Field::Voltage), Some(10.02));
        assert!(!view.is_stale(Field::Voltage));
        assert!(view.is_stale(Field::Power));

        view.update(&TelemetrySample::empty(RunState::Running));
        assert_eq!(view.value(Field::Voltage), Some(10.02));
        assert!(view.is_stale(Field::Voltage));
    }
}
