//! Uniform request/response access to the stand's instruments.
//!
//! Every physical device is reached through an [`InstrumentChannel`]. The
//! orchestrator, poller and shutdown sequencer only ever see this trait; the
//! wire idioms (SCPI-like lines, Modbus registers, DAQ lines) stay inside the
//! concrete channels.
//!
//! Channels are obtained only through their `open` constructors, which run the
//! liveness probe, so a channel value is always an opened session.

pub mod heater;
pub mod pump;
pub mod sensor;
pub mod supply;
pub mod worker;

use log::{error, info};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, PumpConfig};
use crate::error::ControlError;
use crate::transport::{Daqmx, DaqmxError};

pub use heater::PidController;
pub use pump::{DaqPump, SyringePump};
pub use sensor::ResistivityMeter;
pub use supply::PowerSupply;
pub use worker::ChannelHandle;

/// Commands accepted by [`InstrumentChannel::write`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Supply output voltage in V
    SetVoltage(f64),
    /// Supply current limit in mA
    SetCurrent(f64),
    /// Pump rate in mL/min
    SetFlowRate(f64),
    StartFlow,
    StopFlow,
    /// Heater setpoint in controller units
    SetSetpoint(f64),
}

/// Queries accepted by [`InstrumentChannel::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    /// Supply output voltage in V
    OutputVoltage,
    /// Supply output current in A
    OutputCurrent,
    /// Heater present value
    PresentValue,
    /// Raw sensor voltage
    SensorVolts,
}

/// One open session to one physical instrument.
pub trait InstrumentChannel: Send {
    fn name(&self) -> &str;

    /// Identity or status probe; fails if the device does not answer.
    fn probe(&mut self) -> Result<(), ControlError>;

    fn write(&mut self, command: Command) -> Result<(), ControlError>;

    fn read(&mut self, query: Query) -> Result<f64, ControlError>;
}

impl<T: InstrumentChannel + ?Sized> InstrumentChannel for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn probe(&mut self) -> Result<(), ControlError> {
        (**self).probe()
    }

    fn write(&mut self, command: Command) -> Result<(), ControlError> {
        (**self).write(command)
    }

    fn read(&mut self, query: Query) -> Result<f64, ControlError> {
        (**self).read(query)
    }
}

pub(crate) fn unsupported_command(device: &str, command: Command) -> ControlError {
    ControlError::Protocol(format!("{device} does not accept {command:?}"))
}

pub(crate) fn unsupported_query(device: &str, query: Query) -> ControlError {
    ControlError::Protocol(format!("{device} cannot answer {query:?}"))
}

pub(crate) fn daq_error(device: &str, operation: &str, err: DaqmxError) -> ControlError {
    if err.is_timeout() {
        ControlError::timeout(device, operation)
    } else {
        ControlError::unavailable(device, format!("{operation}: {err}"))
    }
}

/// Which device failed to come up at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Supply,
    Pump,
    PrimaryHeater,
    SecondaryHeater,
    Sensor,
}

impl DeviceRole {
    /// Process exit status reported when this device is missing at boot.
    pub fn exit_code(self) -> u8 {
        match self {
            DeviceRole::Supply => 3,
            DeviceRole::Pump => 4,
            DeviceRole::PrimaryHeater => 5,
            DeviceRole::SecondaryHeater => 6,
            DeviceRole::Sensor => 7,
        }
    }

    pub fn diagnostic(self) -> &'static str {
        match self {
            DeviceRole::Supply => "Power supply not connected",
            DeviceRole::Pump => "Pump not connected",
            DeviceRole::PrimaryHeater => "Heat controller disconnected or on incorrect port",
            DeviceRole::SecondaryHeater => "Cell heat controller disconnected or on incorrect port",
            DeviceRole::Sensor => "Resistivity meter input not available",
        }
    }
}

#[derive(Debug)]
pub struct BootFailure {
    pub role: DeviceRole,
    pub error: ControlError,
}

impl std::fmt::Display for BootFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.role.diagnostic(), self.error)
    }
}

impl std::error::Error for BootFailure {}

/// Every channel the controller drives, owned by the control loop.
pub struct Instruments {
    pub supply: Box<dyn InstrumentChannel>,
    pub pump: Box<dyn InstrumentChannel>,
    pub heater: Box<dyn InstrumentChannel>,
    pub secondary_heater: Option<Box<dyn InstrumentChannel>>,
    pub sensor: Box<dyn InstrumentChannel>,
}

impl Instruments {
    /// Open and probe every configured device. Any failure aborts startup.
    pub fn open_all(config: &AppConfig) -> Result<Self, BootFailure> {
        let timeout = config.timing.device_timeout();

        let supply = PowerSupply::open(&config.supply).map_err(boot_failure(DeviceRole::Supply))?;
        info!("Power supply connected");

        let heater =
            PidController::open("heater", &config.heater.primary).map_err(boot_failure(DeviceRole::PrimaryHeater))?;
        info!("Heat control connected");

        let secondary_heater = match &config.heater.secondary {
            Some(secondary) => {
                let channel = PidController::open("cell heater", &secondary.controller)
                    .map_err(boot_failure(DeviceRole::SecondaryHeater))?;
                info!("Cell heat control connected");
                Some(Box::new(channel) as Box<dyn InstrumentChannel>)
            }
            None => None,
        };

        // The resistivity meter always sits on the DAQ
        let daqmx = load_daqmx(config).map_err(boot_failure(DeviceRole::Sensor))?;

        let pump: Box<dyn InstrumentChannel> = match &config.pump {
            PumpConfig::Daq {
                start_line,
                rate_line,
                max_volts,
                start_active_low,
            } => Box::new(
                DaqPump::open(
                    &daqmx,
                    start_line,
                    rate_line,
                    *max_volts,
                    *start_active_low,
                    timeout,
                )
                .map_err(boot_failure(DeviceRole::Pump))?,
            ),
            PumpConfig::Serial {
                port,
                baud_rate,
                diameter_mm,
                direction,
            } => Box::new(
                SyringePump::open(port, *baud_rate, *diameter_mm, *direction, timeout)
                    .map_err(boot_failure(DeviceRole::Pump))?,
            ),
        };
        info!("Pump connected");

        let sensor = ResistivityMeter::open(&daqmx, &config.sensor, timeout)
            .map_err(boot_failure(DeviceRole::Sensor))?;
        info!("Resistivity meter connected");

        Ok(Self {
            supply: Box::new(supply),
            pump,
            heater: Box::new(heater),
            secondary_heater,
            sensor: Box::new(sensor),
        })
    }

    /// Move every channel onto its own worker thread.
    pub fn into_workers(self, timeout: Duration) -> Self {
        let wrap = |channel: Box<dyn InstrumentChannel>| -> Box<dyn InstrumentChannel> {
            Box::new(ChannelHandle::spawn(channel, timeout))
        };
        Self {
            supply: wrap(self.supply),
            pump: wrap(self.pump),
            heater: wrap(self.heater),
            secondary_heater: self.secondary_heater.map(&wrap),
            sensor: wrap(self.sensor),
        }
    }
}

fn boot_failure(role: DeviceRole) -> impl Fn(ControlError) -> BootFailure {
    move |error| BootFailure { role, error }
}

fn load_daqmx(config: &AppConfig) -> Result<Arc<Daqmx>, ControlError> {
    Daqmx::load(config.daq.library_path.as_deref()).map_err(|e| {
        error!("{e}");
        ControlError::unavailable("NI-DAQmx", e.to_string())
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Shared record of what a mock channel was asked to do.
    #[derive(Default)]
    pub(crate) struct MockLog {
        pub writes: Vec<Command>,
        pub reads: Vec<Query>,
        pub fail_writes: Vec<Command>,
        pub fail_all_writes: Option<ErrorKind>,
        pub read_values: VecDeque<Result<f64, ErrorKind>>,
        pub read_default: Option<f64>,
    }

    /// Scriptable channel; the test keeps a handle on its log.
    pub(crate) struct MockChannel {
        pub name: String,
        pub log: Arc<Mutex<MockLog>>,
    }

    impl MockChannel {
        pub fn new(name: &str) -> (Self, Arc<Mutex<MockLog>>) {
            let log = Arc::new(Mutex::new(MockLog::default()));
            (
                Self {
                    name: name.to_string(),
                    log: Arc::clone(&log),
                },
                log,
            )
        }
    }

    fn error_of(kind: ErrorKind, device: &str) -> ControlError {
        match kind {
            ErrorKind::DeviceTimeout => ControlError::timeout(device, "mock"),
            _ => ControlError::unavailable(device, "mock failure"),
        }
    }

    impl InstrumentChannel for MockChannel {
        fn name(&self) -> &str {
            &self.name
        }

        fn probe(&mut self) -> Result<(), ControlError> {
            Ok(())
        }

        fn write(&mut self, command: Command) -> Result<(), ControlError> {
            let mut log = self.log.lock();
            log.writes.push(command);
            if let Some(kind) = log.fail_all_writes {
                return Err(error_of(kind, &self.name));
            }
            if log.fail_writes.contains(&command) {
                return Err(error_of(ErrorKind::DeviceUnavailable, &self.name));
            }
            Ok(())
        }

        fn read(&mut self, query: Query) -> Result<f64, ControlError> {
            let mut log = self.log.lock();
            log.reads.push(query);
            match log.read_values.pop_front() {
                Some(Ok(value)) => Ok(value),
                Some(Err(kind)) => Err(error_of(kind, &self.name)),
                None => log
                    .read_default
                    .ok_or_else(|| error_of(ErrorKind::DeviceTimeout, &self.name)),
            }
        }
    }

    pub(crate) struct MockStand {
        pub supply: Arc<Mutex<MockLog>>,
        pub pump: Arc<Mutex<MockLog>>,
        pub heater: Arc<Mutex<MockLog>>,
        pub secondary: Arc<Mutex<MockLog>>,
        pub sensor: Arc<Mutex<MockLog>>,
    }

    pub(crate) fn mock_instruments() -> (Instruments, MockStand) {
        let (supply, supply_log) = MockChannel::new("supply");
        let (pump, pump_log) = MockChannel::new("pump");
        let (heater, heater_log) = MockChannel::new("heater");
        let (secondary, secondary_log) = MockChannel::new("cell heater");
        let (sensor, sensor_log) = MockChannel::new("sensor");
        (
            Instruments {
                supply: Box::new(supply),
                pump: Box::new(pump),
                heater: Box::new(heater),
                secondary_heater: Some(Box::new(secondary)),
                sensor: Box::new(sensor),
            },
            MockStand {
                supply: supply_log,
                pump: pump_log,
                heater: heater_log,
                secondary: secondary_log,
                sensor: sensor_log,
            },
        )
    }

    #[test]
    fn exit_codes_are_distinct() {
        let roles = [
            DeviceRole::Supply,
            DeviceRole::Pump,
            DeviceRole::PrimaryHeater,
            DeviceRole::SecondaryHeater,
            DeviceRole::Sensor,
        ];
        let mut codes: Vec<u8> = roles.iter().map(|r| r.exit_code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), roles.len());
        assert!(codes.iter().all(|c| *c != 0));
    }

    #[test]
    fn missing_supply_aborts_boot_with_its_exit_code() {
        let mut config = AppConfig::default();
        config.supply.port = "/dev/electro-control-no-such-port".to_string();

        let failure = match Instruments::open_all(&config) {
            Ok(_) => panic!("boot succeeded without a supply"),
            Err(failure) => failure,
        };
        assert_eq!(failure.role, DeviceRole::Supply);
        assert_eq!(failure.error.kind(), ErrorKind::DeviceUnavailable);
        assert_eq!(failure.role.exit_code(), 3);
    }

    #[test]
    fn boxed_channels_forward_calls() {
        let (channel, log) = MockChannel::new("boxed");
        let mut boxed: Box<dyn InstrumentChannel> = Box::new(channel);
        boxed.write(Command::StartFlow).unwrap();
        assert_eq!(log.lock().writes, vec![Command::StartFlow]);
        assert_eq!(boxed.name(), "boxed");
    }
}
