use log::debug;
use std::time::Duration;

use super::{Command, InstrumentChannel, Query, unsupported_command, unsupported_query};
use crate::config::PidControllerConfig;
use crate::error::ControlError;
use crate::transport::{ModbusError, ModbusRtu, RegisterBus};

/// Register layout of one PID controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    pub status: u16,
    pub present_value: u16,
    pub setpoint: u16,
}

impl From<&PidControllerConfig> for RegisterMap {
    fn from(config: &PidControllerConfig) -> Self {
        Self {
            status: config.status_register,
            present_value: config.present_value_register,
            setpoint: config.setpoint_register,
        }
    }
}

/// PID temperature controller on a Modbus RTU line.
///
/// Register values are fixed-point with `decimals` implied places.
pub struct PidController<B: RegisterBus> {
    bus: B,
    name: String,
    registers: RegisterMap,
    decimals: u8,
}

impl PidController<ModbusRtu<Box<dyn serialport::SerialPort>>> {
    pub fn open(name: &str, config: &PidControllerConfig) -> Result<Self, ControlError> {
        let bus = ModbusRtu::open(
            &config.port,
            config.baud_rate,
            config.slave_address,
            Duration::from_millis(config.timeout_ms),
        )
        .map_err(|e| modbus_error(name, "open", e))?;
        let mut controller = Self::new(bus, name, RegisterMap::from(config), config.decimals);
        controller.probe()?;
        Ok(controller)
    }
}

impl<B: RegisterBus> PidController<B> {
    pub fn new(bus: B, name: &str, registers: RegisterMap, decimals: u8) -> Self {
        Self {
            bus,
            name: name.to_string(),
            registers,
            decimals,
        }
    }

    fn scale(&self) -> f64 {
        10f64.powi(i32::from(self.decimals))
    }

    /// Fixed-point register value for `value`, if it fits in a register.
    pub fn to_raw(&self, value: f64) -> Option<u16> {
        let raw = (value * self.scale()).round();
        (raw.is_finite() && (0.0..=f64::from(u16::MAX)).contains(&raw)).then_some(raw as u16)
    }
}

impl<B: RegisterBus> InstrumentChannel for PidController<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn probe(&mut self) -> Result<(), ControlError> {
        let status = self
            .bus
            .read_register(self.registers.status)
            .map_err(|e| modbus_error(&self.name, "status read", e))?;
        debug!("{} status register {:#06x}", self.name, status);
        Ok(())
    }

    fn write(&mut self, command: Command) -> Result<(), ControlError> {
        match command {
            Command::SetSetpoint(value) => {
                let raw = self.to_raw(value).ok_or_else(|| {
                    ControlError::Protocol(format!(
                        "{} setpoint {value} does not fit a register",
                        self.name
                    ))
                })?;
                debug!("{} setpoint register {} <- {raw}", self.name, self.registers.setpoint);
                self.bus
                    .write_register(self.registers.setpoint, raw)
                    .map_err(|e| modbus_error(&self.name, "setpoint write", e))
            }
            other => Err(unsupported_command(&self.name, other)),
        }
    }

    fn read(&mut self, query: Query) -> Result<f64, ControlError> {
        match query {
            Query::PresentValue => {
                let raw = self
                    .bus
                    .read_register(self.registers.present_value)
                    .map_err(|e| modbus_error(&self.name, "present value read", e))?;
                Ok(f64::from(raw) / self.scale())
            }
            other => Err(unsupported_query(&self.name, other)),
        }
    }
}

fn modbus_error(device: &str, operation: &str, err: ModbusError) -> ControlError {
    if err.is_timeout() {
        return ControlError::timeout(device, operation);
    }
    match err {
        ModbusError::Io(e) => ControlError::from_io(device, operation, e),
        other => ControlError::Protocol(format!("{device} {operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::transport::modbus::tests::{FakePort, with_crc};

    const OMEGA: RegisterMap = RegisterMap {
        status: 0,
        present_value: 1000,
        setpoint: 1200,
    };

    fn controller(reply: Vec<u8>, decimals: u8) -> PidController<ModbusRtu<FakePort>> {
        PidController::new(ModbusRtu::new(FakePort::replying(reply), 247), "heater", OMEGA, decimals)
    }

    #[test]
    fn present_value_uses_implied_decimals() {
        // 0x0191 = 401 -> 40.1 degC
        let mut heater = controller(with_crc(vec![247, 0x03, 0x02, 0x01, 0x91]), 1);
        assert_eq!(heater.read(Query::PresentValue).unwrap(), 40.1);
    }

    #[test]
    fn setpoint_is_scaled_before_writing() {
        let mut heater = controller(with_crc(vec![247, 0x10, 0x04, 0xB0, 0x00, 0x01]), 1);
        heater.write(Command::SetSetpoint(40.0)).unwrap();
    }

    #[test]
    fn raw_conversion_bounds() {
        let heater = controller(Vec::new(), 1);
        assert_eq!(heater.to_raw(40.06), Some(401));
        assert_eq!(heater.to_raw(0.0), Some(0));
        assert_eq!(heater.to_raw(-1.0), None);
        assert_eq!(heater.to_raw(1e9), None);
    }

    #[test]
    fn mirror_controller_writes_raw_value() {
        let map = RegisterMap {
            status: 0x1000,
            present_value: 0x1000,
            setpoint: 0x1001,
        };
        let reply = with_crc(vec![1, 0x10, 0x10, 0x01, 0x00, 0x01]);
        let mut cell = PidController::new(ModbusRtu::new(FakePort::replying(reply), 1), "cell heater", map, 0);
        assert_eq!(cell.to_raw(400.0), Some(400));
        cell.write(Command::SetSetpoint(400.0)).unwrap();
        assert_eq!(cell.name(), "cell heater");
    }

    #[test]
    fn silent_controller_times_out() {
        let mut heater = controller(Vec::new(), 1);
        let err = heater.read(Query::PresentValue).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceTimeout);
        assert!(heater.probe().is_err());
    }

    #[test]
    fn exception_is_a_protocol_failure() {
        let mut heater = controller(with_crc(vec![247, 0x90, 0x02]), 1);
        let err = heater.write(Command::SetSetpoint(40.0)).unwrap_err();
        assert!(matches!(err, ControlError::Protocol(_)));
    }
}
