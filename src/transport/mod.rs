//! Physical transports underneath the instrument channels.
//!
//! Each transport speaks raw bytes, lines or registers and reports failures as
//! its own error type; the channels in [`crate::instrument`] translate those
//! into [`crate::ControlError`].

pub mod daqmx;
pub mod modbus;
pub mod serial;

pub use daqmx::{AnalogIn, AnalogOut, Daqmx, DaqmxError, DigitalOut};
pub use modbus::{ModbusError, ModbusRtu, RegisterBus};
pub use serial::{LineLink, SerialLine};
