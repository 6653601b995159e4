//! Minimal Modbus RTU master for PID temperature controllers.
//!
//! Only the two function codes the controllers need are implemented:
//! read holding registers (0x03, one register) and write multiple registers
//! (0x10, one register). Frames carry a CRC-16/MODBUS trailer, low byte first.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::{CRC_16_MODBUS, Crc};
use log::trace;
use std::io::{self, Cursor, Read, Write};
use std::time::Duration;
use thiserror::Error;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

const READ_HOLDING_REGISTERS: u8 = 0x03;
const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
const EXCEPTION_FLAG: u8 = 0x80;

#[derive(Error, Debug)]
pub enum ModbusError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("CRC mismatch: computed {computed:#06x}, received {received:#06x}")]
    Crc { computed: u16, received: u16 },
    #[error("Slave exception code {0:#04x}")]
    Exception(u8),
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ModbusError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ModbusError::Io(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock))
    }
}

/// Register-addressed access to one controller.
pub trait RegisterBus: Send {
    fn read_register(&mut self, register: u16) -> Result<u16, ModbusError>;
    fn write_register(&mut self, register: u16, value: u16) -> Result<(), ModbusError>;
}

/// Modbus RTU master bound to one slave address.
pub struct ModbusRtu<P> {
    port: P,
    slave: u8,
}

impl ModbusRtu<Box<dyn serialport::SerialPort>> {
    /// Open a serial line at 8N1 for RTU framing.
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        slave: u8,
        timeout: Duration,
    ) -> Result<Self, ModbusError> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .open()
            .map_err(io::Error::from)?;
        Ok(Self::new(port, slave))
    }
}

impl<P: Read + Write + Send> ModbusRtu<P> {
    pub fn new(port: P, slave: u8) -> Self {
        Self { port, slave }
    }

    pub fn slave(&self) -> u8 {
        self.slave
    }

    fn transact(&mut self, request: &[u8], response_len: usize) -> Result<Vec<u8>, ModbusError> {
        trace!("Modbus TX slave {}: {:02x?}", self.slave, request);
        self.port.write_all(request)?;
        self.port.flush()?;

        let mut response = vec![0u8; 2];
        self.port.read_exact(&mut response)?;

        if response[0] != self.slave {
            return Err(ModbusError::UnexpectedResponse(format!(
                "answer from slave {} while talking to {}",
                response[0], self.slave
            )));
        }

        let remaining = if response[1] & EXCEPTION_FLAG != 0 {
            3
        } else {
            response_len - 2
        };
        let mut tail = vec![0u8; remaining];
        self.port.read_exact(&mut tail)?;
        response.extend_from_slice(&tail);
        trace!("Modbus RX slave {}: {:02x?}", self.slave, response);

        check_crc(&response)?;

        if response[1] & EXCEPTION_FLAG != 0 {
            return Err(ModbusError::Exception(response[2]));
        }
        if response[1] != request[1] {
            return Err(ModbusError::UnexpectedResponse(format!(
                "function {:#04x} answered with {:#04x}",
                request[1], response[1]
            )));
        }
        Ok(response)
    }
}

impl<P: Read + Write + Send> RegisterBus for ModbusRtu<P> {
    fn read_register(&mut self, register: u16) -> Result<u16, ModbusError> {
        let request = encode_read_request(self.slave, register);
        let response = self.transact(&request, 7)?;

        if response[2] != 2 {
            return Err(ModbusError::UnexpectedResponse(format!(
                "byte count {} for a single register",
                response[2]
            )));
        }
        let mut cursor = Cursor::new(&response[3..5]);
        Ok(cursor.read_u16::<BigEndian>()?)
    }

    fn write_register(&mut self, register: u16, value: u16) -> Result<(), ModbusError> {
        let request = encode_write_request(self.slave, register, value);
        let response = self.transact(&request, 8)?;

        let mut cursor = Cursor::new(&response[2..6]);
        let echoed_register = cursor.read_u16::<BigEndian>()?;
        let echoed_count = cursor.read_u16::<BigEndian>()?;
        if echoed_register != register || echoed_count != 1 {
            return Err(ModbusError::UnexpectedResponse(format!(
                "write echo {echoed_register}/{echoed_count}, expected {register}/1"
            )));
        }
        Ok(())
    }
}

pub fn encode_read_request(slave: u8, register: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(slave);
    frame.push(READ_HOLDING_REGISTERS);
    // Writes into a Vec cannot fail
    let _ = frame.write_u16::<BigEndian>(register);
    let _ = frame.write_u16::<BigEndian>(1);
    append_crc(&mut frame);
    frame
}

pub fn encode_write_request(slave: u8, register: u16, value: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(11);
    frame.push(slave);
    frame.push(WRITE_MULTIPLE_REGISTERS);
    let _ = frame.write_u16::<BigEndian>(register);
    let _ = frame.write_u16::<BigEndian>(1);
    frame.push(2);
    let _ = frame.write_u16::<BigEndian>(value);
    append_crc(&mut frame);
    frame
}

fn append_crc(frame: &mut Vec<u8>) {
    let crc = MODBUS_CRC.checksum(frame);
    let _ = frame.write_u16::<LittleEndian>(crc);
}

fn check_crc(frame: &[u8]) -> Result<(), ModbusError> {
    if frame.len() < 4 {
        return Err(ModbusError::UnexpectedResponse("frame too short".into()));
    }
    let (body, trailer) = frame.split_at(frame.len() - 2);
    let computed = MODBUS_CRC.checksum(body);
    let received = Cursor::new(trailer).read_u16::<LittleEndian>()?;
    if computed != received {
        return Err(ModbusError::Crc { computed, received });
    }
    Ok(())
}
