use log::trace;
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

/// Line-oriented request/response link (SCPI-style supplies, syringe pumps).
pub trait LineLink: Send {
    /// Send one command line without waiting for an answer.
    fn send(&mut self, line: &str) -> io::Result<()>;

    /// Send one command line and return the trimmed answer line.
    fn query(&mut self, line: &str) -> io::Result<String>;
}

/// [`LineLink`] over a serial port.
pub struct SerialLine {
    port: Box<dyn SerialPort>,
    name: String,
    terminator: String,
    response_terminator: char,
    timeout: Duration,
}

impl SerialLine {
    /// Open `port_name` at 8N1 with the given read timeout.
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        timeout: Duration,
        terminator: &str,
    ) -> io::Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;

        Ok(Self {
            port,
            name: port_name.to_string(),
            terminator: terminator.to_string(),
            response_terminator: '\n',
            timeout,
        })
    }

    /// Character that ends an answer (default `'\n'`).
    pub fn with_response_terminator(mut self, terminator: char) -> Self {
        self.response_terminator = terminator;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl LineLink for SerialLine {
    fn send(&mut self, line: &str) -> io::Result<()> {
        let cmd = format!("{}{}", line, self.terminator);
        trace!("Sending to {}: '{}'", self.name, cmd.escape_default());
        self.port.write_all(cmd.as_bytes())?;
        self.port.flush()
    }

    fn query(&mut self, line: &str) -> io::Result<String> {
        // Drop stale bytes from an earlier timed-out answer
        let _ = self.port.clear(serialport::ClearBuffer::Input);
        self.send(line)?;

        let mut buffer = [0u8; 256];
        let mut response = String::new();
        let start = Instant::now();

        while start.elapsed() < self.timeout {
            match self.port.read(&mut buffer) {
                Ok(n) if n > 0 => {
                    response.push_str(&String::from_utf8_lossy(&buffer[..n]));
                    if response.contains(self.response_terminator) {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e),
            }
        }

        trace!("Received from {}: '{}'", self.name, response.escape_default());

        if !response.contains(self.response_terminator) {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no complete answer to '{line}' from {}", self.name),
            ));
        }

        Ok(response.trim().to_string())
    }
}
