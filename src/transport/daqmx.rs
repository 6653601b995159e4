//! NI-DAQmx line I/O through the vendor runtime library, loaded at startup.
//!
//! Only on-demand, single-sample operations are bound: one analog input read,
//! one analog output write, one digital line write. Every line lives in its
//! own task which is stopped and cleared on drop.

use libloading::{Library, Symbol};
use log::debug;
use std::ffi::{CStr, CString, c_char, c_double};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[cfg(target_pointer_width = "64")]
type TaskHandle = u64;
#[cfg(target_pointer_width = "32")]
type TaskHandle = u32;

#[cfg(windows)]
const DEFAULT_LIBRARY: &str = "nicaiu.dll";
#[cfg(not(windows))]
const DEFAULT_LIBRARY: &str = "libnidaqmx.so";

const DAQMX_SUCCESS: i32 = 0;
const DAQMX_VAL_CFG_DEFAULT: i32 = -1;
const DAQMX_VAL_VOLTS: i32 = 10348;
const DAQMX_VAL_CHAN_FOR_ALL_LINES: i32 = 1;
const DAQMX_VAL_GROUP_BY_CHANNEL: u32 = 0;
const DAQMX_ERROR_SAMPLES_NOT_YET_AVAILABLE: i32 = -200284;
const DAQMX_ERROR_WAIT_UNTIL_DONE_DID_NOT_INDICATE_DONE: i32 = -200560;
const DAQMX_ERROR_OPERATION_TIMED_OUT: i32 = -200474;

type FnCreateTask = unsafe extern "C" fn(name: *const c_char, task: *mut TaskHandle) -> i32;
type FnTaskControl = unsafe extern "C" fn(task: TaskHandle) -> i32;
type FnCreateAIVoltageChan = unsafe extern "C" fn(
    task: TaskHandle,
    physical_channel: *const c_char,
    name_to_assign: *const c_char,
    terminal_config: i32,
    min_val: c_double,
    max_val: c_double,
    units: i32,
    custom_scale_name: *const c_char,
) -> i32;
type FnCreateAOVoltageChan = unsafe extern "C" fn(
    task: TaskHandle,
    physical_channel: *const c_char,
    name_to_assign: *const c_char,
    min_val: c_double,
    max_val: c_double,
    units: i32,
    custom_scale_name: *const c_char,
) -> i32;
type FnCreateDOChan = unsafe extern "C" fn(
    task: TaskHandle,
    lines: *const c_char,
    name_to_assign: *const c_char,
    line_grouping: i32,
) -> i32;
type FnReadAnalogScalarF64 = unsafe extern "C" fn(
    task: TaskHandle,
    timeout: c_double,
    value: *mut c_double,
    reserved: *mut u32,
) -> i32;
type FnWriteAnalogScalarF64 = unsafe extern "C" fn(
    task: TaskHandle,
    auto_start: u32,
    timeout: c_double,
    value: c_double,
    reserved: *mut u32,
) -> i32;
type FnWriteDigitalLines = unsafe extern "C" fn(
    task: TaskHandle,
    samples_per_channel: i32,
    auto_start: u32,
    timeout: c_double,
    data_layout: u32,
    write_array: *const u8,
    samples_written: *mut i32,
    reserved: *mut u32,
) -> i32;
type FnGetExtendedErrorInfo = unsafe extern "C" fn(buffer: *mut c_char, buffer_size: u32) -> i32;

#[derive(Error, Debug)]
pub enum DaqmxError {
    #[error("NI-DAQmx runtime not available: {0}")]
    Library(String),
    #[error("NI-DAQmx error {code}: {message}")]
    Status { code: i32, message: String },
    #[error("Invalid channel name: {0}")]
    ChannelName(String),
}

impl DaqmxError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            DaqmxError::Status { code, .. } if *code == DAQMX_ERROR_SAMPLES_NOT_YET_AVAILABLE
                || *code == DAQMX_ERROR_WAIT_UNTIL_DONE_DID_NOT_INDICATE_DONE
                || *code == DAQMX_ERROR_OPERATION_TIMED_OUT
        )
    }
}

/// Single analog input sample source.
pub trait AnalogIn: Send {
    fn read_volts(&mut self) -> Result<f64, DaqmxError>;
}

/// Single analog output line.
pub trait AnalogOut: Send {
    fn write_volts(&mut self, volts: f64) -> Result<(), DaqmxError>;
}

/// Single digital output line.
pub trait DigitalOut: Send {
    fn write_level(&mut self, high: bool) -> Result<(), DaqmxError>;
}

/// Loaded NI-DAQmx runtime. Shared by every task created from it.
pub struct Daqmx {
    _lib: Library,
    create_task: FnCreateTask,
    start_task: FnTaskControl,
    stop_task: FnTaskControl,
    clear_task: FnTaskControl,
    create_ai_voltage_chan: FnCreateAIVoltageChan,
    create_ao_voltage_chan: FnCreateAOVoltageChan,
    create_do_chan: FnCreateDOChan,
    read_analog_scalar: FnReadAnalogScalarF64,
    write_analog_scalar: FnWriteAnalogScalarF64,
    write_digital_lines: FnWriteDigitalLines,
    get_extended_error_info: FnGetExtendedErrorInfo,
}

impl Daqmx {
    /// Load the runtime from `path`, or from the platform default library name.
    pub fn load(path: Option<&Path>) -> Result<Arc<Self>, DaqmxError> {
        let lib = match path {
            Some(path) => unsafe { Library::new(path) },
            None => unsafe { Library::new(DEFAULT_LIBRARY) },
        }
        .map_err(|e| DaqmxError::Library(e.to_string()))?;

        macro_rules! sym {
            ($t:ty, $name:expr) => {{
                let s: Symbol<$t> = unsafe { lib.get($name) }
                    .map_err(|e| DaqmxError::Library(e.to_string()))?;
                *s
            }};
        }

        let daqmx = Self {
            create_task: sym!(FnCreateTask, b"DAQmxCreateTask\0"),
            start_task: sym!(FnTaskControl, b"DAQmxStartTask\0"),
            stop_task: sym!(FnTaskControl, b"DAQmxStopTask\0"),
            clear_task: sym!(FnTaskControl, b"DAQmxClearTask\0"),
            create_ai_voltage_chan: sym!(FnCreateAIVoltageChan, b"DAQmxCreateAIVoltageChan\0"),
            create_ao_voltage_chan: sym!(FnCreateAOVoltageChan, b"DAQmxCreateAOVoltageChan\0"),
            create_do_chan: sym!(FnCreateDOChan, b"DAQmxCreateDOChan\0"),
            read_analog_scalar: sym!(FnReadAnalogScalarF64, b"DAQmxReadAnalogScalarF64\0"),
            write_analog_scalar: sym!(FnWriteAnalogScalarF64, b"DAQmxWriteAnalogScalarF64\0"),
            write_digital_lines: sym!(FnWriteDigitalLines, b"DAQmxWriteDigitalLines\0"),
            get_extended_error_info: sym!(FnGetExtendedErrorInfo, b"DAQmxGetExtendedErrorInfo\0"),
            _lib: lib,
        };
        debug!("Loaded NI-DAQmx runtime");
        Ok(Arc::new(daqmx))
    }

    fn check(&self, code: i32) -> Result<(), DaqmxError> {
        if code >= DAQMX_SUCCESS {
            return Ok(());
        }
        let mut buf = vec![0 as c_char; 2048];
        let message = unsafe {
            (self.get_extended_error_info)(buf.as_mut_ptr(), buf.len() as u32);
            CStr::from_ptr(buf.as_ptr()).to_string_lossy().trim().to_string()
        };
        Err(DaqmxError::Status { code, message })
    }

    fn new_task(self: &Arc<Self>, line: &str) -> Result<Task, DaqmxError> {
        let mut handle: TaskHandle = 0;
        self.check(unsafe { (self.create_task)(c"".as_ptr(), &mut handle) })?;
        Ok(Task {
            daqmx: Arc::clone(self),
            handle,
            line: line.to_string(),
        })
    }

    /// Analog input task on `line` (e.g. `Dev1/ai6`) reading volts.
    pub fn analog_input(
        self: &Arc<Self>,
        line: &str,
        min_volts: f64,
        max_volts: f64,
        timeout: Duration,
    ) -> Result<AnalogInputTask, DaqmxError> {
        let task = self.new_task(line)?;
        let name = channel_name(line)?;
        self.check(unsafe {
            (self.create_ai_voltage_chan)(
                task.handle,
                name.as_ptr(),
                std::ptr::null(),
                DAQMX_VAL_CFG_DEFAULT,
                min_volts,
                max_volts,
                DAQMX_VAL_VOLTS,
                std::ptr::null(),
            )
        })?;
        self.check(unsafe { (self.start_task)(task.handle) })?;
        Ok(AnalogInputTask { task, timeout })
    }

    /// Analog output task on `line` (e.g. `cDAQ1Mod1/ao3`).
    pub fn analog_output(
        self: &Arc<Self>,
        line: &str,
        min_volts: f64,
        max_volts: f64,
        timeout: Duration,
    ) -> Result<AnalogOutputTask, DaqmxError> {
        let task = self.new_task(line)?;
        let name = channel_name(line)?;
        self.check(unsafe {
            (self.create_ao_voltage_chan)(
                task.handle,
                name.as_ptr(),
                std::ptr::null(),
                min_volts,
                max_volts,
                DAQMX_VAL_VOLTS,
                std::ptr::null(),
            )
        })?;
        self.check(unsafe { (self.start_task)(task.handle) })?;
        Ok(AnalogOutputTask { task, timeout })
    }

    /// Digital output task on a single `line` (e.g. `Dev1/port0/line15`).
    pub fn digital_output(
        self: &Arc<Self>,
        line: &str,
        timeout: Duration,
    ) -> Result<DigitalOutputTask, DaqmxError> {
        let task = self.new_task(line)?;
        let name = channel_name(line)?;
        self.check(unsafe {
            (self.create_do_chan)(
                task.handle,
                name.as_ptr(),
                std::ptr::null(),
                DAQMX_VAL_CHAN_FOR_ALL_LINES,
            )
        })?;
        self.check(unsafe { (self.start_task)(task.handle) })?;
        Ok(DigitalOutputTask { task, timeout })
    }
}

fn channel_name(line: &str) -> Result<CString, DaqmxError> {
    CString::new(line).map_err(|_| DaqmxError::ChannelName(line.to_string()))
}

struct Task {
    daqmx: Arc<Daqmx>,
    handle: TaskHandle,
    line: String,
}

impl Drop for Task {
    fn drop(&mut self) {
        unsafe {
            let _ = (self.daqmx.stop_task)(self.handle);
            let _ = (self.daqmx.clear_task)(self.handle);
        }
        debug!("Cleared DAQmx task for {}", self.line);
    }
}

pub struct AnalogInputTask {
    task: Task,
    timeout: Duration,
}

impl AnalogIn for AnalogInputTask {
    fn read_volts(&mut self) -> Result<f64, DaqmxError> {
        let mut value: c_double = 0.0;
        let daqmx = &self.task.daqmx;
        daqmx.check(unsafe {
            (daqmx.read_analog_scalar)(
                self.task.handle,
                self.timeout.as_secs_f64(),
                &mut value,
                std::ptr::null_mut(),
            )
        })?;
        Ok(value)
    }
}

pub struct AnalogOutputTask {
    task: Task,
    timeout: Duration,
}

impl AnalogOut for AnalogOutputTask {
    fn write_volts(&mut self, volts: f64) -> Result<(), DaqmxError> {
        let daqmx = &self.task.daqmx;
        daqmx.check(unsafe {
            (daqmx.write_analog_scalar)(
                self.task.handle,
                1,
                self.timeout.as_secs_f64(),
                volts,
                std::ptr::null_mut(),
            )
        })
    }
}

pub struct DigitalOutputTask {
    task: Task,
    timeout: Duration,
}

impl DigitalOut for DigitalOutputTask {
    fn write_level(&mut self, high: bool) -> Result<(), DaqmxError> {
        let daqmx = &self.task.daqmx;
        let sample = [u8::from(high)];
        let mut written: i32 = 0;
        daqmx.check(unsafe {
            (daqmx.write_digital_lines)(
                self.task.handle,
                1,
                1,
                self.timeout.as_secs_f64(),
                DAQMX_VAL_GROUP_BY_CHANNEL,
                sample.as_ptr(),
                &mut written,
                std::ptr::null_mut(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_codes_are_recognised() {
        let err = DaqmxError::Status {
            code: DAQMX_ERROR_SAMPLES_NOT_YET_AVAILABLE,
            message: String::new(),
        };
        assert!(err.is_timeout());
        let err = DaqmxError::Status {
            code: -200220,
            message: "device not found".into(),
        };
        assert!(!err.is_timeout());
    }

    #[test]
    fn missing_runtime_is_reported() {
        let result = Daqmx::load(Some(Path::new("/nonexistent/libnidaqmx-test.so")));
        assert!(matches!(result, Err(DaqmxError::Library(_))));
    }

    #[test]
    fn interior_nul_in_line_is_rejected() {
        assert!(channel_name("Dev1/ai0\0x").is_err());
    }
}
