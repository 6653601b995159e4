use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::{Quantity, ValidRange};

/// Missing sections fall back to their `Default`. Optional devices
/// (`supply.gpib_address`, `heater.secondary`) are absent unless the file names them.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub supply: SupplyConfig,
    pub pump: PumpConfig,
    pub heater: HeaterConfig,
    pub sensor: SensorConfig,
    pub daq: DaqConfig,
    pub limits: LimitsConfig,
    pub timing: TimingConfig,
    pub data_log: DataLogConfig,
    pub console: ConsoleConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SupplyConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Bus address when the supply sits behind a GPIB-to-serial bridge
    #[serde(default)]
    pub gpib_address: Option<u8>,
    pub read_timeout_ms: u64,
    pub terminator: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum PumpConfig {
    /// Pump driven by a DAQ digital start line and an analog rate line
    Daq {
        start_line: String,
        rate_line: String,
        max_volts: f64,
        start_active_low: bool,
    },
    /// Syringe pump with its own serial command set
    Serial {
        port: String,
        baud_rate: u32,
        diameter_mm: f64,
        direction: PumpDirection,
    },
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PumpDirection {
    Infuse,
    #[default]
    Withdraw,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct HeaterConfig {
    pub primary: PidControllerConfig,
    #[serde(default)]
    pub secondary: Option<SecondaryHeaterConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PidControllerConfig {
    pub port: String,
    pub baud_rate: u32,
    pub slave_address: u8,
    pub status_register: u16,
    pub present_value_register: u16,
    pub setpoint_register: u16,
    /// Implied decimal places of the register values
    pub decimals: u8,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SecondaryHeaterConfig {
    pub controller: PidControllerConfig,
    /// Factor from °C to the raw register value, including the register
    /// resolution; `controller.decimals` must therefore be 0.
    pub setpoint_scale: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SensorConfig {
    pub input_line: String,
    pub min_volts: f64,
    pub max_volts: f64,
    /// MΩ per volt of meter output
    pub resistivity_scale: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct DaqConfig {
    /// Explicit path to the NI-DAQmx shared library
    pub library_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LimitsConfig {
    pub voltage: [f64; 2],
    pub current: [f64; 2],
    pub flow: [f64; 2],
    pub temperature: [f64; 2],
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval_ms: u64,
    pub standby_log_interval_secs: u64,
    pub running_log_interval_secs: u64,
    pub device_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DataLogConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ConsoleConfig {
    pub verbosity: String,
}

impl Default for SupplyConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            gpib_address: Some(8),
            read_timeout_ms: 1000,
            terminator: "\n".to_string(),
        }
    }
}

impl Default for PumpConfig {
    fn default() -> Self {
        PumpConfig::Daq {
            start_line: "Dev1/port0/line15".to_string(),
            rate_line: "cDAQ1Mod1/ao3".to_string(),
            max_volts: 10.0,
            start_active_low: true,
        }
    }
}

impl Default for HeaterConfig {
    fn default() -> Self {
        Self {
            primary: PidControllerConfig::default(),
            secondary: Some(SecondaryHeaterConfig::default()),
        }
    }
}

impl Default for PidControllerConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB1".to_string(),
            baud_rate: 19200,
            slave_address: 247,
            status_register: 0,
            present_value_register: 1000,
            setpoint_register: 1200,
            decimals: 1,
            timeout_ms: 500,
        }
    }
}

impl Default for SecondaryHeaterConfig {
    fn default() -> Self {
        Self {
            controller: PidControllerConfig {
                port: "/dev/ttyUSB2".to_string(),
                baud_rate: 19200,
                slave_address: 1,
                status_register: 0x1000,
                present_value_register: 0x1000,
                setpoint_register: 0x1001,
                decimals: 0,
                timeout_ms: 500,
            },
            setpoint_scale: 10.0,
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            input_line: "Dev1/ai6".to_string(),
            min_volts: 0.0,
            max_volts: 10.0,
            resistivity_scale: 2.0,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            voltage: [0.0, 61.425],
            current: [0.0, 1000.0],
            flow: [0.0, 2000.0],
            temperature: [0.0, 100.0],
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            standby_log_interval_secs: 300,
            running_log_interval_secs: 5,
            device_timeout_ms: 2000,
        }
    }
}

impl Default for DataLogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("elec_data.csv"),
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            verbosity: "info".to_string(),
        }
    }
}

impl LimitsConfig {
    pub fn range(&self, quantity: Quantity) -> ValidRange {
        let [min, max] = match quantity {
            Quantity::Voltage => self.voltage,
            Quantity::Current => self.current,
            Quantity::Flow => self.flow,
            Quantity::Temperature => self.temperature,
        };
        ValidRange::new(min, max)
    }
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn standby_log_interval(&self) -> Duration {
        Duration::from_secs(self.standby_log_interval_secs)
    }

    pub fn running_log_interval(&self) -> Duration {
        Duration::from_secs(self.running_log_interval_secs)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.device_timeout_ms)
    }
}

impl AppConfig {
    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.supply.port.trim().is_empty() {
            return Err(ConfigError::Message("supply.port must not be empty".into()));
        }
        match &self.pump {
            PumpConfig::Daq {
                start_line,
                rate_line,
                max_volts,
                ..
            } => {
                if start_line.is_empty() || rate_line.is_empty() {
                    return Err(ConfigError::Message("pump DAQ lines must be set".into()));
                }
                if *max_volts <= 0.0 {
                    return Err(ConfigError::Message("pump.max_volts must be positive".into()));
                }
            }
            PumpConfig::Serial {
                port, diameter_mm, ..
            } => {
                if port.trim().is_empty() {
                    return Err(ConfigError::Message("pump.port must not be empty".into()));
                }
                if *diameter_mm <= 0.0 {
                    return Err(ConfigError::Message(
                        "pump.diameter_mm must be positive".into(),
                    ));
                }
            }
        }
        if self.heater.primary.port.trim().is_empty() {
            return Err(ConfigError::Message(
                "heater.primary.port must not be empty".into(),
            ));
        }
        if let Some(secondary) = &self.heater.secondary {
            if secondary.setpoint_scale <= 0.0 {
                return Err(ConfigError::Message(
                    "heater.secondary.setpoint_scale must be positive".into(),
                ));
            }
            if secondary.controller.decimals != 0 {
                return Err(ConfigError::Message(
                    "heater.secondary.controller.decimals must be 0; put the register resolution in setpoint_scale".into(),
                ));
            }
            if secondary.controller.port.trim().is_empty() {
                return Err(ConfigError::Message(
                    "heater.secondary.controller.port must not be empty".into(),
                ));
            }
        }
        if self.sensor.resistivity_scale <= 0.0 {
            return Err(ConfigError::Message(
                "sensor.resistivity_scale must be positive".into(),
            ));
        }
        for quantity in Quantity::ALL {
            let range = self.limits.range(quantity);
            if !(range.min <= range.max) {
                return Err(ConfigError::Message(format!(
                    "limits.{quantity}: min {} exceeds max {}",
                    range.min, range.max
                )));
            }
        }
        let timing = &self.timing;
        if timing.poll_interval_ms == 0
            || timing.standby_log_interval_secs == 0
            || timing.running_log_interval_secs == 0
            || timing.device_timeout_ms == 0
        {
            return Err(ConfigError::Message("timing periods must be positive".into()));
        }
        Ok(())
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    // Section defaults come from #[serde(default)] when a file is present
    let mut builder = Config::builder();
    let mut config_file_found = false;

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
            config_file_found = true;
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        let possible_paths = ["config.toml", "electro_control.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                config_file_found = true;
                break;
            }
        }
    }

    // Without a file the full stand layout is the starting point
    if !config_file_found {
        builder = builder.add_source(Config::try_from(&AppConfig::default())?);
    }

    // Environment overrides, e.g. ELECTRO_CONTROL__SUPPLY__PORT=COM3
    builder = builder.add_source(
        Environment::with_prefix("ELECTRO_CONTROL")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?.try_deserialize::<AppConfig>()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn default_ranges_match_stand_limits() {
        let limits = LimitsConfig::default();
        assert_eq!(limits.range(Quantity::Voltage), ValidRange::new(0.0, 61.425));
        assert_eq!(limits.range(Quantity::Flow), ValidRange::new(0.0, 2000.0));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let mut config = AppConfig::default();
        config.limits.temperature = [90.0, 10.0];
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = load_config(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[supply]
port = "COM3"
baud_rate = 9600
read_timeout_ms = 800
terminator = "\n"

[pump]
backend = "serial"
port = "COM1"
baud_rate = 19200
diameter_mm = 26.7
direction = "withdraw"

[timing]
poll_interval_ms = 250
standby_log_interval_secs = 300
running_log_interval_secs = 5
device_timeout_ms = 2000
"#
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.supply.port, "COM3");
        assert_eq!(config.timing.poll_interval(), Duration::from_millis(250));
        assert!(matches!(config.pump, PumpConfig::Serial { .. }));
        assert_eq!(config.heater.primary.setpoint_register, 1200);
    }

    fn load_toml(contents: &str) -> Result<AppConfig, ConfigError> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        load_config(Some(file.path()))
    }

    #[test]
    fn single_heater_stand_has_no_secondary_or_bridge() {
        let config = load_toml(
            r#"
[supply]
port = "/dev/ttyS0"

[heater.primary]
port = "/dev/ttyUSB1"
baud_rate = 19200
slave_address = 247
status_register = 0
present_value_register = 1000
setpoint_register = 1200
decimals = 1
timeout_ms = 500
"#,
        )
        .unwrap();

        assert!(config.heater.secondary.is_none());
        assert_eq!(config.supply.gpib_address, None);
        assert_eq!(config.supply.port, "/dev/ttyS0");
        assert_eq!(config.supply.baud_rate, 9600);
        assert_eq!(config.timing.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn secondary_heater_is_enabled_by_its_table() {
        let config = load_toml(
            r#"
[supply]
gpib_address = 8

[heater.secondary]
setpoint_scale = 10.0
"#,
        )
        .unwrap();

        assert_eq!(config.supply.gpib_address, Some(8));
        let secondary = config.heater.secondary.unwrap();
        assert_eq!(secondary.controller.port, "/dev/ttyUSB2");
        assert_eq!(secondary.setpoint_scale, 10.0);
    }

    #[test]
    fn scaled_secondary_register_is_rejected() {
        let mut config = AppConfig::default();
        if let Some(secondary) = config.heater.secondary.as_mut() {
            secondary.controller.decimals = 1;
        }
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("decimals"));
    }
}
